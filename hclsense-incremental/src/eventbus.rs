//! Event bus
//!
//! Topic-based publish/subscribe router. Every subscriber gets its own
//! bounded channel per event kind. A subscriber may also hand the bus the
//! receiving end of a `done` channel; publishing then waits for that
//! subscriber to report the IDs of the jobs it enqueued for the event.

use crate::context::RequestContext;
use crate::job::JobIds;
use hclsense_types::{DirHandle, FileChangeType};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Capacity of every subscriber channel
pub const CHANNEL_SIZE: usize = 10;

/// A directory with relevant files was found
#[derive(Debug, Clone)]
pub struct DiscoverEvent {
    pub path: PathBuf,
    pub files: Vec<String>,
}

/// A document was opened in the editor
#[derive(Debug, Clone)]
pub struct DidOpenEvent {
    pub context: RequestContext,
    pub dir: DirHandle,
    pub language_id: String,
}

/// An open document was changed
#[derive(Debug, Clone)]
pub struct DidChangeEvent {
    pub context: RequestContext,
    pub dir: DirHandle,
    pub language_id: String,
}

/// A watched file or directory changed on disk
#[derive(Debug, Clone)]
pub struct DidChangeWatchedEvent {
    pub context: RequestContext,
    pub raw_path: PathBuf,
    pub change_type: FileChangeType,
    pub is_dir: bool,
}

struct Subscriber<T> {
    name: String,
    channel: mpsc::Sender<T>,
    done: Option<Mutex<mpsc::Receiver<JobIds>>>,
}

/// A broadcast group for one event kind
pub struct Topic<T> {
    kind: &'static str,
    subscribers: RwLock<Vec<Arc<Subscriber<T>>>>,
}

impl<T: Clone + Send + 'static> Topic<T> {
    fn new(kind: &'static str) -> Self {
        Topic {
            kind,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a subscriber and return its event channel
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        done: Option<mpsc::Receiver<JobIds>>,
    ) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
        let name = name.into();
        tracing::debug!(kind = self.kind, subscriber = %name, "subscribed");
        self.subscribers.write().push(Arc::new(Subscriber {
            name,
            channel: tx,
            done: done.map(Mutex::new),
        }));
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver `event` to every subscriber and collect reported job IDs
    pub async fn publish(&self, event: T) -> JobIds {
        let subscribers: Vec<_> = self.subscribers.read().clone();
        let mut ids = JobIds::new();

        for subscriber in subscribers {
            match &subscriber.done {
                Some(done) => {
                    // Holding the done receiver pairs this send with its reply
                    let mut done = done.lock().await;
                    if subscriber.channel.send(event.clone()).await.is_err() {
                        tracing::warn!(kind = self.kind, subscriber = %subscriber.name, "subscriber channel closed");
                        continue;
                    }
                    match done.recv().await {
                        Some(mut job_ids) => ids.append(&mut job_ids),
                        None => {
                            tracing::warn!(kind = self.kind, subscriber = %subscriber.name, "done channel closed");
                        }
                    }
                }
                None => {
                    if subscriber.channel.send(event.clone()).await.is_err() {
                        tracing::warn!(kind = self.kind, subscriber = %subscriber.name, "subscriber channel closed");
                    }
                }
            }
        }

        ids
    }
}

impl<T> std::fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("kind", &self.kind)
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

/// Routes lifecycle events to every interested feature
pub struct EventBus {
    discover: Topic<DiscoverEvent>,
    did_open: Topic<DidOpenEvent>,
    did_change: Topic<DidChangeEvent>,
    did_change_watched: Topic<DidChangeWatchedEvent>,
}

impl EventBus {
    /// Create a new event bus with no subscribers
    pub fn new() -> Self {
        EventBus {
            discover: Topic::new("discover"),
            did_open: Topic::new("did_open"),
            did_change: Topic::new("did_change"),
            did_change_watched: Topic::new("did_change_watched"),
        }
    }

    pub fn on_discover(
        &self,
        topic: &str,
        done: Option<mpsc::Receiver<JobIds>>,
    ) -> mpsc::Receiver<DiscoverEvent> {
        self.discover.subscribe(topic, done)
    }

    pub fn on_did_open(
        &self,
        topic: &str,
        done: Option<mpsc::Receiver<JobIds>>,
    ) -> mpsc::Receiver<DidOpenEvent> {
        self.did_open.subscribe(topic, done)
    }

    pub fn on_did_change(
        &self,
        topic: &str,
        done: Option<mpsc::Receiver<JobIds>>,
    ) -> mpsc::Receiver<DidChangeEvent> {
        self.did_change.subscribe(topic, done)
    }

    pub fn on_did_change_watched(
        &self,
        topic: &str,
        done: Option<mpsc::Receiver<JobIds>>,
    ) -> mpsc::Receiver<DidChangeWatchedEvent> {
        self.did_change_watched.subscribe(topic, done)
    }

    pub async fn discover(&self, event: DiscoverEvent) -> JobIds {
        self.discover.publish(event).await
    }

    pub async fn did_open(&self, event: DidOpenEvent) -> JobIds {
        self.did_open.publish(event).await
    }

    pub async fn did_change(&self, event: DidChangeEvent) -> JobIds {
        self.did_change.publish(event).await
    }

    pub async fn did_change_watched(&self, event: DidChangeWatchedEvent) -> JobIds {
        self.did_change_watched.publish(event).await
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("discover", &self.discover)
            .field("did_open", &self.did_open)
            .field("did_change", &self.did_change)
            .field("did_change_watched", &self.did_change_watched)
            .finish()
    }
}
