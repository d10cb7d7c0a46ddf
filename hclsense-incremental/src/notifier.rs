//! Notifier
//!
//! Background task awaiting ready change batches and passing each one to
//! the registered hooks.

use crate::state::{ChangeBatch, ChangeStore};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Callback invoked for every published batch
pub type Hook = Arc<dyn Fn(&ChangeBatch) + Send + Sync>;

/// Publishes change batches to hooks
pub struct Notifier {
    changes: Arc<ChangeStore>,
    hooks: Vec<Hook>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Notifier {
    pub fn new(changes: Arc<ChangeStore>, hooks: Vec<Hook>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Notifier {
            changes,
            hooks,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Spawn the notification loop on the current runtime
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let changes = self.changes.clone();
        let hooks = self.hooks.clone();
        let mut shutdown = self.shutdown.subscribe();

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    batch = changes.await_next_change_batch() => {
                        tracing::debug!(dir = %batch.dir, changes = ?batch.changes, "publishing change batch");
                        for hook in &hooks {
                            hook(&batch);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("notifier stopped");
        }));
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop and wait for the loop to exit
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "notifier terminated abnormally");
            }
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("hooks", &self.hooks.len())
            .field("running", &self.task.lock().is_some())
            .finish()
    }
}
