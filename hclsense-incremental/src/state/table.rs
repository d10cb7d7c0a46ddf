//! Versioned copy-on-write table
//!
//! Rows are immutable `Arc`s keyed by directory path. Readers take a
//! [`Snapshot`] and keep it as long as they like; writers run inside a
//! single-writer transaction that works on a private copy of the row map
//! and installs it atomically on commit.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Commit counter of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

impl Revision {
    pub fn next(self) -> Self {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Immutable view of a table at one revision
#[derive(Debug)]
pub struct Snapshot<R> {
    revision: Revision,
    rows: BTreeMap<String, Arc<R>>,
}

impl<R> Snapshot<R> {
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn get(&self, key: &str) -> Option<&Arc<R>> {
        self.rows.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    /// Rows in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<R>)> {
        self.rows.iter().map(|(key, row)| (key.as_str(), row))
    }

    pub fn values(&self) -> impl Iterator<Item = &Arc<R>> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

type CommitHook = Box<dyn FnOnce() + Send>;

/// A write transaction
///
/// Dropping the transaction without returning `Ok` from the closure passed
/// to [`VersionedTable::write`] discards every change.
pub struct WriteTxn<R> {
    base: Arc<Snapshot<R>>,
    rows: Option<BTreeMap<String, Arc<R>>>,
    hooks: Vec<CommitHook>,
}

impl<R> WriteTxn<R> {
    fn rows(&self) -> &BTreeMap<String, Arc<R>> {
        self.rows.as_ref().unwrap_or(&self.base.rows)
    }

    fn rows_mut(&mut self) -> &mut BTreeMap<String, Arc<R>> {
        let base = &self.base;
        self.rows.get_or_insert_with(|| base.rows.clone())
    }

    /// Current row, including changes made earlier in this transaction
    pub fn get(&self, key: &str) -> Option<Arc<R>> {
        self.rows().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows().contains_key(key)
    }

    /// Install `row` under `key`, returning the previous row
    pub fn insert(&mut self, key: impl Into<String>, row: R) -> Option<Arc<R>> {
        self.rows_mut().insert(key.into(), Arc::new(row))
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<R>> {
        if !self.contains(key) {
            return None;
        }
        self.rows_mut().remove(key)
    }

    /// Run `hook` once this transaction has been committed
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn is_dirty(&self) -> bool {
        self.rows.is_some()
    }
}

impl<R> fmt::Debug for WriteTxn<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTxn")
            .field("base", &self.base.revision)
            .field("dirty", &self.is_dirty())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl<R: Clone> WriteTxn<R> {
    /// Deep copy of the current row, for mutation and re-insertion
    pub fn get_copy(&self, key: &str) -> Option<R> {
        self.rows().get(key).map(|row| R::clone(row))
    }
}

/// A named table of versioned rows
pub struct VersionedTable<R> {
    name: &'static str,
    current: RwLock<Arc<Snapshot<R>>>,
    writer: Mutex<()>,
}

impl<R> VersionedTable<R> {
    /// Create a new empty table
    pub fn new(name: &'static str) -> Self {
        VersionedTable {
            name,
            current: RwLock::new(Arc::new(Snapshot {
                revision: Revision::default(),
                rows: BTreeMap::new(),
            })),
            writer: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Take a read snapshot
    pub fn snapshot(&self) -> Arc<Snapshot<R>> {
        self.current.read().clone()
    }

    pub fn revision(&self) -> Revision {
        self.current.read().revision
    }

    /// Run `f` inside a write transaction
    ///
    /// Write transactions serialize against each other. On `Ok` the new row
    /// map is installed (if anything changed) and commit hooks run after the
    /// writer lock is released. On `Err` nothing is installed.
    pub fn write<T, E>(&self, f: impl FnOnce(&mut WriteTxn<R>) -> Result<T, E>) -> Result<T, E> {
        let guard = self.writer.lock();
        let mut txn = WriteTxn {
            base: self.snapshot(),
            rows: None,
            hooks: Vec::new(),
        };

        let value = match f(&mut txn) {
            Ok(value) => value,
            Err(err) => {
                tracing::trace!(table = self.name, "write transaction aborted");
                return Err(err);
            }
        };

        if let Some(rows) = txn.rows.take() {
            let revision = txn.base.revision.next();
            *self.current.write() = Arc::new(Snapshot { revision, rows });
            tracing::trace!(table = self.name, %revision, "write transaction committed");
        }
        drop(guard);

        for hook in txn.hooks {
            hook();
        }
        Ok(value)
    }
}

impl<R> fmt::Debug for VersionedTable<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("VersionedTable")
            .field("name", &self.name)
            .field("revision", &snapshot.revision)
            .field("rows", &snapshot.len())
            .finish()
    }
}
