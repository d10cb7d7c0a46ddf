//! Read-only filesystem views used by parse jobs.

use hclsense_incremental::DocumentStore;
use hclsense_types::{DirHandle, DocumentHandle};
use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Read-only access to configuration files
pub trait ReadOnlyFs: Send + Sync + std::fmt::Debug {
    fn read_file(&self, path: &Path) -> io::Result<String>;

    /// Names of the regular files directly inside `path`, sorted
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;
}

/// The operating system filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl ReadOnlyFs for OsFs {
    fn read_file(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Open documents layered over the OS filesystem
///
/// Unsaved editor content wins over what is on disk, and documents that only
/// exist in the editor are listed alongside the files on disk.
#[derive(Debug, Clone)]
pub struct DocumentOverlayFs {
    documents: Arc<DocumentStore>,
    base: OsFs,
}

impl DocumentOverlayFs {
    pub fn new(documents: Arc<DocumentStore>) -> Self {
        DocumentOverlayFs {
            documents,
            base: OsFs,
        }
    }
}

impl ReadOnlyFs for DocumentOverlayFs {
    fn read_file(&self, path: &Path) -> io::Result<String> {
        let handle = DocumentHandle::from_path(path);
        match self.documents.get_document(&handle) {
            Some(doc) => Ok(doc.text.to_string()),
            None => self.base.read_file(path),
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let open = self.documents.list_documents(&DirHandle::from_path(path));
        let on_disk = match self.base.read_dir(path) {
            Ok(names) => names,
            Err(err) if err.kind() == io::ErrorKind::NotFound && !open.is_empty() => Vec::new(),
            Err(err) => return Err(err),
        };

        let names: BTreeSet<String> = on_disk
            .into_iter()
            .chain(open.into_iter().map(|doc| doc.handle.filename))
            .collect();
        Ok(names.into_iter().collect())
    }
}
