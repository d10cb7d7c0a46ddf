//! Open documents

use dashmap::DashMap;
use hclsense_types::{DirHandle, DocumentHandle};
use std::sync::Arc;
use std::time::Instant;

/// An open document as last reported by the editor
#[derive(Debug, Clone)]
pub struct Document {
    pub handle: DocumentHandle,
    pub language_id: String,
    pub version: i32,
    pub text: Arc<str>,
    pub opened_at: Instant,
}

/// Store of open documents, keyed by handle
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: DashMap<DocumentHandle, Document>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or re-open) a document
    pub fn open_document(
        &self,
        handle: DocumentHandle,
        language_id: impl Into<String>,
        version: i32,
        text: impl Into<Arc<str>>,
    ) {
        tracing::debug!(document = %handle, version, "document opened");
        self.documents.insert(
            handle.clone(),
            Document {
                handle,
                language_id: language_id.into(),
                version,
                text: text.into(),
                opened_at: Instant::now(),
            },
        );
    }

    /// Replace the text of an open document; returns false if it is not open
    pub fn update_document(&self, handle: &DocumentHandle, text: impl Into<Arc<str>>, version: i32) -> bool {
        match self.documents.get_mut(handle) {
            Some(mut doc) => {
                doc.text = text.into();
                doc.version = version;
                true
            }
            None => false,
        }
    }

    pub fn close_document(&self, handle: &DocumentHandle) -> Option<Document> {
        tracing::debug!(document = %handle, "document closed");
        self.documents.remove(handle).map(|(_, doc)| doc)
    }

    pub fn get_document(&self, handle: &DocumentHandle) -> Option<Document> {
        self.documents.get(handle).map(|doc| doc.clone())
    }

    pub fn is_document_open(&self, handle: &DocumentHandle) -> bool {
        self.documents.contains_key(handle)
    }

    pub fn has_open_documents(&self, dir: &DirHandle) -> bool {
        self.documents.iter().any(|entry| &entry.key().dir == dir)
    }

    pub fn list_documents(&self, dir: &DirHandle) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .documents
            .iter()
            .filter(|entry| &entry.key().dir == dir)
            .map(|entry| entry.value().clone())
            .collect();
        docs.sort_by(|a, b| a.handle.filename.cmp(&b.handle.filename));
        docs
    }
}
