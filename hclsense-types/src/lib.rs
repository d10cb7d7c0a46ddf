//! Shared types for hclsense
//!
//! This crate provides common types used across the hclsense crates,
//! including directory and document handles, per-stage state markers and
//! diagnostics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Directory handle, a normalized path string passed around by value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirHandle(String);

impl DirHandle {
    /// Create a handle from a directory path
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self(normalize(&path.as_ref().to_string_lossy()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Handle of the parent directory, if any
    pub fn parent(&self) -> Option<DirHandle> {
        self.path().parent().map(DirHandle::from_path)
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }
}

impl fmt::Display for DirHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DirHandle {
    fn from(path: &str) -> Self {
        DirHandle::from_path(path)
    }
}

fn normalize(raw: &str) -> String {
    let trimmed = raw.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() && !raw.is_empty() {
        // the filesystem root
        raw[..1].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Handle of a single document (file) inside a directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentHandle {
    pub dir: DirHandle,
    pub filename: String,
}

impl DocumentHandle {
    /// Create a handle from a full file path
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let dir = path
            .parent()
            .map(DirHandle::from_path)
            .unwrap_or_else(|| DirHandle::from_path(""));
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { dir, filename }
    }

    pub fn full_path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }
}

impl fmt::Display for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_path().display())
    }
}

/// Kind of change reported for a watched file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileChangeType {
    Created,
    Changed,
    Deleted,
}

impl fmt::Display for FileChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileChangeType::Created => "created",
            FileChangeType::Changed => "changed",
            FileChangeType::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Progress marker of one analysis stage for one directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpState {
    #[default]
    Unknown,
    Loading,
    Loaded,
}

impl fmt::Display for OpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpState::Unknown => "unknown",
            OpState::Loading => "loading",
            OpState::Loaded => "loaded",
        };
        f.write_str(name)
    }
}

/// Origin of a group of diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiagnosticSource {
    HclParsing,
    SchemaValidation,
    ReferenceValidation,
}

impl DiagnosticSource {
    pub const ALL: [DiagnosticSource; 3] = [
        DiagnosticSource::HclParsing,
        DiagnosticSource::SchemaValidation,
        DiagnosticSource::ReferenceValidation,
    ];
}

impl fmt::Display for DiagnosticSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticSource::HclParsing => "HCL",
            DiagnosticSource::SchemaValidation => "schema",
            DiagnosticSource::ReferenceValidation => "reference",
        };
        f.write_str(name)
    }
}

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A position in a source file (1-based line and column)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pos {
    pub line: usize,
    pub column: usize,
    pub byte: usize,
}

/// A range in a named source file
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub filename: String,
    pub start: Pos,
    pub end: Pos,
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.filename, self.start.line, self.start.column
        )
    }
}

/// A single diagnostic message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    pub range: Range,
}

impl Diagnostic {
    pub fn error(summary: impl Into<String>, range: Range) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: String::new(),
            range,
        }
    }

    pub fn warning(summary: impl Into<String>, range: Range) -> Self {
        Self {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: String::new(),
            range,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {}: {}", self.range, level, self.summary)?;
        if !self.detail.is_empty() {
            write!(f, " ({})", self.detail)?;
        }
        Ok(())
    }
}

/// Language identifiers reported by editors for HCL dialects
pub mod language {
    pub const TERRAFORM: &str = "terraform";
    pub const STACK: &str = "terraform-stack";
    pub const DEPLOY: &str = "terraform-deploy";
    pub const SEARCH: &str = "terraform-search";
    pub const VARS: &str = "terraform-vars";
}

/// Which editor request produced a piece of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestMethod {
    DidOpen,
    DidChange,
    DidChangeWatched,
}

/// Document-level details of the request that triggered some work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentContext {
    pub method: RequestMethod,
    pub document: DocumentHandle,
    pub language_id: String,
}

impl DocumentContext {
    pub fn new(method: RequestMethod, document: DocumentHandle, language_id: impl Into<String>) -> Self {
        Self {
            method,
            document,
            language_id: language_id.into(),
        }
    }

    pub fn is_did_change_request(&self) -> bool {
        self.method == RequestMethod::DidChange
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_handle_normalizes_trailing_separator() {
        assert_eq!(DirHandle::from_path("/mod/"), DirHandle::from_path("/mod"));
        assert_eq!(DirHandle::from_path("/").as_str(), "/");
    }

    #[test]
    fn test_document_handle_from_path() {
        let doc = DocumentHandle::from_path("/mod/main.tf");
        assert_eq!(doc.dir, DirHandle::from_path("/mod"));
        assert_eq!(doc.filename, "main.tf");
        assert_eq!(doc.full_path(), PathBuf::from("/mod/main.tf"));
    }

    #[test]
    fn test_dir_handle_parent() {
        let dir = DirHandle::from_path("/work/mod");
        assert_eq!(dir.parent(), Some(DirHandle::from_path("/work")));
    }

    #[test]
    fn test_op_state_default_is_unknown() {
        assert_eq!(OpState::default(), OpState::Unknown);
    }
}
