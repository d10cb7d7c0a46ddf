//! Request-scoped values passed explicitly to job bodies and handlers.

use hclsense_types::DocumentContext;

/// Validation switches carried with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Run schema and reference validation after references are decoded
    pub enable_enhanced_validation: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            enable_enhanced_validation: true,
        }
    }
}

/// Immutable request scope
///
/// Values are never mutated in place; the `with_*` builders return a new
/// context so a caller can force re-execution for one enqueue chain without
/// affecting anything else.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    ignore_state: bool,
    document: Option<DocumentContext>,
    validation: ValidationOptions,
}

impl RequestContext {
    /// Create an empty request context
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether cached stage state should be ignored
    pub fn ignore_state(&self) -> bool {
        self.ignore_state
    }

    /// Copy of this context with the ignore-state flag set to `ignore`
    pub fn with_ignore_state(&self, ignore: bool) -> Self {
        Self {
            ignore_state: ignore,
            ..self.clone()
        }
    }

    /// The document that triggered this request, if any
    pub fn document(&self) -> Option<&DocumentContext> {
        self.document.as_ref()
    }

    pub fn with_document(mut self, document: DocumentContext) -> Self {
        self.document = Some(document);
        self
    }

    pub fn validation(&self) -> ValidationOptions {
        self.validation
    }

    pub fn with_validation(mut self, validation: ValidationOptions) -> Self {
        self.validation = validation;
        self
    }

    /// True when the request is a change notification for an open document
    pub fn is_did_change_request(&self) -> bool {
        self.document
            .as_ref()
            .is_some_and(DocumentContext::is_did_change_request)
    }
}
