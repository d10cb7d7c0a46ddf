//! Parsed configuration files and diagnostics containers.

use hclsense_types::{Diagnostic, DiagnosticSource, Range};
use std::collections::BTreeMap;
use std::sync::Arc;

/// An attribute: `name = expr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub expr: String,
    pub range: Range,
}

impl Attribute {
    /// The unquoted value if the expression is a plain string literal
    pub fn as_string(&self) -> Option<&str> {
        let expr = self.expr.trim();
        if expr.len() >= 2 && expr.starts_with('"') && expr.ends_with('"') {
            let inner = &expr[1..expr.len() - 1];
            (!inner.contains('"')).then_some(inner)
        } else {
            None
        }
    }
}

/// A block: `type "label" ... { body }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub block_type: String,
    pub labels: Vec<String>,
    pub attributes: Vec<Attribute>,
    pub blocks: Vec<Block>,
    pub range: Range,
}

impl Block {
    pub fn label(&self, idx: usize) -> Option<&str> {
        self.labels.get(idx).map(String::as_str)
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn blocks_of_type<'a>(&'a self, block_type: &'a str) -> impl Iterator<Item = &'a Block> + 'a {
        self.blocks.iter().filter(move |b| b.block_type == block_type)
    }

    /// Every attribute of this block and its nested blocks
    pub fn walk_attributes(&self) -> Vec<&Attribute> {
        let mut attrs: Vec<&Attribute> = self.attributes.iter().collect();
        for block in &self.blocks {
            attrs.extend(block.walk_attributes());
        }
        attrs
    }
}

/// One parsed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFile {
    pub name: String,
    pub digest: blake3::Hash,
    pub blocks: Vec<Block>,
    pub attributes: Vec<Attribute>,
}

impl ParsedFile {
    pub fn blocks_of_type<'a>(&'a self, block_type: &'a str) -> impl Iterator<Item = &'a Block> + 'a {
        self.blocks.iter().filter(move |b| b.block_type == block_type)
    }

    /// Every attribute in the file, including those nested in blocks
    pub fn walk_attributes(&self) -> Vec<&Attribute> {
        let mut attrs: Vec<&Attribute> = self.attributes.iter().collect();
        for block in &self.blocks {
            attrs.extend(block.walk_attributes());
        }
        attrs
    }
}

/// Parsed files of one directory, keyed by file name
pub type Files = BTreeMap<String, Arc<ParsedFile>>;

/// Diagnostics keyed by file name
pub type Diagnostics = BTreeMap<String, Vec<Diagnostic>>;

/// Diagnostics of one directory, grouped by source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDiagnostics(BTreeMap<DiagnosticSource, Diagnostics>);

impl SourceDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: DiagnosticSource) -> Option<&Diagnostics> {
        self.0.get(&source)
    }

    pub fn insert(&mut self, source: DiagnosticSource, diags: Diagnostics) {
        self.0.insert(source, diags);
    }

    pub fn contains_source(&self, source: DiagnosticSource) -> bool {
        self.0.contains_key(&source)
    }

    /// Total number of diagnostics across sources and files
    pub fn count(&self) -> usize {
        self.0
            .values()
            .flat_map(|files| files.values())
            .map(Vec::len)
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DiagnosticSource, &Diagnostics)> {
        self.0.iter().map(|(source, diags)| (*source, diags))
    }

    /// Every diagnostic, ordered by source then file
    pub fn all(&self) -> Vec<(DiagnosticSource, &Diagnostic)> {
        self.0
            .iter()
            .flat_map(|(source, files)| {
                files
                    .values()
                    .flat_map(move |diags| diags.iter().map(move |d| (*source, d)))
            })
            .collect()
    }
}
