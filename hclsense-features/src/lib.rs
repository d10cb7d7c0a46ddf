//! # hclsense-features
//!
//! Feature pipelines for the hclsense analysis engine.
//!
//! Each feature (Terraform modules, Stacks, Search, variable files) owns a versioned record
//! store keyed by directory and reacts to editor and file system events by
//! enqueuing a chain of jobs: parse, metadata, schema preload, reference
//! collection and validation. [`Engine`] assembles the features on top of
//! the shared stores from `hclsense-incremental`.

pub mod ast;
pub mod config;
pub mod dialect;
pub mod engine;
pub mod feature;
pub mod filesystem;
pub mod jobs;
pub mod modules;
pub mod parser;
pub mod record;
pub mod references;
pub mod schemas;
pub mod search;
pub mod stacks;
pub mod validation;
pub mod variables;

pub use ast::{Diagnostics, Files, ParsedFile, SourceDiagnostics};
pub use config::{ConfigError, Settings, DEFAULT_CONFIG_FILE};
pub use dialect::Dialect;
pub use engine::{language_for_file, DirDiagnostic, Engine, EngineError};
pub use feature::{Feature, Pipeline};
pub use filesystem::{DocumentOverlayFs, OsFs, ReadOnlyFs};
pub use modules::{ModuleMeta, ModulesDialect};
pub use record::{FeatureStore, Metadata, Record, Stage};
pub use references::{RefOrigin, RefTarget};
pub use schemas::{SchemaError, SchemaStore};
pub use search::{SearchDialect, SearchMeta};
pub use stacks::{StackMeta, StacksDialect};
pub use variables::{VariablesDialect, VariablesMeta};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::dialect::Dialect;
    pub use crate::engine::Engine;
    pub use crate::feature::Feature;
    pub use crate::filesystem::{OsFs, ReadOnlyFs};
    pub use crate::modules::{ModuleMeta, ModulesDialect};
    pub use crate::record::{FeatureStore, Stage};
    pub use crate::schemas::SchemaStore;
    pub use crate::search::SearchDialect;
    pub use crate::stacks::StacksDialect;
    pub use crate::variables::VariablesDialect;
}
