//! What distinguishes one feature's configuration language from another.

use crate::ast::{Diagnostics, Files};
use crate::record::Metadata;
use crate::references::{self, RefOrigin, RefTarget};
use crate::validation::{self, BlockRules};
use hclsense_types::DirHandle;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Language-specific half of a feature pipeline
pub trait Dialect: Send + Sync + 'static {
    type Meta: Metadata;

    /// Feature name, used for subscriptions, job types and logs
    const NAME: &'static str;

    /// Language ids of documents belonging to this feature
    fn language_ids(&self) -> &'static [&'static str];

    fn is_relevant_file(&self, name: &str) -> bool;

    fn block_rules(&self) -> BlockRules;

    /// Decode metadata; problems found on the way are returned as
    /// parsing diagnostics keyed by file
    fn load_metadata(&self, files: &Files) -> (Self::Meta, Diagnostics);

    /// Targets the directory at `path` offers to its references
    fn reference_targets(&self, path: &str, files: &Files, meta: &Self::Meta) -> Vec<RefTarget>;

    fn reference_origins(&self, files: &Files, _meta: &Self::Meta) -> Vec<RefOrigin> {
        references::collect_origins(files)
    }

    /// Report origins of the directory at `path` that resolve to no target
    fn validate_references(
        &self,
        _path: &str,
        origins: &[RefOrigin],
        targets: &[RefTarget],
    ) -> Diagnostics {
        validation::unreferenced_origins(origins, targets)
    }

    /// Other directories whose configuration `dir` pulls in, such as local
    /// module sources; they are indexed and decoded along with `dir`
    fn nested_dirs(&self, _dir: &DirHandle, _meta: &Self::Meta) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Whether data another feature derives for `path` is ready to be read
    fn upstream_ready(&self, _path: &str) -> bool {
        true
    }

    /// Providers whose schemas the directory at `path` needs
    fn provider_requirements(&self, _path: &str, meta: &Self::Meta) -> BTreeSet<String> {
        meta.provider_requirements().clone()
    }

    fn is_relevant_language(&self, language_id: &str) -> bool {
        self.language_ids().contains(&language_id)
    }
}

/// Whether `name` is an editor or OS artifact rather than a real file
pub fn is_ignored_file(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('#') || name.ends_with('~')
}
