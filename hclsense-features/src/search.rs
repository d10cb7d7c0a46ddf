//! Terraform Search: `*.tfquery.hcl` list queries.
//!
//! Query files live next to a module and use its providers, so the provider
//! requirements used for schema preloading include those of the module
//! record for the same directory when one exists.

use crate::ast::{Diagnostics, Files};
use crate::dialect::Dialect;
use crate::modules::{add_implied_providers, check_unique, ModuleMeta};
use crate::record::{FeatureStore, Metadata};
use crate::references::{collect_targets, RefTarget};
use crate::schemas::implied_provider;
use crate::validation::BlockRules;
use hclsense_types::language;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Metadata of a search directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchMeta {
    /// List name to list type
    pub lists: BTreeMap<String, String>,
    pub variables: BTreeSet<String>,
    /// Provider references from `provider = aws.west` style attributes
    pub provider_references: BTreeSet<String>,
    pub provider_requirements: BTreeSet<String>,
}

impl Metadata for SearchMeta {
    fn provider_requirements(&self) -> &BTreeSet<String> {
        &self.provider_requirements
    }
}

pub fn is_search_file(name: &str) -> bool {
    name.ends_with(".tfquery.hcl")
}

const BLOCKS: &[&str] = &["list", "locals", "provider", "variable"];

/// Search dialect, optionally reading the sibling module records
#[derive(Debug, Clone, Default)]
pub struct SearchDialect {
    modules: Option<Arc<FeatureStore<ModuleMeta>>>,
}

impl SearchDialect {
    pub fn new(modules: Option<Arc<FeatureStore<ModuleMeta>>>) -> Self {
        SearchDialect { modules }
    }
}

impl Dialect for SearchDialect {
    type Meta = SearchMeta;

    const NAME: &'static str = "search";

    fn language_ids(&self) -> &'static [&'static str] {
        &[language::SEARCH]
    }

    fn is_relevant_file(&self, name: &str) -> bool {
        is_search_file(name)
    }

    fn block_rules(&self) -> BlockRules {
        BlockRules {
            allowed: BLOCKS,
            required_attributes: &[("list", "provider")],
        }
    }

    fn load_metadata(&self, files: &Files) -> (SearchMeta, Diagnostics) {
        let mut meta = SearchMeta::default();
        let mut diags = Diagnostics::new();
        let mut implied = BTreeSet::new();
        let mut lists = BTreeSet::new();

        for file in files.values() {
            for block in &file.blocks {
                match block.block_type.as_str() {
                    "list" => {
                        let (Some(list_type), Some(name)) = (block.label(0), block.label(1)) else {
                            continue;
                        };
                        if !check_unique(&mut diags, &mut lists, name, "list", block) {
                            continue;
                        }
                        meta.lists.insert(name.to_string(), list_type.to_string());
                        implied.insert(implied_provider(list_type).to_string());
                        if let Some(provider) = block.attribute("provider") {
                            meta.provider_references.insert(provider.expr.trim().to_string());
                        }
                    }
                    "variable" => {
                        if let Some(name) = block.label(0) {
                            check_unique(&mut diags, &mut meta.variables, name, "variable declaration", block);
                        }
                    }
                    "provider" => {
                        if let Some(name) = block.label(0) {
                            implied.insert(name.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        add_implied_providers(&mut meta.provider_requirements, implied);
        (meta, diags)
    }

    fn reference_targets(
        &self,
        _path: &str,
        files: &Files,
        _meta: &SearchMeta,
    ) -> Vec<RefTarget> {
        collect_targets(files, |block| match block.block_type.as_str() {
            "list" => Some(format!("list.{}.{}", block.label(0)?, block.label(1)?)),
            _ => None,
        })
    }

    fn provider_requirements(&self, path: &str, meta: &SearchMeta) -> BTreeSet<String> {
        let mut requirements = meta.provider_requirements.clone();
        if let Some(modules) = &self.modules {
            if let Ok(module) = modules.record_by_path(path) {
                requirements.extend(module.meta.provider_requirements.iter().cloned());
            }
        }
        requirements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_file;
    use hclsense_incremental::StateStore;

    fn files(src: &str) -> Files {
        let (file, diags) = parse_file("main.tfquery.hcl", src);
        assert!(diags.is_empty(), "{diags:?}");
        [("main.tfquery.hcl".to_string(), Arc::new(file))]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_load_metadata() {
        let files = files("list \"aws_instance\" \"all\" {\n  provider = aws\n}\n");
        let dialect = SearchDialect::default();

        let (meta, diags) = dialect.load_metadata(&files);
        assert!(diags.is_empty());
        assert_eq!(meta.lists["all"], "aws_instance");
        assert!(meta.provider_references.contains("aws"));
        assert!(meta.provider_requirements.contains("hashicorp/aws"));

        let targets = dialect.reference_targets("/q", &files, &meta);
        assert_eq!(targets[0].addr, "list.aws_instance.all");
    }

    #[test]
    fn test_provider_requirements_merge_module_record() {
        let state = StateStore::new();
        let modules = Arc::new(FeatureStore::<ModuleMeta>::new("modules", state.changes.clone()));
        modules.add("/work").unwrap();
        let mut module_meta = ModuleMeta::default();
        module_meta.provider_requirements.insert("hashicorp/random".to_string());
        modules.update_metadata("/work", module_meta, None).unwrap();

        let dialect = SearchDialect::new(Some(modules));
        let mut meta = SearchMeta::default();
        meta.provider_requirements.insert("hashicorp/aws".to_string());

        let merged = dialect.provider_requirements("/work", &meta);
        assert_eq!(
            merged,
            BTreeSet::from(["hashicorp/aws".to_string(), "hashicorp/random".to_string()])
        );
        assert_eq!(dialect.provider_requirements("/elsewhere", &meta).len(), 1);
    }
}
