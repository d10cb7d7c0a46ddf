//! Terraform variable definition files (`*.tfvars`).
//!
//! Assignments only make sense against the module in the same directory,
//! so reference targets and validation read the module record kept by the
//! modules feature. A directory with no module record is not validated.

use crate::ast::{Diagnostics, Files};
use crate::dialect::Dialect;
use crate::modules::ModuleMeta;
use crate::record::{FeatureStore, Metadata};
use crate::references::{RefOrigin, RefTarget};
use crate::validation::{self, BlockRules};
use hclsense_types::{language, Diagnostic, OpState};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

static NO_PROVIDERS: BTreeSet<String> = BTreeSet::new();

/// Metadata of a directory's variable definition files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VariablesMeta {
    /// Variable name to the files assigning it
    pub assignments: BTreeMap<String, BTreeSet<String>>,
}

impl Metadata for VariablesMeta {
    fn provider_requirements(&self) -> &BTreeSet<String> {
        &NO_PROVIDERS
    }
}

pub fn is_vars_file(name: &str) -> bool {
    name.ends_with(".tfvars")
}

/// Variables dialect, reading the sibling module records when the modules
/// feature is enabled
#[derive(Debug, Clone, Default)]
pub struct VariablesDialect {
    modules: Option<Arc<FeatureStore<ModuleMeta>>>,
}

impl VariablesDialect {
    pub fn new(modules: Option<Arc<FeatureStore<ModuleMeta>>>) -> Self {
        VariablesDialect { modules }
    }
}

impl Dialect for VariablesDialect {
    type Meta = VariablesMeta;

    const NAME: &'static str = "variables";

    fn language_ids(&self) -> &'static [&'static str] {
        &[language::VARS]
    }

    fn is_relevant_file(&self, name: &str) -> bool {
        is_vars_file(name)
    }

    fn block_rules(&self) -> BlockRules {
        BlockRules {
            allowed: &[],
            required_attributes: &[],
        }
    }

    fn load_metadata(&self, files: &Files) -> (VariablesMeta, Diagnostics) {
        let mut meta = VariablesMeta::default();
        let mut diags = Diagnostics::new();

        for file in files.values() {
            let mut seen = BTreeSet::new();
            for attr in &file.attributes {
                if !seen.insert(attr.name.as_str()) {
                    diags.entry(file.name.clone()).or_default().push(
                        Diagnostic::error("Attribute redefined", attr.range.clone()).with_detail(
                            format!("The argument \"{}\" was already set in this file", attr.name),
                        ),
                    );
                    continue;
                }
                meta.assignments
                    .entry(attr.name.clone())
                    .or_default()
                    .insert(file.name.clone());
            }
        }
        (meta, diags)
    }

    /// The `var.` targets of the module in the same directory
    fn reference_targets(
        &self,
        path: &str,
        _files: &Files,
        _meta: &VariablesMeta,
    ) -> Vec<RefTarget> {
        let Some(record) = self
            .modules
            .as_ref()
            .and_then(|modules| modules.record_by_path(path).ok())
        else {
            return Vec::new();
        };
        record
            .ref_targets
            .iter()
            .filter(|target| target.addr.starts_with("var."))
            .cloned()
            .collect()
    }

    /// Every top-level assignment refers to the variable it sets
    fn reference_origins(&self, files: &Files, _meta: &VariablesMeta) -> Vec<RefOrigin> {
        files
            .values()
            .flat_map(|file| &file.attributes)
            .map(|attr| RefOrigin {
                addr: format!("var.{}", attr.name),
                range: attr.range.clone(),
            })
            .collect()
    }

    fn validate_references(
        &self,
        path: &str,
        origins: &[RefOrigin],
        targets: &[RefTarget],
    ) -> Diagnostics {
        let has_module = self
            .modules
            .as_ref()
            .is_some_and(|modules| modules.exists(path));
        if !has_module {
            return Diagnostics::new();
        }
        validation::undeclared_variables(origins, targets)
    }

    fn upstream_ready(&self, path: &str) -> bool {
        let Some(modules) = &self.modules else {
            return true;
        };
        match modules.record_by_path(path) {
            Ok(record) => record.ref_targets_state == OpState::Loaded,
            Err(_) => true,
        }
    }
}
