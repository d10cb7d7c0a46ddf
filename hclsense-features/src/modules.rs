//! Terraform modules: directories of `*.tf` files.

use crate::ast::{Block, Diagnostics, Files};
use crate::dialect::Dialect;
use crate::record::Metadata;
use crate::references::{collect_targets, RefTarget};
use crate::schemas::normalize_address;
use crate::validation::BlockRules;
use hclsense_types::{language, Diagnostic, DirHandle};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

static SOURCE_RE: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r#"\bsource\s*=\s*"([^"]+)""#));

/// A declared input variable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Variable {
    pub description: Option<String>,
    pub has_default: bool,
}

/// Metadata of a module directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleMeta {
    pub core_requirements: Option<String>,
    pub variables: BTreeMap<String, Variable>,
    pub outputs: BTreeSet<String>,
    pub provider_requirements: BTreeSet<String>,
    /// Module call name to source address
    pub module_calls: BTreeMap<String, String>,
}

impl Metadata for ModuleMeta {
    fn provider_requirements(&self) -> &BTreeSet<String> {
        &self.provider_requirements
    }
}

/// Source addresses declared in a `required_providers` block
///
/// Entries without a `source` default to the `hashicorp` namespace.
pub(crate) fn required_providers(block: &Block) -> BTreeSet<String> {
    block
        .attributes
        .iter()
        .map(|attr| {
            let source = SOURCE_RE
                .as_ref()
                .ok()
                .and_then(|re| re.captures(&attr.expr))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string());
            normalize_address(source.as_deref().unwrap_or(&attr.name))
        })
        .collect()
}

/// Record `name` as declared; a repeated declaration is reported and
/// `false` returned
pub(crate) fn check_unique(
    diags: &mut Diagnostics,
    seen: &mut BTreeSet<String>,
    name: &str,
    what: &str,
    block: &Block,
) -> bool {
    if seen.insert(name.to_string()) {
        return true;
    }
    diags
        .entry(block.range.filename.clone())
        .or_default()
        .push(Diagnostic::error(
            format!("Duplicate {what} \"{name}\""),
            block.range.clone(),
        ));
    false
}

/// Whether a module source addresses a directory on the local filesystem
pub fn is_local_source(source: &str) -> bool {
    source.starts_with("./") || source.starts_with("../")
}

/// Resolve `.` and `..` lexically, without touching the filesystem
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

const BLOCKS: &[&str] = &[
    "check",
    "data",
    "import",
    "locals",
    "module",
    "moved",
    "output",
    "provider",
    "removed",
    "resource",
    "terraform",
    "variable",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ModulesDialect;

impl Dialect for ModulesDialect {
    type Meta = ModuleMeta;

    const NAME: &'static str = "modules";

    fn language_ids(&self) -> &'static [&'static str] {
        &[language::TERRAFORM]
    }

    fn is_relevant_file(&self, name: &str) -> bool {
        name.ends_with(".tf")
    }

    fn block_rules(&self) -> BlockRules {
        BlockRules {
            allowed: BLOCKS,
            required_attributes: &[("module", "source")],
        }
    }

    fn load_metadata(&self, files: &Files) -> (ModuleMeta, Diagnostics) {
        let mut meta = ModuleMeta::default();
        let mut diags = Diagnostics::new();
        let mut implied = BTreeSet::new();
        let mut variables = BTreeSet::new();
        let mut outputs = BTreeSet::new();

        for file in files.values() {
            for block in &file.blocks {
                match block.block_type.as_str() {
                    "terraform" => {
                        if let Some(version) =
                            block.attribute("required_version").and_then(|a| a.as_string())
                        {
                            meta.core_requirements = Some(version.to_string());
                        }
                        for providers in block.blocks_of_type("required_providers") {
                            meta.provider_requirements.extend(required_providers(providers));
                        }
                    }
                    "variable" => {
                        let Some(name) = block.label(0) else { continue };
                        if !check_unique(&mut diags, &mut variables, name, "variable declaration", block) {
                            continue;
                        }
                        meta.variables.insert(
                            name.to_string(),
                            Variable {
                                description: block
                                    .attribute("description")
                                    .and_then(|a| a.as_string())
                                    .map(str::to_string),
                                has_default: block.attribute("default").is_some(),
                            },
                        );
                    }
                    "output" => {
                        if let Some(name) = block.label(0) {
                            check_unique(&mut diags, &mut outputs, name, "output definition", block);
                        }
                    }
                    "module" => {
                        if let Some(name) = block.label(0) {
                            let source = block
                                .attribute("source")
                                .and_then(|a| a.as_string())
                                .unwrap_or_default();
                            meta.module_calls.insert(name.to_string(), source.to_string());
                        }
                    }
                    "provider" => {
                        if let Some(name) = block.label(0) {
                            implied.insert(name.to_string());
                        }
                    }
                    "resource" | "data" => {
                        if let Some(type_name) = block.label(0) {
                            implied.insert(crate::schemas::implied_provider(type_name).to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        meta.outputs = outputs;
        add_implied_providers(&mut meta.provider_requirements, implied);
        (meta, diags)
    }

    fn reference_targets(
        &self,
        _path: &str,
        files: &Files,
        _meta: &ModuleMeta,
    ) -> Vec<RefTarget> {
        collect_targets(files, |block| match block.block_type.as_str() {
            "resource" => Some(format!("{}.{}", block.label(0)?, block.label(1)?)),
            "data" => Some(format!("data.{}.{}", block.label(0)?, block.label(1)?)),
            _ => None,
        })
    }

    /// Local sources of the module calls
    fn nested_dirs(&self, dir: &DirHandle, meta: &ModuleMeta) -> Vec<PathBuf> {
        let dirs: BTreeSet<PathBuf> = meta
            .module_calls
            .values()
            .filter(|source| is_local_source(source))
            .map(|source| clean_path(&dir.join(source)))
            .collect();
        dirs.into_iter().collect()
    }
}

/// Add `hashicorp/<name>` for local names with no explicit requirement
pub(crate) fn add_implied_providers(requirements: &mut BTreeSet<String>, implied: BTreeSet<String>) {
    for name in implied {
        let declared = requirements
            .iter()
            .any(|addr| crate::schemas::local_name(addr) == name);
        if !declared {
            requirements.insert(normalize_address(&name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_file;
    use std::sync::Arc;

    fn files(sources: &[(&str, &str)]) -> Files {
        sources
            .iter()
            .map(|(name, src)| {
                let (file, diags) = parse_file(name, src);
                assert!(diags.is_empty(), "{diags:?}");
                (name.to_string(), Arc::new(file))
            })
            .collect()
    }

    #[test]
    fn test_relevant_files() {
        assert!(ModulesDialect.is_relevant_file("main.tf"));
        assert!(!ModulesDialect.is_relevant_file("main.tf.json"));
        assert!(!ModulesDialect.is_relevant_file("query.tfquery.hcl"));
    }

    #[test]
    fn test_load_metadata() {
        let files = files(&[(
            "main.tf",
            r#"
terraform {
  required_version = ">= 1.5"
  required_providers {
    aws = {
      source  = "hashicorp/aws"
      version = "~> 5.0"
    }
    mycloud = {
      source = "example/mycloud"
    }
  }
}

variable "region" {
  description = "Region to deploy to"
  default     = "eu-west-1"
}

output "id" {
  value = random_id.x.id
}

module "network" {
  source = "./network"
}

resource "random_id" "x" {}
"#,
        )]);

        let (meta, diags) = ModulesDialect.load_metadata(&files);
        assert!(diags.is_empty());
        assert_eq!(meta.core_requirements.as_deref(), Some(">= 1.5"));
        assert_eq!(
            meta.provider_requirements,
            BTreeSet::from([
                "example/mycloud".to_string(),
                "hashicorp/aws".to_string(),
                "hashicorp/random".to_string(),
            ])
        );
        assert!(meta.variables["region"].has_default);
        assert_eq!(meta.module_calls["network"], "./network");
        assert!(meta.outputs.contains("id"));
    }

    #[test]
    fn test_duplicate_variable_across_files() {
        let files = files(&[
            ("a.tf", "variable \"x\" {}\n"),
            ("b.tf", "variable \"x\" {}\n"),
        ]);

        let (meta, diags) = ModulesDialect.load_metadata(&files);
        assert_eq!(meta.variables.len(), 1);
        assert_eq!(diags["b.tf"][0].summary, "Duplicate variable declaration \"x\"");
    }

    #[test]
    fn test_reference_targets() {
        let files = files(&[(
            "main.tf",
            "resource \"aws_instance\" \"web\" {}\ndata \"aws_ami\" \"ubuntu\" {}\n",
        )]);
        let addrs: Vec<String> = ModulesDialect
            .reference_targets("/mod", &files, &ModuleMeta::default())
            .into_iter()
            .map(|t| t.addr)
            .collect();
        assert_eq!(addrs, vec!["aws_instance.web", "data.aws_ami.ubuntu"]);
    }

    #[test]
    fn test_nested_dirs_follow_local_sources() {
        let mut meta = ModuleMeta::default();
        for (name, source) in [
            ("network", "./network"),
            ("again", "./network/"),
            ("shared", "../shared"),
            ("consul", "hashicorp/consul/aws"),
            ("git", "git::https://example.com/vpc.git"),
        ] {
            meta.module_calls.insert(name.to_string(), source.to_string());
        }

        let dirs = ModulesDialect.nested_dirs(&DirHandle::from_path("/work/root"), &meta);
        assert_eq!(
            dirs,
            vec![PathBuf::from("/work/root/network"), PathBuf::from("/work/shared")]
        );
    }
}
