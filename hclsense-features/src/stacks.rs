//! Terraform Stacks: component (`*.tfcomponent.hcl`, `*.tfstack.hcl`) and
//! deployment (`*.tfdeploy.hcl`) configuration.

use crate::ast::{Diagnostics, Files};
use crate::dialect::Dialect;
use crate::modules::{add_implied_providers, check_unique, required_providers};
use crate::record::Metadata;
use crate::references::{collect_targets, RefTarget};
use crate::validation::BlockRules;
use hclsense_types::language;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Metadata of a stack directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackMeta {
    /// Component name to source address
    pub components: BTreeMap<String, String>,
    pub variables: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
    pub deployments: BTreeSet<String>,
    pub provider_requirements: BTreeSet<String>,
}

impl Metadata for StackMeta {
    fn provider_requirements(&self) -> &BTreeSet<String> {
        &self.provider_requirements
    }
}

pub fn is_stack_file(name: &str) -> bool {
    name.ends_with(".tfstack.hcl") || name.ends_with(".tfcomponent.hcl")
}

pub fn is_deploy_file(name: &str) -> bool {
    name.ends_with(".tfdeploy.hcl")
}

const BLOCKS: &[&str] = &[
    // component files
    "component",
    "locals",
    "output",
    "provider",
    "removed",
    "required_providers",
    "stack",
    "variable",
    // deployment files
    "deployment",
    "deployment_auto_approve",
    "deployment_group",
    "identity_token",
    "publish_output",
    "store",
    "upstream_input",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct StacksDialect;

impl Dialect for StacksDialect {
    type Meta = StackMeta;

    const NAME: &'static str = "stacks";

    fn language_ids(&self) -> &'static [&'static str] {
        &[language::STACK, language::DEPLOY]
    }

    fn is_relevant_file(&self, name: &str) -> bool {
        is_stack_file(name) || is_deploy_file(name)
    }

    fn block_rules(&self) -> BlockRules {
        BlockRules {
            allowed: BLOCKS,
            required_attributes: &[("component", "source"), ("deployment", "inputs")],
        }
    }

    fn load_metadata(&self, files: &Files) -> (StackMeta, Diagnostics) {
        let mut meta = StackMeta::default();
        let mut diags = Diagnostics::new();
        let mut implied = BTreeSet::new();
        let mut components = BTreeSet::new();

        for file in files.values() {
            for block in &file.blocks {
                let Some(name) = block.label(0) else {
                    if block.block_type == "required_providers" {
                        meta.provider_requirements.extend(required_providers(block));
                    }
                    continue;
                };
                match block.block_type.as_str() {
                    "component" => {
                        if !check_unique(&mut diags, &mut components, name, "component", block) {
                            continue;
                        }
                        let source = block
                            .attribute("source")
                            .and_then(|a| a.as_string())
                            .unwrap_or_default();
                        meta.components.insert(name.to_string(), source.to_string());
                    }
                    "variable" => {
                        check_unique(&mut diags, &mut meta.variables, name, "variable declaration", block);
                    }
                    "output" => {
                        check_unique(&mut diags, &mut meta.outputs, name, "output definition", block);
                    }
                    "deployment" => {
                        check_unique(&mut diags, &mut meta.deployments, name, "deployment", block);
                    }
                    "provider" => {
                        implied.insert(name.to_string());
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
        _meta: &StackMeta,
    ) -> Vec<RefTarget> {
        collect_targets(files, |block| match block.block_type.as_str() {
            "component" => Some(format!("component.{}", block.label(0)?)),
            "deployment" => Some(format!("deployment.{}", block.label(0)?)),
            "provider" => Some(format!("provider.{}.{}", block.label(0)?, block.label(1)?)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_file;
    use std::sync::Arc;

    #[test]
    fn test_relevant_files() {
        assert!(StacksDialect.is_relevant_file("main.tfcomponent.hcl"));
        assert!(StacksDialect.is_relevant_file("main.tfstack.hcl"));
        assert!(StacksDialect.is_relevant_file("prod.tfdeploy.hcl"));
        assert!(!StacksDialect.is_relevant_file("main.tf"));
        assert!(StacksDialect.is_relevant_language("terraform-deploy"));
        assert!(!StacksDialect.is_relevant_language("terraform"));
    }

    #[test]
    fn test_load_metadata() {
        let (component, _) = parse_file(
            "main.tfcomponent.hcl",
            r#"
required_providers {
  aws = {
    source = "hashicorp/aws"
  }
}

variable "regions" {}

component "network" {
  source = "./network"
}

provider "aws" "this" {}
"#,
        );
        let (deploy, _) = parse_file(
            "prod.tfdeploy.hcl",
            "deployment \"prod\" {\n  inputs = {}\n}\ndeployment \"prod\" {\n  inputs = {}\n}\n",
        );
        let files: Files = [
            ("main.tfcomponent.hcl".to_string(), Arc::new(component)),
            ("prod.tfdeploy.hcl".to_string(), Arc::new(deploy)),
        ]
        .into_iter()
        .collect();

        let (meta, diags) = StacksDialect.load_metadata(&files);
        assert_eq!(meta.components["network"], "./network");
        assert!(meta.variables.contains("regions"));
        assert_eq!(meta.provider_requirements, BTreeSet::from(["hashicorp/aws".to_string()]));
        assert_eq!(diags["prod.tfdeploy.hcl"].len(), 1);

        let addrs: Vec<String> = StacksDialect
            .reference_targets("/stack", &files, &meta)
            .into_iter()
            .map(|t| t.addr)
            .collect();
        assert_eq!(
            addrs,
            vec![
                "var.regions",
                "component.network",
                "provider.aws.this",
                "deployment.prod",
                "deployment.prod",
            ]
        );
    }
}
