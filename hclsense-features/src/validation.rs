//! Schema and reference validation.

use crate::ast::{Block, Diagnostics, Files};
use crate::references::{self, RefOrigin, RefTarget};
use crate::schemas::{implied_provider, local_name, SchemaStore};
use hclsense_types::Diagnostic;
use std::collections::BTreeSet;

/// Which top-level blocks a dialect accepts
#[derive(Debug, Clone, Copy)]
pub struct BlockRules {
    pub allowed: &'static [&'static str],
    /// `(block type, attribute)` pairs that must be present
    pub required_attributes: &'static [(&'static str, &'static str)],
}

fn push(diags: &mut Diagnostics, diag: Diagnostic) {
    diags.entry(diag.range.filename.clone()).or_default().push(diag);
}

/// Validate block structure and resource types
///
/// Every parsed file gets an entry, so a clean file clears diagnostics
/// published for it earlier.
pub fn schema_validation(
    files: &Files,
    rules: &BlockRules,
    schemas: &SchemaStore,
    providers: &BTreeSet<String>,
) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for name in files.keys() {
        diags.insert(name.clone(), Vec::new());
    }

    for file in files.values() {
        for block in &file.blocks {
            if !rules.allowed.contains(&block.block_type.as_str()) {
                push(
                    &mut diags,
                    Diagnostic::error(
                        format!("Unsupported block type \"{}\"", block.block_type),
                        block.range.clone(),
                    )
                    .with_detail(format!(
                        "Blocks of type \"{}\" are not expected here",
                        block.block_type
                    )),
                );
                continue;
            }

            for (block_type, attr) in rules.required_attributes {
                if *block_type == block.block_type && block.attribute(attr).is_none() {
                    push(
                        &mut diags,
                        Diagnostic::error(
                            format!("Missing required argument \"{attr}\""),
                            block.range.clone(),
                        ),
                    );
                }
            }

            if let Some(diag) = check_resource_type(block, schemas, providers) {
                push(&mut diags, diag);
            }
        }
    }
    diags
}

fn check_resource_type(
    block: &Block,
    schemas: &SchemaStore,
    providers: &BTreeSet<String>,
) -> Option<Diagnostic> {
    let is_data = match block.block_type.as_str() {
        "resource" => false,
        "data" => true,
        _ => return None,
    };
    let type_name = block.label(0)?;
    let provider = implied_provider(type_name);

    let addr = providers.iter().find(|addr| local_name(addr) == provider)?;
    let schema = schemas.provider_schema(addr)?;

    let known = if is_data {
        schema.has_data_source(type_name)
    } else {
        schema.has_resource(type_name)
    };
    if known {
        return None;
    }

    let kind = if is_data { "data source" } else { "resource" };
    Some(
        Diagnostic::error(format!("Invalid {kind} type"), block.range.clone()).with_detail(
            format!("The provider {} does not support {kind} type \"{type_name}\"", schema.address),
        ),
    )
}

/// Report `var.` and `local.` origins with no matching target
pub fn unreferenced_origins(origins: &[RefOrigin], targets: &[RefTarget]) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for origin in references::unreferenced(origins, targets) {
        if !(origin.addr.starts_with("var.") || origin.addr.starts_with("local.")) {
            continue;
        }
        push(
            &mut diags,
            Diagnostic::error(
                format!("No declaration found for \"{}\"", origin.addr),
                origin.range.clone(),
            ),
        );
    }
    diags
}

/// Report assignments to variables the module does not declare
///
/// Warnings rather than errors: the values are simply unused.
pub fn undeclared_variables(origins: &[RefOrigin], targets: &[RefTarget]) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for origin in references::unreferenced(origins, targets) {
        let name = origin.addr.trim_start_matches("var.");
        push(
            &mut diags,
            Diagnostic::warning("Value for undeclared variable", origin.range.clone()).with_detail(
                format!(
                    "A value was assigned to \"{name}\", but the module does not declare a variable of that name"
                ),
            ),
        );
    }
    diags
}
