//! Reference targets and origins
//!
//! Targets are the addressable things a directory declares (`var.region`,
//! `local.tags`, `module.network`, `aws_instance.web`). Origins are the
//! traversals in attribute expressions that point at them.

use crate::ast::{Block, Files};
use hclsense_types::{Pos, Range};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;

static ORIGIN_RE: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"\b(var|local|module)\.([A-Za-z_][A-Za-z0-9_-]*)"));

/// Something that can be referenced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefTarget {
    pub addr: String,
    pub range: Range,
}

/// A reference found in an expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefOrigin {
    pub addr: String,
    pub range: Range,
}

fn target(addr: String, block: &Block) -> RefTarget {
    RefTarget {
        addr,
        range: block.range.clone(),
    }
}

/// Targets declared by labelled blocks: `variable`, `locals`, `module` and
/// any further block type mapped by `extra`
pub fn collect_targets<F>(files: &Files, extra: F) -> Vec<RefTarget>
where
    F: Fn(&Block) -> Option<String>,
{
    let mut targets = Vec::new();
    for file in files.values() {
        for block in &file.blocks {
            match block.block_type.as_str() {
                "variable" => {
                    if let Some(name) = block.label(0) {
                        targets.push(target(format!("var.{name}"), block));
                    }
                }
                "locals" => {
                    for attr in &block.attributes {
                        targets.push(RefTarget {
                            addr: format!("local.{}", attr.name),
                            range: attr.range.clone(),
                        });
                    }
                }
                "module" => {
                    if let Some(name) = block.label(0) {
                        targets.push(target(format!("module.{name}"), block));
                    }
                }
                _ => {
                    if let Some(addr) = extra(block) {
                        targets.push(target(addr, block));
                    }
                }
            }
        }
    }
    targets
}

/// Scan every attribute expression for `var.`, `local.` and `module.`
/// traversals
pub fn collect_origins(files: &Files) -> Vec<RefOrigin> {
    let re = match ORIGIN_RE.as_ref() {
        Ok(re) => re,
        Err(err) => {
            tracing::error!(error = %err, "invalid origin pattern");
            return Vec::new();
        }
    };

    let mut origins = Vec::new();
    for file in files.values() {
        for attr in file.walk_attributes() {
            for caps in re.captures_iter(&attr.expr) {
                let (Some(whole), Some(kind), Some(name)) = (caps.get(0), caps.get(1), caps.get(2))
                else {
                    continue;
                };
                if in_string_literal(&attr.expr, whole.start()) {
                    continue;
                }
                origins.push(RefOrigin {
                    addr: format!("{}.{}", kind.as_str(), name.as_str()),
                    range: offset_range(&attr.range, &attr.expr, whole.start(), whole.end()),
                });
            }
        }
    }
    origins
}

/// Origins without a matching target, in source order
pub fn unreferenced<'a>(origins: &'a [RefOrigin], targets: &[RefTarget]) -> Vec<&'a RefOrigin> {
    let declared: BTreeSet<&str> = targets.iter().map(|t| t.addr.as_str()).collect();
    origins
        .iter()
        .filter(|origin| !declared.contains(origin.addr.as_str()))
        .collect()
}

/// Whether `idx` falls inside a plain string literal (outside `${...}`)
fn in_string_literal(expr: &str, idx: usize) -> bool {
    let bytes = expr.as_bytes();
    let mut in_string = false;
    let mut interp = 0usize;
    let mut i = 0;
    while i < idx && i < bytes.len() {
        match bytes[i] {
            b'\\' if in_string => i += 1,
            b'"' if interp == 0 => in_string = !in_string,
            b'$' if in_string && bytes.get(i + 1) == Some(&b'{') => {
                interp += 1;
                i += 1;
            }
            b'}' if interp > 0 => interp -= 1,
            _ => {}
        }
        i += 1;
    }
    in_string && interp == 0
}

/// Range of `expr[start..end]`, given the range of the attribute owning it
fn offset_range(attr_range: &Range, expr: &str, start: usize, end: usize) -> Range {
    // expressions are stored line-trimmed, so only line numbers are exact
    let line = attr_range.start.line + expr[..start].matches('\n').count();
    let line_start = expr[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = start - line_start + 1;
    Range {
        filename: attr_range.filename.clone(),
        start: Pos {
            line,
            column,
            byte: attr_range.start.byte,
        },
        end: Pos {
            line,
            column: column + (end - start),
            byte: attr_range.start.byte,
        },
    }
}
