//! Parser for the HCL subset understood by the analysis stages.
//!
//! Supports blocks with quoted or bare labels, nested blocks, `name = expr`
//! attributes whose expressions may span lines while brackets are open, and
//! `#` / `//` line comments. Anything else is reported as a diagnostic and
//! skipped, so a partially valid file still yields its valid parts.

use crate::ast::{Attribute, Block, ParsedFile};
use hclsense_types::{Diagnostic, Pos, Range};

/// Parse one file
pub fn parse_file(name: &str, text: &str) -> (ParsedFile, Vec<Diagnostic>) {
    let mut parser = Parser {
        name,
        file: ParsedFile {
            name: name.to_string(),
            digest: blake3::hash(text.as_bytes()),
            blocks: Vec::new(),
            attributes: Vec::new(),
        },
        stack: Vec::new(),
        diags: Vec::new(),
    };

    let lines = split_lines(text);
    let mut idx = 0;
    while idx < lines.len() {
        idx = parser.line(&lines, idx);
    }

    while let Some(block) = parser.stack.pop() {
        parser.diags.push(
            Diagnostic::error("Unclosed configuration block", block.range.clone()).with_detail(
                format!("There is no closing brace for this {:?} block", block.block_type),
            ),
        );
        parser.attach(block);
    }

    (parser.file, parser.diags)
}

/// Digest of file content, as stored on [`ParsedFile`]
pub fn digest(text: &str) -> blake3::Hash {
    blake3::hash(text.as_bytes())
}

struct Line<'a> {
    byte: usize,
    text: &'a str,
}

fn split_lines(text: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut byte = 0;
    for raw in text.split('\n') {
        lines.push(Line {
            byte,
            text: raw.strip_suffix('\r').unwrap_or(raw),
        });
        byte += raw.len() + 1;
    }
    lines
}

struct Parser<'n> {
    name: &'n str,
    file: ParsedFile,
    stack: Vec<Block>,
    diags: Vec<Diagnostic>,
}

impl Parser<'_> {
    fn pos(&self, lines: &[Line<'_>], idx: usize, column: usize) -> Pos {
        Pos {
            line: idx + 1,
            column: column + 1,
            byte: lines[idx].byte + column,
        }
    }

    fn range(&self, start: Pos, end: Pos) -> Range {
        Range {
            filename: self.name.to_string(),
            start,
            end,
        }
    }

    fn attach(&mut self, block: Block) {
        if block.block_type.is_empty() {
            return;
        }
        match self.stack.last_mut() {
            Some(parent) => parent.blocks.push(block),
            None => self.file.blocks.push(block),
        }
    }

    /// Handle the line at `idx`, returning the index of the next line
    fn line(&mut self, lines: &[Line<'_>], idx: usize) -> usize {
        let raw = lines[idx].text;
        let content = strip_comment(raw).trim();
        if content.is_empty() {
            return idx + 1;
        }
        let indent = raw.len() - raw.trim_start().len();
        let start = self.pos(lines, idx, indent);
        let end = self.pos(lines, idx, indent + content.len());

        if content == "}" {
            match self.stack.pop() {
                Some(mut block) => {
                    block.range.end = end;
                    self.attach(block);
                }
                None => {
                    let range = self.range(start, end);
                    self.diags
                        .push(Diagnostic::error("Unexpected closing brace", range));
                }
            }
            return idx + 1;
        }

        if let Some((name, rhs)) = split_attribute(content) {
            return self.attribute(lines, idx, name, rhs, start);
        }

        let (header, empty_body) = if let Some(header) = content.strip_suffix("{}") {
            (Some(header), true)
        } else {
            (content.strip_suffix('{'), false)
        };

        let range = self.range(start, end);
        match header.and_then(parse_header) {
            Some((block_type, labels)) => {
                let block = Block {
                    block_type,
                    labels,
                    attributes: Vec::new(),
                    blocks: Vec::new(),
                    range,
                };
                if empty_body {
                    self.attach(block);
                } else {
                    self.stack.push(block);
                }
            }
            None if header.is_some() => {
                self.diags
                    .push(Diagnostic::error("Invalid block definition", range.clone()));
                if !empty_body {
                    // placeholder keeps braces balanced; dropped on close
                    self.stack.push(Block {
                        block_type: String::new(),
                        labels: Vec::new(),
                        attributes: Vec::new(),
                        blocks: Vec::new(),
                        range,
                    });
                }
            }
            None => {
                self.diags.push(
                    Diagnostic::error("Argument or block definition required", range)
                        .with_detail("An argument or block definition is required here"),
                );
            }
        }
        idx + 1
    }

    fn attribute(&mut self, lines: &[Line<'_>], idx: usize, name: &str, rhs: &str, start: Pos) -> usize {
        let mut expr = rhs.trim().to_string();
        let mut depth = bracket_depth(&expr);
        let mut last = idx;

        while depth > 0 && last + 1 < lines.len() {
            last += 1;
            let next = strip_comment(lines[last].text).trim();
            expr.push('\n');
            expr.push_str(next);
            depth += bracket_depth(next);
        }

        let last_text = lines[last].text;
        let end = self.pos(lines, last, last_text.trim_end().len());
        let range = self.range(start, end);

        if depth > 0 {
            self.diags.push(Diagnostic::error("Unclosed expression", range.clone()));
        } else if expr.is_empty() {
            self.diags.push(Diagnostic::error("Missing attribute value", range.clone()));
        }

        let attr = Attribute {
            name: name.to_string(),
            expr,
            range,
        };
        match self.stack.last_mut() {
            Some(block) => block.attributes.push(attr),
            None => self.file.attributes.push(attr),
        }
        last + 1
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Split `name = expr`, ignoring comparison operators
fn split_attribute(content: &str) -> Option<(&str, &str)> {
    let bytes = content.as_bytes();
    let eq = content.find('=')?;
    if bytes.get(eq + 1) == Some(&b'=') || bytes.get(eq + 1) == Some(&b'>') {
        return None;
    }
    let name = content[..eq].trim();
    is_identifier(name).then(|| (name, &content[eq + 1..]))
}

fn parse_header(header: &str) -> Option<(String, Vec<String>)> {
    let tokens = tokenize(header.trim())?;
    let (first, rest) = tokens.split_first()?;
    if !is_identifier(first) {
        return None;
    }

    let mut labels = Vec::with_capacity(rest.len());
    for token in rest {
        if let Some(quoted) = token.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
            labels.push(quoted.to_string());
        } else if is_identifier(token) {
            labels.push(token.to_string());
        } else {
            return None;
        }
    }
    Some((first.to_string(), labels))
}

/// Whitespace-separated tokens; quoted tokens keep their quotes
fn tokenize(s: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_string {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                tokens.push(std::mem::take(&mut current));
            }
        } else if c == '"' {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            in_string = true;
            current.push(c);
        } else if c.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }

    if in_string {
        return None;
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Some(tokens)
}

/// Text before any line comment outside string literals
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else if b == b'"' {
            in_string = true;
        } else if b == b'#' || (b == b'/' && bytes.get(idx + 1) == Some(&b'/')) {
            return &line[..idx];
        }
        idx += 1;
    }
    line
}

/// Net count of opening brackets outside string literals
fn bracket_depth(s: &str) -> i32 {
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' | '(' => depth += 1,
            '}' | ']' | ')' => depth -= 1,
            _ => {}
        }
    }
    depth
}
