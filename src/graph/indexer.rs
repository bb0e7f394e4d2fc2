//! Heuristic source indexer.
//!
//! Turns one Python source file into graph nodes: a module node whose
//! dependencies are its import targets, plus one node per top-level class
//! and function. Function call edges are extracted lexically — unqualified
//! identifiers and attribute names followed by `(` — with no symbol
//! resolution. That keeps indexing fast and language-server-free, at the
//! cost of false edges (shadowed names) and missed ones (aliased calls);
//! consumers must not treat the edge set as complete.
//!
//! Files that cannot be read or decoded are skipped with a warning and
//! indexing continues. A broken file never aborts a build.

use std::path::Path;

use regex::Regex;
use tracing::warn;

use super::{CodeNode, NodeKind};

/// Python keywords that look like call sites to the lexical extractor.
const NON_CALL_KEYWORDS: &[&str] = &[
    "if", "elif", "while", "for", "return", "and", "or", "not", "in", "is", "def", "class",
    "with", "assert", "yield", "lambda", "except", "raise", "print",
];

/// Regex-based indexer for Python sources.
pub struct SourceIndexer {
    re_import: Regex,
    re_from_import: Regex,
    re_class: Regex,
    re_def: Regex,
    re_call: Regex,
}

impl Default for SourceIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceIndexer {
    pub fn new() -> Self {
        Self {
            re_import: Regex::new(r"(?m)^\s*import\s+([\w\.]+)").expect("static pattern"),
            re_from_import: Regex::new(r"(?m)^\s*from\s+([\w\.]+)\s+import").expect("static pattern"),
            re_class: Regex::new(r"^class\s+(\w+)").expect("static pattern"),
            re_def: Regex::new(r"^(?:async\s+)?def\s+(\w+)").expect("static pattern"),
            re_call: Regex::new(r"([A-Za-z_]\w*)\s*\(").expect("static pattern"),
        }
    }

    /// Derive the module id for a repo-relative path:
    /// `billing/refunds.py` → `billing.refunds`.
    pub fn module_id(relative_path: &str) -> String {
        let normalized = relative_path.replace('\\', "/");
        let trimmed = normalized.strip_suffix(".py").unwrap_or(&normalized);
        trimmed.replace('/', ".")
    }

    /// Read and index one file. Unreadable input yields an empty node list,
    /// never an error.
    pub fn parse(&self, path: &Path, relative_path: &str) -> Vec<CodeNode> {
        match std::fs::read_to_string(path) {
            Ok(source) => self.parse_source(relative_path, &source),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable file");
                Vec::new()
            }
        }
    }

    /// Index already-loaded source for a repo-relative path.
    pub fn parse_source(&self, relative_path: &str, source: &str) -> Vec<CodeNode> {
        let module = Self::module_id(relative_path);
        let mut nodes = Vec::new();

        let imports = self.extract_imports(source);
        nodes.push(CodeNode::new(
            module.clone(),
            relative_path,
            NodeKind::Module,
            source,
            0,
            imports,
        ));

        for block in top_level_blocks(source) {
            if let Some(captures) = self.re_class.captures(&block.header) {
                nodes.push(CodeNode::new(
                    format!("{}.{}", module, &captures[1]),
                    relative_path,
                    NodeKind::Class,
                    &block.source,
                    block.line,
                    vec![module.clone()],
                ));
            } else if let Some(captures) = self.re_def.captures(&block.header) {
                // Extract calls from the body only, so the signature itself
                // never registers as a call site.
                let body = block
                    .source
                    .split_once('\n')
                    .map(|(_, rest)| rest)
                    .unwrap_or("");
                let mut dependencies = vec![module.clone()];
                dependencies.extend(self.extract_calls(body));
                nodes.push(CodeNode::new(
                    format!("{}.{}", module, &captures[1]),
                    relative_path,
                    NodeKind::Function,
                    &block.source,
                    block.line,
                    dependencies,
                ));
            }
        }
        nodes
    }

    fn extract_imports(&self, source: &str) -> Vec<String> {
        let mut imports = Vec::new();
        for captures in self.re_import.captures_iter(source) {
            let target = captures[1].to_string();
            if !imports.contains(&target) {
                imports.push(target);
            }
        }
        for captures in self.re_from_import.captures_iter(source) {
            let target = captures[1].to_string();
            if !imports.contains(&target) {
                imports.push(target);
            }
        }
        imports
    }

    /// Lexical call-target extraction: any identifier (including the name
    /// after a dot) directly followed by `(`, keywords excluded,
    /// first-occurrence order preserved.
    fn extract_calls(&self, body: &str) -> Vec<String> {
        let mut calls = Vec::new();
        for captures in self.re_call.captures_iter(body) {
            let name = &captures[1];
            if NON_CALL_KEYWORDS.contains(&name) {
                continue;
            }
            if !calls.iter().any(|c| c == name) {
                calls.push(name.to_string());
            }
        }
        calls
    }
}

struct Block {
    header: String,
    source: String,
    line: usize,
}

/// Slice a source file into top-level `class`/`def` blocks by indentation:
/// a block runs from its column-zero header until the next non-blank
/// column-zero line.
fn top_level_blocks(source: &str) -> Vec<Block> {
    let lines: Vec<&str> = source.lines().collect();
    let mut blocks = Vec::new();
    let mut index = 0;

    while index < lines.len() {
        let line = lines[index];
        let is_header = line.starts_with("class ")
            || line.starts_with("def ")
            || line.starts_with("async def ");
        if !is_header {
            index += 1;
            continue;
        }

        let start = index;
        index += 1;
        while index < lines.len() {
            let next = lines[index];
            let blank = next.trim().is_empty();
            let indented = next.starts_with(' ') || next.starts_with('\t');
            if !blank && !indented {
                break;
            }
            index += 1;
        }

        blocks.push(Block {
            header: line.to_string(),
            source: lines[start..index].join("\n"),
            line: start + 1,
        });
    }
    blocks
}
