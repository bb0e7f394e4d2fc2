//! Context hydration: from dependency graph to token-bounded task bundles.
//!
//! The hydrator owns the graph built from one repository scan plus a
//! per-file checksum table for change detection. During a task run it is
//! read-only and may be shared across concurrent tasks; `rebuild` and
//! `detect_changed_files` take `&mut self`, so a reindex has exclusive
//! access by construction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::ContextSettings;
use crate::graph::indexer::SourceIndexer;
use crate::graph::{short_checksum, DependencyGraph, NodeKind};

/// Directories never scanned.
const SKIP_DIRS: &[&str] = &[
    ".git",
    ".mender",
    "venv",
    ".venv",
    "__pycache__",
    "node_modules",
    "target",
    ".tox",
];

/// Upstream context reaches this many dependency hops.
const DEP_DEPTH: usize = 2;
/// Affected-test discovery during hydration reaches this many dependent hops.
const TEST_DEPTH: usize = 3;
/// Selective test selection reaches this many dependent hops.
const SELECT_DEPTH: usize = 5;

/// One truncated upstream snippet in a context bundle.
#[derive(Debug, Clone, Serialize)]
pub struct DependencySnippet {
    pub id: String,
    pub kind: NodeKind,
    pub snippet: String,
}

/// The bounded package handed to the planner: task description, upstream
/// dependency snippets, downstream affected tests, and a capped repo listing
/// for orientation.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub issue: String,
    pub target_files: Vec<String>,
    pub dependency_context: Vec<DependencySnippet>,
    pub affected_tests: Vec<String>,
    pub repo_files: Vec<String>,
}

/// Builds and serves per-task context from a repository scan.
pub struct ContextHydrator {
    repo_root: PathBuf,
    settings: ContextSettings,
    indexer: SourceIndexer,
    graph: DependencyGraph,
    /// Repo-relative path -> content checksum at last scan/detection.
    file_checksums: HashMap<String, String>,
}

impl ContextHydrator {
    /// Scan `repo_root` and build the dependency graph.
    pub fn new(repo_root: impl Into<PathBuf>, settings: ContextSettings) -> Result<Self> {
        let mut hydrator = Self {
            repo_root: repo_root.into(),
            settings,
            indexer: SourceIndexer::new(),
            graph: DependencyGraph::new(),
            file_checksums: HashMap::new(),
        };
        hydrator.rebuild()?;
        Ok(hydrator)
    }

    /// Wholesale re-index: the previous graph is discarded, never patched.
    pub fn rebuild(&mut self) -> Result<()> {
        let mut graph = DependencyGraph::new();
        let mut checksums = HashMap::new();

        for entry in source_walk(&self.repo_root) {
            let entry = entry.with_context(|| {
                format!("Failed to walk repository at {}", self.repo_root.display())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("py") {
                continue;
            }
            let relative = self.relative(path);
            for node in self.indexer.parse(path, &relative) {
                graph.add_node(node);
            }
            if let Ok(bytes) = std::fs::read(path) {
                checksums.insert(relative, short_checksum(&bytes));
            }
        }

        info!(
            nodes = graph.node_count(),
            files = checksums.len(),
            root = %self.repo_root.display(),
            "dependency graph built"
        );
        self.graph = graph;
        self.file_checksums = checksums;
        Ok(())
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Build a focused context bundle for one task: upstream dependency
    /// snippets for each target file (depth-bounded, snippet- and
    /// count-capped) and the downstream tests its changes would affect.
    pub fn hydrate_for_task(&self, issue_text: &str, target_files: &[String]) -> ContextBundle {
        let mut dependency_context = Vec::new();
        let mut affected_tests: Vec<String> = Vec::new();

        for file in target_files {
            let module_id = SourceIndexer::module_id(file);

            for node in self.graph.dependencies_of(&module_id, DEP_DEPTH) {
                if dependency_context.len() >= self.settings.max_dep_nodes {
                    break;
                }
                dependency_context.push(DependencySnippet {
                    id: node.id.clone(),
                    kind: node.kind,
                    snippet: truncate(&node.source, self.settings.snippet_limit),
                });
            }

            for node in self.graph.dependents_of(&module_id, TEST_DEPTH) {
                if is_test_path(&node.filepath) && !affected_tests.contains(&node.filepath) {
                    affected_tests.push(node.filepath.clone());
                }
            }
        }

        debug!(
            deps = dependency_context.len(),
            tests = affected_tests.len(),
            "context hydrated"
        );
        ContextBundle {
            issue: issue_text.to_string(),
            target_files: target_files.to_vec(),
            dependency_context,
            affected_tests,
            repo_files: self.repo_listing(),
        }
    }

    /// Files whose content checksum differs from the last recorded value.
    /// The new checksum is recorded, so a second call with no intervening
    /// writes returns nothing.
    pub fn detect_changed_files(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        let mut paths: Vec<String> = self.file_checksums.keys().cloned().collect();
        paths.sort();

        for relative in paths {
            let absolute = self.repo_root.join(&relative);
            let Ok(bytes) = std::fs::read(&absolute) else {
                continue;
            };
            let checksum = short_checksum(&bytes);
            if self.file_checksums.get(&relative) != Some(&checksum) {
                self.file_checksums.insert(relative.clone(), checksum);
                changed.push(relative);
            }
        }
        changed
    }

    /// Selective test discovery: for each changed file, walk reverse edges
    /// to depth 5 and collect test-path-matching dependents. Monotonic in
    /// its input and deduplicated; the result is sorted.
    ///
    /// Soundness is bounded by the indexer's heuristic edge extraction: a
    /// test reached only through an edge the indexer cannot see will be
    /// missed. This is a substitute for full-suite execution, not a proof
    /// of impact coverage.
    pub fn select_tests(&self, changed_files: &[String]) -> Vec<String> {
        let mut tests: Vec<String> = Vec::new();
        for file in changed_files {
            let module_id = SourceIndexer::module_id(file);
            for node in self.graph.dependents_of(&module_id, SELECT_DEPTH) {
                if is_test_path(&node.filepath) && !tests.contains(&node.filepath) {
                    tests.push(node.filepath.clone());
                }
            }
        }
        tests.sort();
        tests
    }

    /// Flat file listing for orientation, capped at the configured maximum.
    fn repo_listing(&self) -> Vec<String> {
        let mut files = Vec::new();
        for entry in source_walk(&self.repo_root) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            files.push(self.relative(entry.path()));
            if files.len() >= self.settings.max_repo_files {
                break;
            }
        }
        files
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.repo_root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

/// Whether a path looks like a test by the fixed heuristic: any path
/// component containing "test" (case-insensitive).
pub fn is_test_path(path: &str) -> bool {
    path.to_lowercase().contains("test")
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn source_walk(root: &Path) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
        })
}
