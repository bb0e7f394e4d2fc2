//! Runtime configuration.
//!
//! Settings live in `.mender/config.toml` under the repository root, with
//! environment variables (loaded via dotenvy in main) taking precedence for
//! credentials. A missing file yields defaults; invalid TOML is an error.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Sandbox provisioning settings.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Target number of pre-warmed sandboxes.
    pub capacity: usize,
    /// Container base image.
    pub image: String,
    /// Memory cap in bytes.
    pub memory_bytes: i64,
    /// CPU quota as a fraction of one core (0.5 = 50%).
    pub cpus: f64,
    /// Hard cap for a single command inside the sandbox.
    pub exec_timeout: Duration,
    /// How long `acquire` waits for a ready sandbox before provisioning
    /// on demand.
    pub acquire_timeout: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            capacity: 3,
            image: "python:3.11-slim".to_string(),
            memory_bytes: 512 * 1024 * 1024,
            cpus: 0.5,
            exec_timeout: Duration::from_secs(120),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Additional attempts after the first (2 retries = 3 attempts total).
    pub max_retries: u32,
    /// Base branch PRs target.
    pub base_branch: String,
    /// Whether a successful task opens a PR.
    pub enable_publish: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_branch: "main".to_string(),
            enable_publish: true,
        }
    }
}

/// Context hydration budgets.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    /// Character cap per dependency snippet.
    pub snippet_limit: usize,
    /// Cap on dependency nodes per bundle.
    pub max_dep_nodes: usize,
    /// Cap on the flat repo listing.
    pub max_repo_files: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            snippet_limit: 500,
            max_dep_nodes: 25,
            max_repo_files: 50,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct MenderConfig {
    pub sandbox: SandboxSettings,
    pub orchestrator: OrchestratorSettings,
    pub context: ContextSettings,
    /// Command used by the CLI planner (overridable via PLANNER_CMD).
    pub planner_cmd: String,
    /// GitHub credentials, from GITHUB_TOKEN / GITHUB_REPO.
    pub github_token: Option<String>,
    pub github_repo: Option<String>,
}

/// Raw TOML structure for `.mender/config.toml`.
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    sandbox: Option<SandboxSection>,
    orchestrator: Option<OrchestratorSection>,
    context: Option<ContextSection>,
    planner: Option<PlannerSection>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    capacity: Option<usize>,
    image: Option<String>,
    memory_mb: Option<i64>,
    cpus: Option<f64>,
    exec_timeout_secs: Option<u64>,
    acquire_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OrchestratorSection {
    max_retries: Option<u32>,
    base_branch: Option<String>,
    enable_publish: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ContextSection {
    snippet_limit: Option<usize>,
    max_dep_nodes: Option<usize>,
    max_repo_files: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PlannerSection {
    command: Option<String>,
}

impl MenderConfig {
    /// Load configuration from `.mender/config.toml` under `repo_root`,
    /// falling back to defaults when the file doesn't exist, then apply
    /// environment overrides.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let mut config = Self {
            planner_cmd: "claude".to_string(),
            ..Self::default()
        };

        let config_path = repo_root.join(".mender").join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let raw: ConfigToml = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            config.apply_toml(raw);
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_toml(&mut self, raw: ConfigToml) {
        if let Some(section) = raw.sandbox {
            if let Some(capacity) = section.capacity {
                self.sandbox.capacity = capacity;
            }
            if let Some(image) = section.image {
                self.sandbox.image = image;
            }
            if let Some(mb) = section.memory_mb {
                self.sandbox.memory_bytes = mb * 1024 * 1024;
            }
            if let Some(cpus) = section.cpus {
                self.sandbox.cpus = cpus;
            }
            if let Some(secs) = section.exec_timeout_secs {
                self.sandbox.exec_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = section.acquire_timeout_secs {
                self.sandbox.acquire_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(section) = raw.orchestrator {
            if let Some(max_retries) = section.max_retries {
                self.orchestrator.max_retries = max_retries;
            }
            if let Some(base_branch) = section.base_branch {
                self.orchestrator.base_branch = base_branch;
            }
            if let Some(enable) = section.enable_publish {
                self.orchestrator.enable_publish = enable;
            }
        }
        if let Some(section) = raw.context {
            if let Some(limit) = section.snippet_limit {
                self.context.snippet_limit = limit;
            }
            if let Some(cap) = section.max_dep_nodes {
                self.context.max_dep_nodes = cap;
            }
            if let Some(cap) = section.max_repo_files {
                self.context.max_repo_files = cap;
            }
        }
        if let Some(section) = raw.planner {
            if let Some(command) = section.command {
                self.planner_cmd = command;
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(cmd) = std::env::var("PLANNER_CMD") {
            if !cmd.is_empty() {
                self.planner_cmd = cmd;
            }
        }
        self.github_token = std::env::var("GITHUB_TOKEN").ok().filter(|s| !s.is_empty());
        self.github_repo = std::env::var("GITHUB_REPO").ok().filter(|s| !s.is_empty());
    }
}
