//! Verifier tool surface.
//!
//! Every operation the planner's agent loop may invoke against a sandbox is
//! a variant of `ToolOp`: the name, parameter schema, and dispatch live in
//! one place, so a tool cannot be registered without declaring its
//! contract. The registry serves a curated subset per task domain — the
//! memory and filesystem baseline plus the domain the task was classified
//! into — never the full set at once.
//!
//! `execute` never returns a Rust error. Unknown tools, bad parameters, and
//! failed commands all come back as error-shaped JSON values, because the
//! caller on the other side is a language model, not a supervisor.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::ToolError;
use crate::sandbox::Sandbox;

/// Path of the free-text scratch memory each sandbox carries.
const PLAN_PATH: &str = "plan.md";

/// Task domains used to curate the tool subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolDomain {
    Filesystem,
    Linting,
    Testing,
    Git,
    Search,
    Memory,
}

impl ToolDomain {
    /// Always served regardless of the task's domain.
    const BASELINE: &'static [ToolDomain] = &[ToolDomain::Memory, ToolDomain::Filesystem];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolDomain::Filesystem => "filesystem",
            ToolDomain::Linting => "linting",
            ToolDomain::Testing => "testing",
            ToolDomain::Git => "git",
            ToolDomain::Search => "search",
            ToolDomain::Memory => "memory",
        }
    }
}

impl std::fmt::Display for ToolDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolDomain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filesystem" => Ok(ToolDomain::Filesystem),
            "linting" => Ok(ToolDomain::Linting),
            "testing" => Ok(ToolDomain::Testing),
            "git" => Ok(ToolDomain::Git),
            "search" => Ok(ToolDomain::Search),
            "memory" => Ok(ToolDomain::Memory),
            other => Err(format!("unknown tool domain '{other}'")),
        }
    }
}

/// The closed set of sandbox operations exposed to the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOp {
    ReadFile,
    WriteFile,
    ListDirectory,
    RunLinter,
    RunTypeCheck,
    RunTests,
    RunCoverage,
    GitDiff,
    GitCommit,
    CreateBranch,
    SearchWorkspace,
    ReadPlan,
    UpdatePlan,
}

impl ToolOp {
    pub const ALL: &'static [ToolOp] = &[
        ToolOp::ReadFile,
        ToolOp::WriteFile,
        ToolOp::ListDirectory,
        ToolOp::RunLinter,
        ToolOp::RunTypeCheck,
        ToolOp::RunTests,
        ToolOp::RunCoverage,
        ToolOp::GitDiff,
        ToolOp::GitCommit,
        ToolOp::CreateBranch,
        ToolOp::SearchWorkspace,
        ToolOp::ReadPlan,
        ToolOp::UpdatePlan,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolOp::ReadFile => "read_file",
            ToolOp::WriteFile => "write_file",
            ToolOp::ListDirectory => "list_directory",
            ToolOp::RunLinter => "run_linter",
            ToolOp::RunTypeCheck => "run_type_check",
            ToolOp::RunTests => "run_tests",
            ToolOp::RunCoverage => "run_coverage",
            ToolOp::GitDiff => "git_diff",
            ToolOp::GitCommit => "git_commit",
            ToolOp::CreateBranch => "create_branch",
            ToolOp::SearchWorkspace => "search_workspace",
            ToolOp::ReadPlan => "read_plan",
            ToolOp::UpdatePlan => "update_plan",
        }
    }

    pub fn domain(&self) -> ToolDomain {
        match self {
            ToolOp::ReadFile | ToolOp::WriteFile | ToolOp::ListDirectory => ToolDomain::Filesystem,
            ToolOp::RunLinter | ToolOp::RunTypeCheck => ToolDomain::Linting,
            ToolOp::RunTests | ToolOp::RunCoverage => ToolDomain::Testing,
            ToolOp::GitDiff | ToolOp::GitCommit | ToolOp::CreateBranch => ToolDomain::Git,
            ToolOp::SearchWorkspace => ToolDomain::Search,
            ToolOp::ReadPlan | ToolOp::UpdatePlan => ToolDomain::Memory,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolOp::ReadFile => "Read the contents of a file in the sandbox workspace.",
            ToolOp::WriteFile => "Write or overwrite a file in the sandbox workspace.",
            ToolOp::ListDirectory => "List entries at a workspace path.",
            ToolOp::RunLinter => "Run the linter on a Python file and return violations.",
            ToolOp::RunTypeCheck => "Run the type checker on a Python module.",
            ToolOp::RunTests => "Run the test runner on specific test files.",
            ToolOp::RunCoverage => "Run tests with a coverage report.",
            ToolOp::GitDiff => "Show the current uncommitted diff in the workspace.",
            ToolOp::GitCommit => "Stage everything and commit with the given message.",
            ToolOp::CreateBranch => "Create and switch to a new git branch.",
            ToolOp::SearchWorkspace => "Search for a literal string across workspace files.",
            ToolOp::ReadPlan => "Read plan.md, the task's scratch memory.",
            ToolOp::UpdatePlan => "Overwrite plan.md with updated progress notes.",
        }
    }

    fn required_params(&self) -> &'static [&'static str] {
        match self {
            ToolOp::ReadFile | ToolOp::ListDirectory => &["path"],
            ToolOp::WriteFile => &["path", "content"],
            ToolOp::RunLinter => &["filepath"],
            ToolOp::RunTypeCheck => &["module"],
            ToolOp::RunTests => &["test_path"],
            ToolOp::RunCoverage => &["test_path"],
            ToolOp::SearchWorkspace => &["pattern"],
            ToolOp::UpdatePlan => &["content"],
            ToolOp::GitCommit => &["message"],
            ToolOp::CreateBranch => &["branch"],
            ToolOp::GitDiff | ToolOp::ReadPlan => &[],
        }
    }

    pub fn schema(&self) -> Value {
        let properties: Value = match self {
            ToolOp::ReadFile | ToolOp::ListDirectory => {
                json!({"path": {"type": "string"}})
            }
            ToolOp::WriteFile => {
                json!({"path": {"type": "string"}, "content": {"type": "string"}})
            }
            ToolOp::RunLinter => json!({"filepath": {"type": "string"}}),
            ToolOp::RunTypeCheck => json!({"module": {"type": "string"}}),
            ToolOp::RunTests => json!({"test_path": {"type": "string"}}),
            ToolOp::RunCoverage => json!({"test_path": {"type": "string"}}),
            ToolOp::GitDiff => json!({}),
            ToolOp::GitCommit => json!({"message": {"type": "string"}}),
            ToolOp::CreateBranch => json!({"branch": {"type": "string"}}),
            ToolOp::SearchWorkspace => {
                json!({"pattern": {"type": "string"}, "extension": {"type": "string"}})
            }
            ToolOp::ReadPlan => json!({}),
            ToolOp::UpdatePlan => json!({"content": {"type": "string"}}),
        };
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required_params(),
        })
    }
}

/// Wire-format description of one tool, as handed to the planner backend.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Registry over the closed `ToolOp` set.
#[derive(Default)]
pub struct ToolRegistry;

impl ToolRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Specs for the baseline domains plus the task's own domain, in
    /// declaration order.
    pub fn for_domain(&self, domain: ToolDomain) -> Vec<ToolSpec> {
        ToolOp::ALL
            .iter()
            .filter(|op| {
                op.domain() == domain || ToolDomain::BASELINE.contains(&op.domain())
            })
            .map(|op| ToolSpec {
                name: op.name().to_string(),
                description: op.description().to_string(),
                input_schema: op.schema(),
            })
            .collect()
    }

    pub fn all_specs(&self) -> Vec<ToolSpec> {
        ToolOp::ALL
            .iter()
            .map(|op| ToolSpec {
                name: op.name().to_string(),
                description: op.description().to_string(),
                input_schema: op.schema(),
            })
            .collect()
    }

    /// Execute a tool by name against a sandbox. Failures of any kind are
    /// reported as error-shaped values, never as Rust errors or panics.
    pub async fn execute(&self, sandbox: &Sandbox, name: &str, params: &Value) -> Value {
        match self.try_execute(sandbox, name, params).await {
            Ok(value) => value,
            Err(e) => {
                debug!(tool = name, error = %e, "tool call failed");
                json!({"error": e.to_string()})
            }
        }
    }

    async fn try_execute(
        &self,
        sandbox: &Sandbox,
        name: &str,
        params: &Value,
    ) -> Result<Value, ToolError> {
        let op = ToolOp::ALL
            .iter()
            .find(|op| op.name() == name)
            .copied()
            .ok_or_else(|| ToolError::UnknownTool {
                name: name.to_string(),
            })?;

        for required in op.required_params() {
            if params.get(required).and_then(Value::as_str).is_none() {
                return Err(ToolError::InvalidParams {
                    tool: name.to_string(),
                    message: format!("missing required string parameter '{required}'"),
                });
            }
        }

        let wrap = |source| ToolError::Execution {
            tool: name.to_string(),
            source,
        };

        let value = match op {
            ToolOp::ReadFile => {
                let path = str_param(params, "path");
                match sandbox.read_file(path).await {
                    Ok(content) => json!({"success": true, "content": content}),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            ToolOp::WriteFile => {
                let path = str_param(params, "path");
                let content = str_param(params, "content");
                sandbox.write_file(path, content).await.map_err(wrap)?;
                json!({"success": true, "path": path})
            }
            ToolOp::ListDirectory => {
                let path = str_param(params, "path");
                let output = sandbox
                    .exec(&format!("ls -1 {}", sh_quote(path)))
                    .await
                    .map_err(wrap)?;
                let entries: Vec<&str> = output.stdout.lines().collect();
                json!({"success": output.success(), "entries": entries})
            }
            ToolOp::RunLinter => {
                let output = sandbox
                    .run_linter(str_param(params, "filepath"))
                    .await
                    .map_err(wrap)?;
                exec_result(&output)
            }
            ToolOp::RunTypeCheck => {
                let output = sandbox
                    .run_type_check(str_param(params, "module"))
                    .await
                    .map_err(wrap)?;
                exec_result(&output)
            }
            ToolOp::RunTests => {
                let path = str_param(params, "test_path").to_string();
                let output = sandbox.run_tests(&[path]).await.map_err(wrap)?;
                exec_result(&output)
            }
            ToolOp::RunCoverage => {
                let path = str_param(params, "test_path").to_string();
                let output = sandbox.run_coverage(&[path]).await.map_err(wrap)?;
                exec_result(&output)
            }
            ToolOp::GitDiff => {
                let output = sandbox.git_diff().await.map_err(wrap)?;
                json!({"success": true, "diff": output.stdout})
            }
            ToolOp::GitCommit => {
                let message = str_param(params, "message");
                let output = sandbox
                    .exec(&format!("git add -A && git commit -m {}", sh_quote(message)))
                    .await
                    .map_err(wrap)?;
                exec_result(&output)
            }
            ToolOp::CreateBranch => {
                let branch = str_param(params, "branch");
                let output = sandbox
                    .exec(&format!("git checkout -b {}", sh_quote(branch)))
                    .await
                    .map_err(wrap)?;
                exec_result(&output)
            }
            ToolOp::SearchWorkspace => {
                let pattern = str_param(params, "pattern");
                let extension = params
                    .get("extension")
                    .and_then(Value::as_str)
                    .unwrap_or(".py");
                let command = format!(
                    "grep -rnF --include='*{}' -e {} . || true",
                    extension,
                    sh_quote(pattern)
                );
                let output = sandbox.exec(&command).await.map_err(wrap)?;
                let matches: Vec<&str> = output.stdout.lines().collect();
                json!({"success": true, "matches": matches, "count": matches.len()})
            }
            ToolOp::ReadPlan => match sandbox.read_file(PLAN_PATH).await {
                Ok(content) => json!({"success": true, "content": content}),
                Err(_) => json!({"success": true, "content": ""}),
            },
            ToolOp::UpdatePlan => {
                sandbox
                    .write_file(PLAN_PATH, str_param(params, "content"))
                    .await
                    .map_err(wrap)?;
                json!({"success": true, "path": PLAN_PATH})
            }
        };
        Ok(value)
    }
}

/// One task's curated view of the registry, bound to its sandbox. The
/// planner only ever sees a session, so off-domain tools are unreachable
/// from the pipeline by construction.
pub struct ToolSession<'a> {
    registry: &'a ToolRegistry,
    sandbox: &'a Sandbox,
    specs: Vec<ToolSpec>,
}

impl<'a> ToolSession<'a> {
    pub fn new(registry: &'a ToolRegistry, sandbox: &'a Sandbox, domain: ToolDomain) -> Self {
        let specs = registry.for_domain(domain);
        Self {
            registry,
            sandbox,
            specs,
        }
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn allows(&self, name: &str) -> bool {
        self.specs.iter().any(|spec| spec.name == name)
    }

    /// Execute a curated tool against this task's sandbox. Names outside
    /// the subset come back as error-shaped values, like any other failure.
    pub async fn call(&self, name: &str, params: &Value) -> Value {
        if !self.allows(name) {
            return json!({"error": format!("tool '{name}' is not available for this task")});
        }
        self.registry.execute(self.sandbox, name, params).await
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> &'a str {
    // Presence was validated before dispatch.
    params.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn exec_result(output: &crate::sandbox::ExecOutput) -> Value {
    json!({
        "success": output.success(),
        "exit_code": output.exit_code,
        "output": output.stdout,
        "errors": output.stderr,
    })
}

fn sh_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxSettings;
    use crate::sandbox::Provisioner;
    use std::path::PathBuf;

    async fn sandbox() -> Sandbox {
        Provisioner::local(SandboxSettings::default(), PathBuf::from("."))
            .provision()
            .await
            .unwrap()
    }

    #[test]
    fn domain_subset_is_baseline_plus_requested() {
        let registry = ToolRegistry::new();
        let specs = registry.for_domain(ToolDomain::Testing);
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();

        assert!(names.contains(&"run_tests"));
        assert!(names.contains(&"run_coverage"));
        // Baseline domains always come along.
        assert!(names.contains(&"read_file"));
        assert!(names.contains(&"read_plan"));
        // Off-domain tools do not.
        assert!(!names.contains(&"run_linter"));
        assert!(!names.contains(&"git_diff"));
    }

    #[test]
    fn schemas_declare_required_params() {
        let schema = ToolOp::WriteFile.schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "path"));
        assert!(required.iter().any(|v| v == "content"));
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_value() {
        let sandbox = sandbox().await;
        let registry = ToolRegistry::new();
        let result = registry.execute(&sandbox, "frobnicate", &json!({})).await;
        assert!(result["error"]
            .as_str()
            .unwrap()
            .contains("frobnicate"));
    }

    #[tokio::test]
    async fn missing_required_param_is_rejected_before_dispatch() {
        let sandbox = sandbox().await;
        let registry = ToolRegistry::new();
        let result = registry.execute(&sandbox, "write_file", &json!({"path": "a.py"})).await;
        assert!(result["error"].as_str().unwrap().contains("content"));
    }

    #[tokio::test]
    async fn write_then_read_through_the_registry() {
        let sandbox = sandbox().await;
        let registry = ToolRegistry::new();

        let written = registry
            .execute(
                &sandbox,
                "write_file",
                &json!({"path": "demo.py", "content": "x = 1\n"}),
            )
            .await;
        assert_eq!(written["success"], json!(true));

        let read = registry
            .execute(&sandbox, "read_file", &json!({"path": "demo.py"}))
            .await;
        assert_eq!(read["content"], json!("x = 1\n"));
    }

    #[tokio::test]
    async fn plan_memory_roundtrip_and_empty_default() {
        let sandbox = sandbox().await;
        let registry = ToolRegistry::new();

        let fresh = registry.execute(&sandbox, "read_plan", &json!({})).await;
        assert_eq!(fresh["content"], json!(""));

        registry
            .execute(&sandbox, "update_plan", &json!({"content": "1. fix bug"}))
            .await;
        let read = registry.execute(&sandbox, "read_plan", &json!({})).await;
        assert_eq!(read["content"], json!("1. fix bug"));
    }

    #[tokio::test]
    async fn search_workspace_finds_literal_matches() {
        let sandbox = sandbox().await;
        let registry = ToolRegistry::new();
        registry
            .execute(
                &sandbox,
                "write_file",
                &json!({"path": "m.py", "content": "needle = 1\n"}),
            )
            .await;

        let result = registry
            .execute(&sandbox, "search_workspace", &json!({"pattern": "needle"}))
            .await;
        assert_eq!(result["count"], json!(1));
    }

    #[test]
    fn git_domain_includes_commit_and_branch_tools() {
        let registry = ToolRegistry::new();
        let names: Vec<String> = registry
            .for_domain(ToolDomain::Git)
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert!(names.contains(&"git_diff".to_string()));
        assert!(names.contains(&"git_commit".to_string()));
        assert!(names.contains(&"create_branch".to_string()));
    }

    #[tokio::test]
    async fn session_blocks_tools_outside_the_curated_subset() {
        let sandbox = sandbox().await;
        let registry = ToolRegistry::new();
        let session = ToolSession::new(&registry, &sandbox, ToolDomain::Testing);

        assert!(session.allows("run_tests"));
        assert!(session.allows("read_plan"));
        assert!(!session.allows("run_linter"));

        let denied = session
            .call("run_linter", &json!({"filepath": "a.py"}))
            .await;
        assert!(denied["error"].as_str().unwrap().contains("run_linter"));

        let allowed = session
            .call("update_plan", &json!({"content": "step 1"}))
            .await;
        assert_eq!(allowed["success"], json!(true));
    }

    #[test]
    fn domain_parses_from_str() {
        assert_eq!("testing".parse::<ToolDomain>().unwrap(), ToolDomain::Testing);
        assert!("warehouse".parse::<ToolDomain>().is_err());
    }
}
