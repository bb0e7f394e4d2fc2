//! Patch planning.
//!
//! The planner is the only non-deterministic component in the pipeline, so
//! its contract is deliberately narrow: given a context bundle and the
//! errors from prior attempts, produce a `Patch`. It never errors — any
//! backend failure degrades to `Patch::empty()`, which the orchestrator
//! treats like a failed gate and retries within budget.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::Command;
use tracing::warn;

use crate::context::ContextBundle;
use crate::tools::{ToolSession, ToolSpec};

const PLANNER_SYSTEM_PROMPT: &str = r#"You are an automated bug-fixing engineer. You receive an issue description, code context for the files involved, and any errors from previous fix attempts.

Respond with:
1. A line `File: <path>` naming the file your fix replaces.
2. One fenced code block containing the COMPLETE new content of that file.
3. A short explanation of the change.

Rules:
- Fix only what the issue describes. Do not refactor unrelated code.
- The code block must be the whole file, not a diff.
- If previous attempt errors are given, your fix must address them.
"#;

/// A proposed fix: complete replacement content for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub code: String,
    pub destination_path: String,
    pub explanation: String,
    /// Self-assessed, 0.0-1.0. Advisory only; gates are the real check.
    pub confidence: f64,
}

impl Patch {
    /// The degenerate patch a planner returns when it has nothing to offer.
    pub fn empty() -> Self {
        Self {
            code: String::new(),
            destination_path: String::new(),
            explanation: "planner produced no patch".to_string(),
            confidence: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.code.trim().is_empty()
    }

    /// Parse a patch out of free-form model output: the first fenced code
    /// block plus an optional `File:` / `filepath:` marker line. Text with
    /// no code block parses to an empty patch.
    pub fn parse(text: &str, default_path: &str) -> Self {
        let code = extract_fenced_block(text).unwrap_or_default();

        let mut destination_path = default_path.to_string();
        for line in text.lines() {
            let trimmed = line.trim();
            let marker = trimmed
                .strip_prefix("File:")
                .or_else(|| trimmed.strip_prefix("filepath:"));
            if let Some(rest) = marker {
                let candidate = rest.trim().trim_matches('`');
                if !candidate.is_empty() {
                    destination_path = candidate.to_string();
                    break;
                }
            }
        }

        let confidence = if code.trim().is_empty() { 0.1 } else { 0.8 };
        Self {
            explanation: text.chars().take(500).collect(),
            code,
            destination_path,
            confidence,
        }
    }
}

fn extract_fenced_block(text: &str) -> Option<String> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(body[..close].to_string())
}

/// Anything that can turn a context bundle into a patch. The tool session
/// is the planner's only handle on the task's sandbox: a domain-curated
/// subset of the registry plus the filesystem/memory baseline.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Infallible by contract: implementations degrade to `Patch::empty()`
    /// instead of returning errors.
    async fn generate(
        &self,
        bundle: &ContextBundle,
        tools: &ToolSession<'_>,
        prior_errors: &[String],
    ) -> Patch;
}

/// Planner backed by an LLM command-line tool invoked per attempt.
pub struct CliPlanner {
    command: String,
    timeout: Duration,
}

impl CliPlanner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(300),
        }
    }

    fn build_prompt(
        bundle: &ContextBundle,
        tool_specs: &[ToolSpec],
        plan_notes: &str,
        prior_errors: &[String],
    ) -> String {
        let mut prompt = format!(
            "## Issue\n{}\n\n## Target files\n{}\n",
            bundle.issue,
            bundle.target_files.join(", ")
        );

        if !bundle.dependency_context.is_empty() {
            prompt.push_str("\n## Code context\n");
            for dep in &bundle.dependency_context {
                prompt.push_str(&format!("### {} ({})\n```python\n{}\n```\n", dep.id, dep.kind, dep.snippet));
            }
        }
        if !bundle.affected_tests.is_empty() {
            prompt.push_str(&format!(
                "\n## Tests that must keep passing\n{}\n",
                bundle.affected_tests.join("\n")
            ));
        }
        if !tool_specs.is_empty() {
            prompt.push_str("\n## Tools available in the sandbox\n");
            for spec in tool_specs {
                prompt.push_str(&format!("- {}: {}\n", spec.name, spec.description));
            }
        }
        if !plan_notes.is_empty() {
            prompt.push_str(&format!("\n## Notes from earlier attempts\n{plan_notes}\n"));
        }
        if !prior_errors.is_empty() {
            prompt.push_str("\n## Errors from previous attempts\n");
            for (i, error) in prior_errors.iter().enumerate() {
                prompt.push_str(&format!("### Attempt {}\n```\n{}\n```\n", i + 1, error));
            }
        }
        prompt
    }

    async fn call_backend(&self, prompt: &str) -> anyhow::Result<String> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.command)
                .args([
                    "--print",
                    "--output-format",
                    "text",
                    "-p",
                    prompt,
                    "--system",
                    PLANNER_SYSTEM_PROMPT,
                ])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("planner CLI timed out after {:?}", self.timeout))??;

        if !output.status.success() {
            anyhow::bail!(
                "planner CLI exited {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Planner for CliPlanner {
    async fn generate(
        &self,
        bundle: &ContextBundle,
        tools: &ToolSession<'_>,
        prior_errors: &[String],
    ) -> Patch {
        let plan = tools.call("read_plan", &json!({})).await;
        let notes = plan["content"].as_str().unwrap_or_default();
        let prompt = Self::build_prompt(bundle, tools.specs(), notes, prior_errors);
        let default_path = bundle
            .target_files
            .first()
            .cloned()
            .unwrap_or_else(|| "fix.py".to_string());

        match self.call_backend(&prompt).await {
            Ok(response) => {
                let patch = Patch::parse(&response, &default_path);
                if !patch.is_empty() {
                    let note = format!(
                        "Last patch targeted {}: {}",
                        patch.destination_path, patch.explanation
                    );
                    tools.call("update_plan", &json!({"content": note})).await;
                }
                patch
            }
            Err(e) => {
                warn!(error = %e, "planner backend failed, returning empty patch");
                Patch::empty()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_python_fenced_block_and_file_marker() {
        let text = "Here is the fix.\n\nFile: billing/refunds.py\n```python\ndef refund():\n    return 0\n```\nDone.";
        let patch = Patch::parse(text, "fallback.py");
        assert_eq!(patch.destination_path, "billing/refunds.py");
        assert_eq!(patch.code, "def refund():\n    return 0\n");
        assert!(!patch.is_empty());
        assert!(patch.confidence > 0.5);
    }

    #[test]
    fn falls_back_to_default_path_without_marker() {
        let text = "```\nx = 1\n```";
        let patch = Patch::parse(text, "target.py");
        assert_eq!(patch.destination_path, "target.py");
        assert_eq!(patch.code, "x = 1\n");
    }

    #[test]
    fn text_without_code_block_is_empty_patch() {
        let patch = Patch::parse("I could not determine a fix for this issue.", "a.py");
        assert!(patch.is_empty());
        assert!(patch.confidence < 0.5);
    }

    #[test]
    fn filepath_marker_variant_is_accepted() {
        let text = "filepath: src/app.py\n```python\npass\n```";
        let patch = Patch::parse(text, "fallback.py");
        assert_eq!(patch.destination_path, "src/app.py");
    }

    #[test]
    fn empty_patch_is_empty() {
        assert!(Patch::empty().is_empty());
    }

    fn bundle() -> ContextBundle {
        ContextBundle {
            issue: "division by zero in refunds".to_string(),
            target_files: vec!["billing.py".to_string()],
            dependency_context: vec![],
            affected_tests: vec!["test_billing.py".to_string()],
            repo_files: vec![],
        }
    }

    #[test]
    fn prompt_includes_prior_errors() {
        let prompt =
            CliPlanner::build_prompt(&bundle(), &[], "", &["E501 line too long".to_string()]);
        assert!(prompt.contains("division by zero"));
        assert!(prompt.contains("E501"));
        assert!(prompt.contains("test_billing.py"));
    }

    #[test]
    fn prompt_lists_tools_and_plan_notes() {
        let specs = vec![ToolSpec {
            name: "run_tests".to_string(),
            description: "Run the test runner on specific test files.".to_string(),
            input_schema: json!({}),
        }];
        let prompt =
            CliPlanner::build_prompt(&bundle(), &specs, "guard the divisor first", &[]);
        assert!(prompt.contains("run_tests"));
        assert!(prompt.contains("guard the divisor first"));
    }
}
