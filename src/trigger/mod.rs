//! Free-text command intake.
//!
//! Engineers kick off tasks with a chat-style one-liner:
//!
//! ```text
//! <@U02MENDER> fix the NullPointerException in payments.py
//! <@U02MENDER> files: utils.py, models.py - add type hints to all functions
//! ```
//!
//! The grammar is a single regex: an optional leading mention, an optional
//! `files:` prefix terminated by ` - `, then the issue text. Input that
//! doesn't fit parses to `None` — never a crash. The task domain is
//! inferred from keywords when the requester doesn't say.

use regex::Regex;

use crate::orchestrator::{Orchestrator, Task, TaskResult};
use crate::orchestrator::state::TaskStatus;
use crate::tools::ToolDomain;

/// A parsed request, ready to become a `Task`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub issue_text: String,
    pub target_files: Vec<String>,
    pub domain: ToolDomain,
    /// Channel the command arrived on, carried through for the reply.
    pub channel: Option<String>,
}

impl CommandRequest {
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn into_task(self) -> Task {
        let task = Task::new(self.issue_text, self.target_files, self.domain);
        match self.channel {
            Some(channel) => task.with_channel(channel),
            None => task,
        }
    }
}

/// Parse one command line. Leading chat mentions (`<@U123ABC>`) are
/// stripped; blank issue text is rejected.
pub fn parse_command(text: &str) -> Option<CommandRequest> {
    // Compiled per call; intake volume is human-scale.
    let pattern = Regex::new(
        r"(?is)^\s*(?:<@[A-Z0-9]+>\s*)?(?:files?:\s*([\w\./, ]+?)\s*-\s*)?(.+)$",
    )
    .expect("static pattern");

    let captures = pattern.captures(text)?;
    let issue_text = captures.get(2)?.as_str().trim().to_string();
    if issue_text.is_empty() {
        return None;
    }

    let target_files: Vec<String> = captures
        .get(1)
        .map(|m| {
            m.as_str()
                .split([',', ' '])
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(CommandRequest {
        domain: infer_domain(&issue_text),
        issue_text,
        target_files,
        channel: None,
    })
}

/// Keyword-based domain classification; testing is the default because the
/// test gate is the one every task must pass anyway.
pub fn infer_domain(issue_text: &str) -> ToolDomain {
    let lower = issue_text.to_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if mentions(&["lint", "format", "style", "type hint", "typing"]) {
        ToolDomain::Linting
    } else if mentions(&["commit", "branch", "merge", "git"]) {
        ToolDomain::Git
    } else if mentions(&["search", "find usages", "grep"]) {
        ToolDomain::Search
    } else {
        ToolDomain::Testing
    }
}

/// Parse, run, and format in one step: the full intake path.
pub async fn dispatch(orchestrator: &Orchestrator, text: &str) -> Option<String> {
    let request = parse_command(text)?;
    let task = request.into_task();
    let result = orchestrator.run(&task).await;
    Some(format_result(&result))
}

/// Render a task result for the requester's reply thread.
pub fn format_result(result: &TaskResult) -> String {
    let marker = match result.status {
        TaskStatus::Success => "✅",
        TaskStatus::Escalated => "⚠️",
        TaskStatus::Failed => "❌",
        _ => "•",
    };
    let pr_line = if result.pr_url.is_empty() {
        String::new()
    } else {
        format!("\nPR: {}", result.pr_url)
    };
    format!(
        "{} Task {}\nTask ID: `{}`\n{}{}\nAttempts: {}\nDuration: {:.1}s",
        marker,
        result.status,
        result.task_id,
        result.message,
        pr_line,
        result.attempts,
        result.elapsed.as_secs_f64(),
    )
}
