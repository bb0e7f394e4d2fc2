//! The task execution pipeline.
//!
//! One `run` call takes a task through the full lifecycle: acquire a
//! sandbox, hydrate context, then loop planner → lint gate → selective test
//! gate under a hard retry budget. Gates are deterministic and ordered
//! cheapest-first; the planner only ever sees its own prior failures, fed
//! back verbatim but bounded. A task that beats both gates gets published
//! as a pull request; one that exhausts its budget escalates to a human.
//!
//! Failure vocabulary: `Escalated` means the system worked and the patches
//! did not; `Failed` means the system itself broke.

pub mod state;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::config::OrchestratorSettings;
use crate::context::ContextHydrator;
use crate::errors::{OrchestratorError, SandboxError};
use crate::planner::{Patch, Planner};
use crate::publish::{render_pr_body, PrSummary, PublishOutcome, Publisher};
use crate::sandbox::pool::SandboxPool;
use crate::sandbox::{ExecOutput, Sandbox};
use crate::tools::{ToolDomain, ToolRegistry, ToolSession};
use state::{transition, TaskEvent, TaskStatus};

/// Cap on each error blob fed back to the planner.
const ERROR_FEEDBACK_LIMIT: usize = 2000;

/// One unit of work: a described problem scoped to target files.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub issue_text: String,
    pub target_files: Vec<String>,
    pub domain: ToolDomain,
    pub priority: String,
    pub reviewers: Vec<String>,
    /// Chat channel to reply in, when the task came through the trigger.
    pub channel: Option<String>,
}

impl Task {
    pub fn new(
        issue_text: impl Into<String>,
        target_files: Vec<String>,
        domain: ToolDomain,
    ) -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("mender-{}", &hex[..8]),
            issue_text: issue_text.into(),
            target_files,
            domain,
            priority: "normal".to_string(),
            reviewers: Vec::new(),
            channel: None,
        }
    }

    pub fn with_reviewers(mut self, reviewers: Vec<String>) -> Self {
        self.reviewers = reviewers;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

/// Final outcome of one task run. Every `run` call produces one of these;
/// faults are reported here, never propagated.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
    pub pr_url: String,
    pub attempts: u32,
    pub elapsed: Duration,
    pub explanation: String,
}

/// The deterministic gates, abstracted so alternative checkers can stand in
/// for the stock lint/test commands.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn lint(&self, sandbox: &Sandbox, filepath: &str) -> Result<ExecOutput, SandboxError>;
    async fn test(&self, sandbox: &Sandbox, paths: &[String]) -> Result<ExecOutput, SandboxError>;
}

/// Stock gates: the sandbox's ruff and pytest command templates.
pub struct SandboxVerifier;

#[async_trait]
impl Verifier for SandboxVerifier {
    async fn lint(&self, sandbox: &Sandbox, filepath: &str) -> Result<ExecOutput, SandboxError> {
        sandbox.run_linter(filepath).await
    }

    async fn test(&self, sandbox: &Sandbox, paths: &[String]) -> Result<ExecOutput, SandboxError> {
        sandbox.run_tests(paths).await
    }
}

/// Ties the pool, hydrator, planner, gates, and publisher into the
/// bounded-retry loop.
pub struct Orchestrator {
    pool: Arc<SandboxPool>,
    hydrator: ContextHydrator,
    planner: Arc<dyn Planner>,
    verifier: Arc<dyn Verifier>,
    publisher: Publisher,
    tools: ToolRegistry,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<SandboxPool>,
        hydrator: ContextHydrator,
        planner: Arc<dyn Planner>,
        publisher: Publisher,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pool,
            hydrator,
            planner,
            verifier: Arc::new(SandboxVerifier),
            publisher,
            tools: ToolRegistry::new(),
            settings,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn hydrator(&self) -> &ContextHydrator {
        &self.hydrator
    }

    /// Tear down the underlying sandbox pool.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Run one task to a terminal state. Infallible at the signature: every
    /// outcome, including internal faults, is a `TaskResult`. The acquired
    /// sandbox is released exactly once on every exit path.
    pub async fn run(&self, task: &Task) -> TaskResult {
        let start = Instant::now();
        info!(task = %task.id, domain = %task.domain, "task started");

        let sandbox = match self.pool.acquire().await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                error!(task = %task.id, error = %e, "sandbox acquisition failed");
                return self.fault_result(task, &e.to_string(), start);
            }
        };

        let outcome = self.execute(task, &sandbox, start).await;
        self.pool.release(sandbox, false).await;

        match outcome {
            Ok(result) => {
                info!(
                    task = %task.id,
                    status = %result.status,
                    attempts = result.attempts,
                    "task finished"
                );
                result
            }
            Err(e) => {
                error!(task = %task.id, error = %e, "task faulted");
                self.fault_result(task, &e.to_string(), start)
            }
        }
    }

    /// Run tasks sequentially, collecting every result.
    pub async fn run_batch(&self, tasks: &[Task]) -> Vec<TaskResult> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(self.run(task).await);
        }
        results
    }

    async fn execute(
        &self,
        task: &Task,
        sandbox: &Arc<Sandbox>,
        start: Instant,
    ) -> Result<TaskResult, OrchestratorError> {
        let bundle = self
            .hydrator
            .hydrate_for_task(&task.issue_text, &task.target_files);
        // The planner's only view of the sandbox: the task's domain subset
        // plus the filesystem/memory baseline.
        let tools = ToolSession::new(&self.tools, sandbox, task.domain);

        let budget = self.settings.max_retries;
        let mut status = transition(TaskStatus::Pending, TaskEvent::SandboxAcquired, 1, budget);
        let mut prior_errors: Vec<String> = Vec::new();
        let mut accepted: Option<(Patch, u32)> = None;

        for attempt in 1..=budget + 1 {
            info!(task = %task.id, attempt, total = budget + 1, "attempt started");

            let patch = self.planner.generate(&bundle, &tools, &prior_errors).await;
            if patch.is_empty() {
                warn!(task = %task.id, attempt, "planner produced an empty patch");
                prior_errors.push(format!("Empty code patch on attempt {attempt}"));
                status = transition(status, TaskEvent::PatchEmpty, attempt, budget);
                if status.is_terminal() {
                    break;
                }
                continue;
            }

            sandbox
                .write_file(&patch.destination_path, &patch.code)
                .await
                .map_err(|e| OrchestratorError::PatchWrite {
                    path: patch.destination_path.clone().into(),
                    source: e,
                })?;
            status = transition(status, TaskEvent::PatchWritten, attempt, budget);

            let lint = self
                .verifier
                .lint(sandbox, &patch.destination_path)
                .await
                .map_err(OrchestratorError::GateCommand)?;
            if !lint.success() {
                warn!(task = %task.id, attempt, exit = lint.exit_code, "lint gate failed");
                prior_errors.push(feedback("LINT FAILED", &lint));
                status = transition(status, TaskEvent::GateFailed, attempt, budget);
                if status.is_terminal() {
                    break;
                }
                continue;
            }
            status = transition(status, TaskEvent::LintPassed, attempt, budget);

            let tests = self
                .verifier
                .test(sandbox, &bundle.affected_tests)
                .await
                .map_err(OrchestratorError::GateCommand)?;
            if !tests.success() {
                warn!(task = %task.id, attempt, exit = tests.exit_code, "test gate failed");
                prior_errors.push(feedback("TESTS FAILED", &tests));
                status = transition(status, TaskEvent::GateFailed, attempt, budget);
                if status.is_terminal() {
                    break;
                }
                continue;
            }

            status = transition(status, TaskEvent::TestsPassed, attempt, budget);
            accepted = Some((patch, attempt));
            break;
        }

        let elapsed = start.elapsed();
        match (status, accepted) {
            (TaskStatus::Success, Some((patch, attempts))) => {
                let pr_url = if self.settings.enable_publish {
                    self.publish(task, &patch, attempts, sandbox).await
                } else {
                    String::new()
                };
                Ok(TaskResult {
                    task_id: task.id.clone(),
                    status: TaskStatus::Success,
                    message: format!("Task completed successfully in {attempts} attempt(s)."),
                    pr_url,
                    attempts,
                    elapsed,
                    explanation: patch.explanation,
                })
            }
            _ => {
                let last_error = prior_errors.last().cloned().unwrap_or_default();
                let preview: String = last_error.chars().take(200).collect();
                Ok(TaskResult {
                    task_id: task.id.clone(),
                    status: TaskStatus::Escalated,
                    message: format!(
                        "Escalated to human after {budget} retries. Last error: {preview}"
                    ),
                    pr_url: String::new(),
                    attempts: budget + 1,
                    elapsed,
                    explanation: String::new(),
                })
            }
        }
    }

    /// Branch, commit, push, open a PR. Git plumbing is best-effort; a
    /// publish failure never demotes a successful task.
    async fn publish(
        &self,
        task: &Task,
        patch: &Patch,
        attempts: u32,
        sandbox: &Arc<Sandbox>,
    ) -> String {
        let branch = format!("mender/{}/{}", task.id, task.domain);
        for command in [
            format!("git checkout -b {branch}"),
            "git add -A".to_string(),
            format!("git commit -m 'Automated fix: {}'", task.id),
            format!("git push origin {branch}"),
        ] {
            match sandbox.exec(&command).await {
                Ok(output) if !output.success() => {
                    warn!(task = %task.id, %command, exit = output.exit_code, "publish step failed");
                }
                Err(e) => warn!(task = %task.id, %command, error = %e, "publish step errored"),
                Ok(_) => {}
            }
        }

        let title_preview: String = task.issue_text.chars().take(60).collect();
        let body = render_pr_body(&PrSummary {
            task_id: &task.id,
            priority: &task.priority,
            domain: task.domain.as_str(),
            issue: &task.issue_text,
            explanation: &patch.explanation,
            filepath: &patch.destination_path,
            confidence: patch.confidence,
            attempts,
        });

        match self
            .publisher
            .create_pr(
                &branch,
                &format!("[mender] {title_preview}"),
                &body,
                &self.settings.base_branch,
                &task.reviewers,
            )
            .await
        {
            PublishOutcome::Url(url) => url,
            PublishOutcome::Offline(placeholder) => placeholder,
        }
    }

    fn fault_result(&self, task: &Task, message: &str, start: Instant) -> TaskResult {
        TaskResult {
            task_id: task.id.clone(),
            status: TaskStatus::Failed,
            message: format!("System error: {message}"),
            pr_url: String::new(),
            attempts: 0,
            elapsed: start.elapsed(),
            explanation: String::new(),
        }
    }
}

fn feedback(label: &str, output: &ExecOutput) -> String {
    let blob = format!("{label}:\n{}\n{}", output.stdout, output.stderr);
    blob.chars().take(ERROR_FEEDBACK_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MenderConfig, SandboxSettings};
    use crate::context::ContextBundle;
    use crate::sandbox::Provisioner;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct EmptyPlanner;

    #[async_trait]
    impl Planner for EmptyPlanner {
        async fn generate(
            &self,
            _bundle: &ContextBundle,
            _tools: &ToolSession<'_>,
            _prior: &[String],
        ) -> Patch {
            Patch::empty()
        }
    }

    struct FixedPlanner;

    #[async_trait]
    impl Planner for FixedPlanner {
        async fn generate(
            &self,
            _bundle: &ContextBundle,
            tools: &ToolSession<'_>,
            _prior: &[String],
        ) -> Patch {
            // A real planner reaches the sandbox only through its session.
            tools
                .call("update_plan", &serde_json::json!({"content": "writing fix.py"}))
                .await;
            Patch {
                code: "x = 1\n".to_string(),
                destination_path: "fix.py".to_string(),
                explanation: "set x".to_string(),
                confidence: 0.8,
            }
        }
    }

    /// Records which tools the session offered, so tests can check what
    /// the run path exposes.
    struct SessionInspectingPlanner {
        saw: Mutex<Option<(bool, bool)>>,
    }

    #[async_trait]
    impl Planner for SessionInspectingPlanner {
        async fn generate(
            &self,
            _bundle: &ContextBundle,
            tools: &ToolSession<'_>,
            _prior: &[String],
        ) -> Patch {
            *self.saw.lock().unwrap() =
                Some((tools.allows("run_tests"), tools.allows("run_linter")));
            Patch::empty()
        }
    }

    /// Gate outcomes scripted per call: pops the next exit code, passing
    /// once the script runs out.
    struct ScriptedVerifier {
        lint_exits: Mutex<Vec<i64>>,
        test_exits: Mutex<Vec<i64>>,
    }

    impl ScriptedVerifier {
        fn new(lint_exits: Vec<i64>, test_exits: Vec<i64>) -> Self {
            Self {
                lint_exits: Mutex::new(lint_exits),
                test_exits: Mutex::new(test_exits),
            }
        }

        fn pop(queue: &Mutex<Vec<i64>>) -> i64 {
            let mut queue = queue.lock().unwrap();
            if queue.is_empty() {
                0
            } else {
                queue.remove(0)
            }
        }

        fn output(exit_code: i64) -> ExecOutput {
            ExecOutput {
                exit_code,
                stdout: if exit_code == 0 {
                    String::new()
                } else {
                    "E999 synthetic violation".to_string()
                },
                stderr: String::new(),
                elapsed: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Verifier for ScriptedVerifier {
        async fn lint(&self, _sandbox: &Sandbox, _f: &str) -> Result<ExecOutput, SandboxError> {
            Ok(Self::output(Self::pop(&self.lint_exits)))
        }

        async fn test(&self, _sandbox: &Sandbox, _p: &[String]) -> Result<ExecOutput, SandboxError> {
            Ok(Self::output(Self::pop(&self.test_exits)))
        }
    }

    struct FaultingVerifier;

    #[async_trait]
    impl Verifier for FaultingVerifier {
        async fn lint(&self, _sandbox: &Sandbox, _f: &str) -> Result<ExecOutput, SandboxError> {
            Err(SandboxError::Exec {
                reason: "gate runner exploded".to_string(),
            })
        }

        async fn test(&self, _sandbox: &Sandbox, _p: &[String]) -> Result<ExecOutput, SandboxError> {
            Err(SandboxError::Exec {
                reason: "gate runner exploded".to_string(),
            })
        }
    }

    async fn orchestrator_with(
        repo: &std::path::Path,
        planner: Arc<dyn Planner>,
        verifier: Arc<dyn Verifier>,
    ) -> Orchestrator {
        let config = MenderConfig::default();
        let provisioner = Provisioner::local(
            SandboxSettings::default(),
            PathBuf::from(repo),
        );
        let pool = SandboxPool::new(provisioner, 1, Duration::from_secs(5)).await;
        let hydrator = ContextHydrator::new(repo, config.context.clone()).unwrap();
        Orchestrator::new(
            pool,
            hydrator,
            planner,
            Publisher::new(None, None),
            config.orchestrator.clone(),
        )
        .with_verifier(verifier)
    }

    fn task() -> Task {
        Task::new(
            "fix the rounding bug",
            vec!["billing.py".to_string()],
            ToolDomain::Testing,
        )
    }

    #[tokio::test]
    async fn empty_planner_escalates_after_budget_plus_one_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with(
            dir.path(),
            Arc::new(EmptyPlanner),
            Arc::new(ScriptedVerifier::new(vec![], vec![])),
        )
        .await;

        let result = orchestrator.run(&task()).await;
        assert_eq!(result.status, TaskStatus::Escalated);
        assert_eq!(result.attempts, 3);
        assert!(result.message.contains("Escalated"));
        assert!(result.pr_url.is_empty());
        orchestrator.pool.shutdown().await;
    }

    #[tokio::test]
    async fn run_curates_the_tool_session_per_task_domain() {
        let dir = tempfile::tempdir().unwrap();
        let planner = Arc::new(SessionInspectingPlanner {
            saw: Mutex::new(None),
        });
        let orchestrator = orchestrator_with(
            dir.path(),
            planner.clone(),
            Arc::new(ScriptedVerifier::new(vec![], vec![])),
        )
        .await;

        // task() is a testing-domain task.
        let _ = orchestrator.run(&task()).await;
        let (run_tests, run_linter) = planner.saw.lock().unwrap().take().unwrap();
        assert!(run_tests);
        assert!(!run_linter);
        orchestrator.pool.shutdown().await;
    }

    #[tokio::test]
    async fn lint_failure_then_pass_succeeds_on_second_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with(
            dir.path(),
            Arc::new(FixedPlanner),
            Arc::new(ScriptedVerifier::new(vec![1], vec![])),
        )
        .await;

        let result = orchestrator.run(&task()).await;
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.attempts, 2);
        // Offline publisher still reports what it would have done.
        assert!(result.pr_url.contains("[Offline]"));
        orchestrator.pool.shutdown().await;
    }

    #[tokio::test]
    async fn gate_fault_reports_failed_and_releases_the_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with(
            dir.path(),
            Arc::new(FixedPlanner),
            Arc::new(FaultingVerifier),
        )
        .await;

        let result = orchestrator.run(&task()).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.message.contains("gate runner exploded"));
        // The faulted run still released its sandbox.
        assert_eq!(orchestrator.pool.stats().await.active, 0);
        orchestrator.pool.shutdown().await;
    }

    #[tokio::test]
    async fn persistent_gate_failure_escalates_with_bounded_feedback() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with(
            dir.path(),
            Arc::new(FixedPlanner),
            Arc::new(ScriptedVerifier::new(vec![1, 1, 1], vec![])),
        )
        .await;

        let result = orchestrator.run(&task()).await;
        assert_eq!(result.status, TaskStatus::Escalated);
        assert_eq!(result.attempts, 3);
        assert!(result.message.contains("LINT FAILED"));
        orchestrator.pool.shutdown().await;
    }

    #[tokio::test]
    async fn run_batch_preserves_order_and_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with(
            dir.path(),
            Arc::new(FixedPlanner),
            Arc::new(ScriptedVerifier::new(vec![], vec![])),
        )
        .await;

        let tasks = vec![task(), task()];
        let results = orchestrator.run_batch(&tasks).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].task_id, tasks[0].id);
        assert_eq!(results[1].task_id, tasks[1].id);
        assert!(results
            .iter()
            .all(|r| r.status == TaskStatus::Success && r.attempts == 1));
        orchestrator.pool.shutdown().await;
    }

    #[test]
    fn task_ids_are_prefixed_and_unique() {
        let a = task();
        let b = task();
        assert!(a.id.starts_with("mender-"));
        assert_ne!(a.id, b.id);
    }
}
