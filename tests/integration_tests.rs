//! Integration tests for mender
//!
//! CLI-level checks plus a few end-to-end passes over a small fixture
//! repository.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a mender Command
fn mender() -> Command {
    Command::cargo_bin("mender").unwrap()
}

/// A three-file Python repo with a module chain core -> billing -> test.
fn fixture_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("core.py"), "def base():\n    return 1\n").unwrap();
    fs::write(
        dir.path().join("billing.py"),
        "import core\n\ndef charge():\n    return base() + 1\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("test_billing.py"),
        "import billing\n\ndef test_charge():\n    assert charge() == 2\n",
    )
    .unwrap();
    dir
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_mender_help() {
        mender().arg("--help").assert().success();
    }

    #[test]
    fn test_mender_version() {
        mender().arg("--version").assert().success();
    }

    #[test]
    fn test_subcommands_listed_in_help() {
        mender()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("index"))
            .stdout(predicate::str::contains("tests"))
            .stdout(predicate::str::contains("trigger"));
    }
}

// =============================================================================
// Index Command
// =============================================================================

mod index_command {
    use super::*;

    #[test]
    fn test_index_counts_graph_nodes() {
        let dir = fixture_repo();
        mender()
            .current_dir(dir.path())
            .arg("index")
            .assert()
            .success()
            .stdout(predicate::str::contains("Indexed"))
            // core, billing, billing.charge, test_billing, test_billing.test_charge
            .stdout(predicate::str::contains("billing.charge"));
    }

    #[test]
    fn test_index_on_empty_repo() {
        let dir = TempDir::new().unwrap();
        mender()
            .current_dir(dir.path())
            .arg("index")
            .assert()
            .success()
            .stdout(predicate::str::contains("0 nodes"));
    }

    #[test]
    fn test_index_honors_repo_flag() {
        let dir = fixture_repo();
        mender()
            .arg("--repo")
            .arg(dir.path())
            .arg("index")
            .assert()
            .success()
            .stdout(predicate::str::contains("billing"));
    }
}

// =============================================================================
// Selective Test Discovery
// =============================================================================

mod tests_command {
    use super::*;

    #[test]
    fn test_direct_dependent_test_is_selected() {
        let dir = fixture_repo();
        mender()
            .current_dir(dir.path())
            .args(["tests", "billing.py"])
            .assert()
            .success()
            .stdout(predicate::str::contains("test_billing.py"));
    }

    #[test]
    fn test_transitive_dependent_test_is_selected() {
        let dir = fixture_repo();
        mender()
            .current_dir(dir.path())
            .args(["tests", "core.py"])
            .assert()
            .success()
            .stdout(predicate::str::contains("test_billing.py"));
    }

    #[test]
    fn test_unknown_file_reports_no_matches() {
        let dir = fixture_repo();
        mender()
            .current_dir(dir.path())
            .args(["tests", "nonexistent.py"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No affected tests"));
    }

    #[test]
    fn test_files_argument_is_required() {
        let dir = fixture_repo();
        mender()
            .current_dir(dir.path())
            .arg("tests")
            .assert()
            .failure();
    }
}

// =============================================================================
// Trigger Command
// =============================================================================

mod trigger_command {
    use super::*;

    #[test]
    fn test_unparsable_command_is_rejected() {
        let dir = TempDir::new().unwrap();
        mender()
            .current_dir(dir.path())
            .args(["trigger", ""])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Could not parse"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config_handling {
    use super::*;

    #[test]
    fn test_invalid_config_file_fails_loudly() {
        let dir = fixture_repo();
        let mender_dir = dir.path().join(".mender");
        fs::create_dir_all(&mender_dir).unwrap();
        fs::write(mender_dir.join("config.toml"), "this is {{ not toml").unwrap();

        mender()
            .current_dir(dir.path())
            .arg("index")
            .assert()
            .failure()
            .stderr(predicate::str::contains("config.toml"));
    }

    #[test]
    fn test_config_directory_is_not_indexed() {
        let dir = fixture_repo();
        let mender_dir = dir.path().join(".mender");
        fs::create_dir_all(&mender_dir).unwrap();
        fs::write(mender_dir.join("scratch.py"), "x = 1\n").unwrap();

        mender()
            .current_dir(dir.path())
            .arg("index")
            .assert()
            .success()
            .stdout(predicate::str::contains("scratch").not());
    }
}

// =============================================================================
// Library-level end to end
// =============================================================================

mod library_pipeline {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use mender::config::MenderConfig;
    use mender::context::{ContextBundle, ContextHydrator};
    use mender::orchestrator::state::TaskStatus;
    use mender::orchestrator::{Orchestrator, Task, Verifier};
    use mender::planner::{Patch, Planner};
    use mender::publish::Publisher;
    use mender::sandbox::pool::SandboxPool;
    use mender::sandbox::{ExecOutput, Provisioner, Sandbox};
    use mender::tools::{ToolDomain, ToolSession};

    struct FixedPlanner;

    #[async_trait]
    impl Planner for FixedPlanner {
        async fn generate(
            &self,
            _bundle: &ContextBundle,
            _tools: &ToolSession<'_>,
            _prior: &[String],
        ) -> Patch {
            Patch {
                code: "def charge():\n    return 2\n".to_string(),
                destination_path: "billing.py".to_string(),
                explanation: "hardcode the expected charge".to_string(),
                confidence: 0.8,
            }
        }
    }

    struct PassingVerifier;

    #[async_trait]
    impl Verifier for PassingVerifier {
        async fn lint(
            &self,
            _sandbox: &Sandbox,
            _f: &str,
        ) -> Result<ExecOutput, mender::errors::SandboxError> {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                elapsed: Duration::ZERO,
            })
        }

        async fn test(
            &self,
            _sandbox: &Sandbox,
            _p: &[String],
        ) -> Result<ExecOutput, mender::errors::SandboxError> {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                elapsed: Duration::ZERO,
            })
        }
    }

    #[tokio::test]
    async fn full_pipeline_over_fixture_repo_succeeds_offline() {
        let dir = fixture_repo();
        let config = MenderConfig::load(dir.path()).unwrap();

        let provisioner = Provisioner::local(config.sandbox.clone(), dir.path().to_path_buf());
        let pool = SandboxPool::new(provisioner, 1, Duration::from_secs(5)).await;
        let hydrator = ContextHydrator::new(dir.path(), config.context.clone()).unwrap();

        let orchestrator = Orchestrator::new(
            pool,
            hydrator,
            Arc::new(FixedPlanner),
            Publisher::new(None, None),
            config.orchestrator.clone(),
        )
        .with_verifier(Arc::new(PassingVerifier));

        let task = Task::new(
            "charge() returns the wrong amount",
            vec!["billing.py".to_string()],
            ToolDomain::Testing,
        );
        let result = orchestrator.run(&task).await;

        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.attempts, 1);
        assert!(result.pr_url.contains("[Offline]"));
        orchestrator.shutdown().await;
    }
}
