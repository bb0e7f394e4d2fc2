//! CLI command implementations.
//!
//! | Function      | Command handled                                  |
//! |---------------|--------------------------------------------------|
//! | `cmd_run`     | `run` — execute one task end to end              |
//! | `cmd_index`   | `index` — build and summarize the graph          |
//! | `cmd_tests`   | `tests` — selective test discovery               |
//! | `cmd_trigger` | `trigger` — chat-style command intake            |

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use console::style;

use mender::config::MenderConfig;
use mender::context::ContextHydrator;
use mender::orchestrator::{Orchestrator, Task};
use mender::planner::CliPlanner;
use mender::publish::Publisher;
use mender::sandbox::pool::SandboxPool;
use mender::sandbox::Provisioner;
use mender::tools::ToolDomain;
use mender::trigger;

pub async fn cmd_run(
    repo: &Path,
    issue: &str,
    files: Vec<String>,
    domain: Option<&str>,
    reviewers: Vec<String>,
    local: bool,
    no_publish: bool,
) -> Result<()> {
    let mut config = MenderConfig::load(repo)?;
    if no_publish {
        config.orchestrator.enable_publish = false;
    }

    let domain: ToolDomain = match domain {
        Some(raw) => raw.parse().map_err(|e: String| anyhow::anyhow!(e))?,
        None => trigger::infer_domain(issue),
    };

    let orchestrator = build_orchestrator(repo, &config, local).await?;
    let task = Task::new(issue, files, domain).with_reviewers(reviewers);
    println!(
        "{} task {} (domain: {})",
        style("Running").cyan().bold(),
        style(&task.id).dim(),
        domain
    );

    let result = orchestrator.run(&task).await;
    println!("\n{}", trigger::format_result(&result));
    orchestrator.shutdown().await;
    Ok(())
}

pub fn cmd_index(repo: &Path) -> Result<()> {
    let config = MenderConfig::load(repo)?;
    let hydrator = ContextHydrator::new(repo, config.context)?;
    let graph = hydrator.graph();

    println!(
        "{} {} nodes from {}",
        style("Indexed").green().bold(),
        graph.node_count(),
        repo.display()
    );

    let order = graph.topological_order();
    if !order.is_empty() {
        println!("\nTopological order (first {}):", order.len().min(15));
        for id in order.iter().take(15) {
            println!("  {id}");
        }
    }
    Ok(())
}

pub fn cmd_tests(repo: &Path, files: &[String]) -> Result<()> {
    let config = MenderConfig::load(repo)?;
    let hydrator = ContextHydrator::new(repo, config.context)?;
    let tests = hydrator.select_tests(files);

    if tests.is_empty() {
        println!("No affected tests found for {}", files.join(", "));
    } else {
        println!(
            "{} {} affected test file(s):",
            style("Selected").green().bold(),
            tests.len()
        );
        for test in tests {
            println!("  {test}");
        }
    }
    Ok(())
}

pub async fn cmd_trigger(repo: &Path, text: &str, local: bool) -> Result<()> {
    // Validate before paying for sandbox provisioning.
    if trigger::parse_command(text).is_none() {
        bail!("Could not parse command. Try: `fix the bug in payments.py` or `files: a.py - <issue>`");
    }

    let config = MenderConfig::load(repo)?;
    let orchestrator = build_orchestrator(repo, &config, local).await?;
    let reply = trigger::dispatch(&orchestrator, text).await;
    orchestrator.shutdown().await;
    if let Some(reply) = reply {
        println!("{reply}");
    }
    Ok(())
}

async fn build_orchestrator(
    repo: &Path,
    config: &MenderConfig,
    local: bool,
) -> Result<Orchestrator> {
    let provisioner = if local {
        Provisioner::local(config.sandbox.clone(), repo.to_path_buf())
    } else {
        Provisioner::detect(config.sandbox.clone(), repo.to_path_buf()).await
    };
    let pool = SandboxPool::new(
        provisioner,
        config.sandbox.capacity,
        config.sandbox.acquire_timeout,
    )
    .await;
    let hydrator = ContextHydrator::new(repo, config.context.clone())?;
    let planner = Arc::new(CliPlanner::new(config.planner_cmd.clone()));
    let publisher = Publisher::new(config.github_token.clone(), config.github_repo.clone());

    Ok(Orchestrator::new(
        pool,
        hydrator,
        planner,
        publisher,
        config.orchestrator.clone(),
    ))
}
