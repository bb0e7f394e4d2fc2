//! Publishing results as GitHub pull requests.
//!
//! The publisher is deliberately failure-tolerant: a task that passed every
//! gate has value even if GitHub is unreachable, so `create_pr` degrades to
//! an offline placeholder instead of erroring. Credentials come from
//! `GITHUB_TOKEN` and `GITHUB_REPO` (an `owner/repo` slug); without both,
//! the publisher runs in offline mode.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

const API_ROOT: &str = "https://api.github.com";
const USER_AGENT: &str = "mender";

/// Where a finished task ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// PR created; the URL to hand back to the requester.
    Url(String),
    /// No PR: offline mode or a tolerated API failure, with a description
    /// of what would have happened.
    Offline(String),
}

/// Issue details used to seed a task.
#[derive(Debug, Clone)]
pub struct IssueContext {
    pub text: String,
    pub labels: Vec<String>,
    pub comments: Vec<String>,
}

struct Credentials {
    token: String,
    repo: String,
}

/// GitHub REST client with an explicit offline mode.
pub struct Publisher {
    client: reqwest::Client,
    credentials: Option<Credentials>,
}

#[derive(Deserialize)]
struct CreatedPr {
    number: u64,
    html_url: String,
}

#[derive(Deserialize)]
struct IssueLabel {
    name: String,
}

#[derive(Deserialize)]
struct IssueResponse {
    title: String,
    body: Option<String>,
    #[serde(default)]
    labels: Vec<IssueLabel>,
}

#[derive(Deserialize)]
struct IssueComment {
    body: Option<String>,
}

impl Publisher {
    pub fn new(token: Option<String>, repo: Option<String>) -> Self {
        let credentials = match (token, repo) {
            (Some(token), Some(repo)) => Some(Credentials { token, repo }),
            _ => {
                info!("publisher in offline mode (set GITHUB_TOKEN and GITHUB_REPO to enable)");
                None
            }
        };
        Self {
            client: reqwest::Client::new(),
            credentials,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.credentials.is_some()
    }

    /// Open a pull request from `branch` into `base`. Reviewer requests are
    /// best-effort; API failures degrade to an offline outcome.
    pub async fn create_pr(
        &self,
        branch: &str,
        title: &str,
        body: &str,
        base: &str,
        reviewers: &[String],
    ) -> PublishOutcome {
        let Some(credentials) = &self.credentials else {
            return PublishOutcome::Offline(format!(
                "[Offline] PR would be: {title} from branch {branch}"
            ));
        };

        match self
            .post_pull_request(credentials, branch, title, body, base)
            .await
        {
            Ok(pr) => {
                info!(number = pr.number, url = %pr.html_url, "pull request created");
                if !reviewers.is_empty() {
                    if let Err(e) = self
                        .request_reviewers(credentials, pr.number, reviewers)
                        .await
                    {
                        warn!(error = %e, "could not request reviewers");
                    }
                }
                PublishOutcome::Url(pr.html_url)
            }
            Err(e) => {
                warn!(error = %e, "pull request creation failed");
                PublishOutcome::Offline(format!("[PR failed] {e}"))
            }
        }
    }

    /// Fetch issue text, labels, and comments to seed a task. Offline mode
    /// and API failures yield a placeholder context.
    pub async fn fetch_issue(&self, number: u64) -> IssueContext {
        let Some(credentials) = &self.credentials else {
            return offline_issue(number);
        };
        match self.get_issue(credentials, number).await {
            Ok(context) => context,
            Err(e) => {
                warn!(issue = number, error = %e, "issue fetch failed");
                offline_issue(number)
            }
        }
    }

    async fn post_pull_request(
        &self,
        credentials: &Credentials,
        branch: &str,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<CreatedPr> {
        let url = format!("{API_ROOT}/repos/{}/pulls", credentials.repo);
        let pr = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", credentials.token))
            .header("User-Agent", USER_AGENT)
            .json(&json!({
                "title": title,
                "body": body,
                "head": branch,
                "base": base,
                "draft": false,
            }))
            .send()
            .await
            .context("Failed to send pull request to GitHub")?
            .error_for_status()
            .context("GitHub pulls API returned error status")?
            .json::<CreatedPr>()
            .await
            .context("Failed to parse pull request response")?;
        Ok(pr)
    }

    async fn request_reviewers(
        &self,
        credentials: &Credentials,
        pr_number: u64,
        reviewers: &[String],
    ) -> Result<()> {
        let url = format!(
            "{API_ROOT}/repos/{}/pulls/{}/requested_reviewers",
            credentials.repo, pr_number
        );
        self.client
            .post(&url)
            .header("Authorization", format!("Bearer {}", credentials.token))
            .header("User-Agent", USER_AGENT)
            .json(&json!({"reviewers": reviewers}))
            .send()
            .await
            .context("Failed to send reviewer request")?
            .error_for_status()
            .context("GitHub reviewers API returned error status")?;
        Ok(())
    }

    async fn get_issue(&self, credentials: &Credentials, number: u64) -> Result<IssueContext> {
        let url = format!("{API_ROOT}/repos/{}/issues/{}", credentials.repo, number);
        let issue = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", credentials.token))
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("Failed to send issue request to GitHub")?
            .error_for_status()
            .context("GitHub issues API returned error status")?
            .json::<IssueResponse>()
            .await
            .context("Failed to parse issue response")?;

        let comments = self
            .client
            .get(format!("{url}/comments"))
            .header("Authorization", format!("Bearer {}", credentials.token))
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("Failed to send comments request to GitHub")?
            .error_for_status()
            .context("GitHub comments API returned error status")?
            .json::<Vec<IssueComment>>()
            .await
            .context("Failed to parse comments response")?;

        Ok(IssueContext {
            text: format!("{}\n\n{}", issue.title, issue.body.unwrap_or_default()),
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            comments: comments.into_iter().filter_map(|c| c.body).collect(),
        })
    }
}

fn offline_issue(number: u64) -> IssueContext {
    IssueContext {
        text: format!("Issue #{number} (offline mode)"),
        labels: Vec::new(),
        comments: Vec::new(),
    }
}

/// Fields rendered into the structured PR description.
pub struct PrSummary<'a> {
    pub task_id: &'a str,
    pub priority: &'a str,
    pub domain: &'a str,
    pub issue: &'a str,
    pub explanation: &'a str,
    pub filepath: &'a str,
    pub confidence: f64,
    pub attempts: u32,
}

pub fn render_pr_body(summary: &PrSummary<'_>) -> String {
    format!(
        "## Automated Fix\n\n\
         **Task ID:** `{}`\n\
         **Priority:** {}\n\
         **Domain:** {}\n\n\
         ### Issue\n{}\n\n\
         ### What Changed\n{}\n\n\
         ### Files Modified\n- `{}`\n\n\
         ### Confidence\n{:.0}% (self-assessed)\n\n\
         ### Review Notes\n\
         - Generated autonomously; lint and selective test gates passed after {} attempt(s)\n\
         - Please verify the logic change before merging\n\
         - Completed at: {}\n",
        summary.task_id,
        summary.priority,
        summary.domain,
        summary.issue,
        summary.explanation,
        summary.filepath,
        summary.confidence * 100.0,
        summary.attempts,
        Utc::now().format("%Y-%m-%d %H:%M UTC"),
    )
}
