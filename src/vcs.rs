use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::errors::JobError;
use crate::models::PublishOutcome;

/// Abstraction over publishing an attempt's changes, so the lifecycle can
/// be tested without touching a real remote.
#[async_trait]
pub trait VcsAdapter: Send + Sync {
    /// Commit everything in `workspace`, push `branch`, and open a pull
    /// request targeting `base`. Returns `NoChanges` when the agent left
    /// the tree untouched.
    async fn publish(
        &self,
        workspace: &Path,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PublishOutcome, JobError>;
}

/// Publishes through the `git` and `gh` CLIs, inheriting their ambient
/// credentials.
pub struct GitCliVcs;

#[async_trait]
impl VcsAdapter for GitCliVcs {
    async fn publish(
        &self,
        workspace: &Path,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PublishOutcome, JobError> {
        let status = run(workspace, "git", &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            info!(branch, "No changes to publish");
            return Ok(PublishOutcome::NoChanges);
        }

        run(workspace, "git", &["add", "-A"]).await?;
        run(workspace, "git", &["commit", "-m", title]).await?;
        run(workspace, "git", &["push", "-u", "origin", branch]).await?;

        // Explicit base and head: the configured base branch is not
        // necessarily the repository's default branch.
        let stdout = run(
            workspace,
            "gh",
            &[
                "pr", "create", "--title", title, "--body", body, "--base", base, "--head", branch,
            ],
        )
        .await?;
        let url = stdout.trim().to_string();
        if url.is_empty() {
            return Err(JobError::PublishFailure(
                "gh pr create returned no URL".to_string(),
            ));
        }

        info!(branch, %url, "Opened pull request");
        Ok(PublishOutcome::PullRequest { url })
    }
}

async fn run(dir: &Path, program: &str, args: &[&str]) -> Result<String, JobError> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to spawn {} {}", program, args.join(" ")))
        .map_err(JobError::Other)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(JobError::PublishFailure(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
