use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::JobError;

/// Abstraction over workspace provisioning for testability.
/// Real implementation: `WorkspaceManager`.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn prepare(
        &self,
        repo_key: &str,
        job_id: i64,
        attempt: i64,
    ) -> Result<Workspace, JobError>;

    async fn release(&self, repo_key: &str, workspace: &Workspace) -> Result<(), JobError>;
}

/// A disposable per-attempt working directory, checked out on its own
/// branch. Never the baseline clone itself.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
}

/// Creates and tears down per-attempt worktrees off the shared baseline
/// clones. Baseline mutation (fetch/pull/worktree add) is serialized per
/// repo so concurrent attempts against the same repo cannot corrupt it.
pub struct WorkspaceManager {
    config: Arc<Config>,
    repo_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkspaceManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            repo_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn repo_lock(&self, repo_key: &str) -> Result<Arc<Mutex<()>>, JobError> {
        let mut locks = self
            .repo_locks
            .lock()
            .map_err(|e| anyhow::anyhow!("Repo lock map poisoned: {}", e))?;
        Ok(locks
            .entry(repo_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Sync the baseline clone and carve a fresh worktree for one attempt.
    ///
    /// The branch and directory are unique per (job, attempt), so retries
    /// never collide with leftovers from an earlier attempt.
    pub async fn prepare(
        &self,
        repo_key: &str,
        job_id: i64,
        attempt: i64,
    ) -> Result<Workspace, JobError> {
        let baseline = self
            .config
            .repo_path(repo_key)
            .ok_or_else(|| JobError::UnknownRepoMapping(repo_key.to_string()))?
            .to_path_buf();
        let base_branch = self.config.base_branch(repo_key).to_string();

        let lock = self.repo_lock(repo_key)?;
        let _guard = lock.lock().await;

        run_git(&baseline, &["fetch", "--all", "--prune"]).await?;
        run_git(&baseline, &["pull", "--ff-only"]).await?;
        ensure_clean(&baseline).await?;

        let branch = format!("bughunter/job-{}-attempt-{}", job_id, attempt);
        let path = self
            .config
            .worktree_root
            .join(repo_key)
            .join(format!("job-{}-attempt-{}", job_id, attempt));

        let parent = path
            .parent()
            .context("Worktree path has no parent directory")
            .map_err(JobError::Other)?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| JobError::RepoSyncError(format!("create worktree dir: {}", e)))?;

        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")
            .map_err(JobError::Other)?;
        run_git(
            &baseline,
            &["worktree", "add", "-b", &branch, path_str, &base_branch],
        )
        .await?;

        info!(repo_key, job_id, attempt, path = %path.display(), "Prepared workspace");
        Ok(Workspace { path, branch })
    }

    /// Remove an attempt's worktree. Callers treat failure as non-fatal;
    /// the attempt outcome is already persisted by the time this runs.
    pub async fn release(&self, repo_key: &str, workspace: &Workspace) -> Result<(), JobError> {
        let baseline = self
            .config
            .repo_path(repo_key)
            .ok_or_else(|| JobError::UnknownRepoMapping(repo_key.to_string()))?
            .to_path_buf();

        let lock = self.repo_lock(repo_key)?;
        let _guard = lock.lock().await;

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(&workspace.path)
            .current_dir(&baseline)
            .output()
            .await
            .context("Failed to run git worktree remove")
            .map_err(JobError::Other)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(JobError::RepoSyncError(format!(
                "git worktree remove failed: {}",
                stderr.trim()
            )));
        }
        debug!(repo_key, path = %workspace.path.display(), "Released workspace");
        Ok(())
    }
}

#[async_trait]
impl WorkspaceProvider for WorkspaceManager {
    async fn prepare(
        &self,
        repo_key: &str,
        job_id: i64,
        attempt: i64,
    ) -> Result<Workspace, JobError> {
        WorkspaceManager::prepare(self, repo_key, job_id, attempt).await
    }

    async fn release(&self, repo_key: &str, workspace: &Workspace) -> Result<(), JobError> {
        WorkspaceManager::release(self, repo_key, workspace).await
    }
}

async fn run_git(repo: &Path, args: &[&str]) -> Result<String, JobError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .with_context(|| format!("Failed to spawn git {}", args.join(" ")))
        .map_err(JobError::Other)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(JobError::RepoSyncError(format!(
            "git {} failed in {}: {}",
            args.join(" "),
            repo.display(),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Refuse to carve worktrees off a baseline with local modifications.
/// Untracked files count: a dirty baseline means something outside this
/// process has been editing it.
async fn ensure_clean(baseline: &Path) -> Result<(), JobError> {
    let path = baseline.to_path_buf();
    let dirty = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
        let repo = git2::Repository::open(&path).context("Failed to open baseline repository")?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true);
        let statuses = repo
            .statuses(Some(&mut opts))
            .context("Failed to read repository status")?;
        Ok(!statuses.is_empty())
    })
    .await
    .context("Status check task panicked")
    .map_err(JobError::Other)?
    .map_err(JobError::Other)?;

    if dirty {
        return Err(JobError::RepoSyncError(format!(
            "baseline clone {} has uncommitted changes",
            baseline.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed in {}", args, dir.display());
    }

    /// Baseline clone with one commit and a working `origin` remote, so
    /// fetch and ff-only pull both succeed.
    fn fixture(tmp: &TempDir) -> PathBuf {
        let baseline = tmp.path().join("repos").join("api");
        std::fs::create_dir_all(&baseline).unwrap();
        git(&baseline, &["init", "-b", "main"]);
        git(&baseline, &["config", "user.email", "test@example.com"]);
        git(&baseline, &["config", "user.name", "Test"]);
        std::fs::write(baseline.join("README.md"), "hello\n").unwrap();
        git(&baseline, &["add", "."]);
        git(&baseline, &["commit", "-m", "init"]);

        let origin = tmp.path().join("origin.git");
        git(
            tmp.path(),
            &["clone", "--bare", baseline.to_str().unwrap(), origin.to_str().unwrap()],
        );
        git(&baseline, &["remote", "add", "origin", origin.to_str().unwrap()]);
        git(&baseline, &["fetch", "origin"]);
        git(&baseline, &["branch", "--set-upstream-to=origin/main", "main"]);
        baseline
    }

    fn manager(tmp: &TempDir, baseline: &Path) -> WorkspaceManager {
        let config = Config {
            repo_root: tmp.path().join("repos"),
            repo_map: HashMap::from([("api".to_string(), baseline.to_path_buf())]),
            owner_ids: HashSet::from(["owner-1".to_string()]),
            base_branch_map: HashMap::new(),
            default_base_branch: "main".to_string(),
            worktree_root: tmp.path().join("worktrees"),
            db_path: tmp.path().join("test.db"),
            claude_cmd: "claude".to_string(),
            agent_timeout_secs: 60,
            agent_system_prompt: None,
        };
        WorkspaceManager::new(Arc::new(config))
    }

    #[tokio::test]
    async fn test_prepare_creates_isolated_worktree() {
        let tmp = TempDir::new().unwrap();
        let baseline = fixture(&tmp);
        let mgr = manager(&tmp, &baseline);

        let ws = mgr.prepare("api", 7, 1).await.unwrap();
        assert!(ws.path.ends_with("api/job-7-attempt-1"));
        assert_eq!(ws.branch, "bughunter/job-7-attempt-1");
        assert!(ws.path.join("README.md").exists());
        // The worktree is not the baseline.
        assert_ne!(ws.path, baseline);
    }

    #[tokio::test]
    async fn test_each_attempt_gets_a_fresh_workspace() {
        let tmp = TempDir::new().unwrap();
        let baseline = fixture(&tmp);
        let mgr = manager(&tmp, &baseline);

        let first = mgr.prepare("api", 7, 1).await.unwrap();
        let second = mgr.prepare("api", 7, 2).await.unwrap();
        assert_ne!(first.path, second.path);
        assert_ne!(first.branch, second.branch);
    }

    #[tokio::test]
    async fn test_prepare_rejects_dirty_baseline() {
        let tmp = TempDir::new().unwrap();
        let baseline = fixture(&tmp);
        std::fs::write(baseline.join("scratch.txt"), "uncommitted\n").unwrap();
        let mgr = manager(&tmp, &baseline);

        let err = mgr.prepare("api", 7, 1).await.unwrap_err();
        assert!(matches!(err, JobError::RepoSyncError(_)));
        assert!(err.to_string().contains("uncommitted"));
    }

    #[tokio::test]
    async fn test_prepare_unknown_repo_key() {
        let tmp = TempDir::new().unwrap();
        let baseline = fixture(&tmp);
        let mgr = manager(&tmp, &baseline);

        let err = mgr.prepare("nope", 1, 1).await.unwrap_err();
        assert!(matches!(err, JobError::UnknownRepoMapping(_)));
    }

    #[tokio::test]
    async fn test_release_removes_worktree() {
        let tmp = TempDir::new().unwrap();
        let baseline = fixture(&tmp);
        let mgr = manager(&tmp, &baseline);

        let ws = mgr.prepare("api", 7, 1).await.unwrap();
        assert!(ws.path.exists());
        mgr.release("api", &ws).await.unwrap();
        assert!(!ws.path.exists());
    }
}
