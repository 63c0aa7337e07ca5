//! Job lifecycle management: the single owner of all state transitions.
//!
//! Every transition goes through the store's compare-and-set, so no matter
//! how many ingestion events or commands arrive concurrently, each job has
//! at most one live attempt and every state change is legal.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::agent::AgentAdapter;
use crate::config::Config;
use crate::errors::JobError;
use crate::models::{CommandAction, Job, JobState, PublishOutcome};
use crate::notify::Notifier;
use crate::store::DbHandle;
use crate::vcs::VcsAdapter;
use crate::workspace::WorkspaceProvider;

pub struct LifecycleManager {
    config: Arc<Config>,
    db: DbHandle,
    workspaces: Arc<dyn WorkspaceProvider>,
    agent: Arc<dyn AgentAdapter>,
    vcs: Arc<dyn VcsAdapter>,
    notifier: Arc<dyn Notifier>,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<Config>,
        db: DbHandle,
        workspaces: Arc<dyn WorkspaceProvider>,
        agent: Arc<dyn AgentAdapter>,
        vcs: Arc<dyn VcsAdapter>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            workspaces,
            agent,
            vcs,
            notifier,
        })
    }

    /// A new forum thread was observed. Creates (or returns) the job for it;
    /// owner-authored threads with a brief are queued and started
    /// immediately, everything else waits for approval.
    pub async fn ingest_thread(
        self: &Arc<Self>,
        thread_id: &str,
        repo_key: &str,
        author_id: &str,
        body: &str,
    ) -> Result<Job, JobError> {
        if self.config.repo_path(repo_key).is_none() {
            return Err(JobError::UnknownRepoMapping(repo_key.to_string()));
        }

        {
            let thread = thread_id.to_string();
            if let Some(existing) = self.db.call(move |db| db.get_by_thread(&thread)).await? {
                debug!(thread_id, job_id = existing.id, "Thread already has a job");
                return Ok(existing);
            }
        }

        let body = body.trim();
        let initial_state = if self.config.is_owner(author_id) && !body.is_empty() {
            JobState::Queued
        } else {
            JobState::PendingApproval
        };

        let job = {
            let thread = thread_id.to_string();
            let repo = repo_key.to_string();
            let body_owned = (!body.is_empty()).then(|| body.to_string());
            self.db
                .call(move |db| db.create_job(&thread, &repo, initial_state, body_owned.as_deref()))
                .await?
        };
        info!(job_id = job.id, thread_id, repo_key, state = %job.state, "Job created");

        match job.state {
            JobState::Queued => {
                self.notifier
                    .notify(thread_id, &format!("Job {} queued, starting work.", job.id))
                    .await;
                self.spawn_execution(job.id);
            }
            _ => {
                self.notifier
                    .notify(
                        thread_id,
                        &format!("Job {} created, waiting for owner approval.", job.id),
                    )
                    .await;
            }
        }
        Ok(job)
    }

    /// Owner command against an existing job.
    pub async fn dispatch(
        self: &Arc<Self>,
        job_id: i64,
        actor_id: &str,
        action: CommandAction,
    ) -> Result<Job, JobError> {
        match action {
            CommandAction::Approve => self.approve(job_id, actor_id).await,
            CommandAction::Instruct(text) => self.add_instruction(job_id, actor_id, &text).await,
            CommandAction::Rerun => self.rerun(job_id, actor_id).await,
        }
    }

    /// `PendingApproval -> Queued`, owners only. Also revives a `Failed`
    /// job, as a lighter-weight alternative to rerun. Starts an attempt.
    pub async fn approve(self: &Arc<Self>, job_id: i64, actor_id: &str) -> Result<Job, JobError> {
        self.ensure_owner(actor_id)?;
        let job = self.get_job(job_id).await?;
        if job.instructions.iter().all(|i| i.trim().is_empty()) {
            return Err(JobError::NoInstructions(job_id));
        }
        let from = match job.state {
            JobState::PendingApproval | JobState::Failed => job.state,
            other => {
                return Err(JobError::InvalidState {
                    from: other.to_string(),
                    action: "approve".to_string(),
                });
            }
        };
        let moved = self
            .db
            .call(move |db| db.compare_and_set_state(job_id, from, JobState::Queued))
            .await?;
        if !moved {
            let current = self.get_job(job_id).await?;
            return Err(JobError::InvalidState {
                from: current.state.to_string(),
                action: "approve".to_string(),
            });
        }
        self.notifier
            .notify(&job.thread_id, &format!("Job {} approved, starting work.", job_id))
            .await;
        self.spawn_execution(job_id);
        self.get_job(job_id).await
    }

    /// Append an instruction to the brief. A running job is flagged so the
    /// live attempt's outcome is superseded by a fresh one; a finished job
    /// is revived immediately.
    pub async fn add_instruction(
        self: &Arc<Self>,
        job_id: i64,
        actor_id: &str,
        text: &str,
    ) -> Result<Job, JobError> {
        self.ensure_owner(actor_id)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(JobError::NoInstructions(job_id));
        }
        self.get_job(job_id).await?;
        let job = {
            let text = text.to_string();
            self.db
                .call(move |db| db.append_instruction(job_id, &text))
                .await?
        };

        match job.state {
            JobState::Running => {
                let flagged = self
                    .db
                    .call(move |db| {
                        db.compare_and_set_state(
                            job_id,
                            JobState::Running,
                            JobState::AwaitingInstruction,
                        )
                    })
                    .await?;
                if flagged {
                    self.notifier
                        .notify(
                            &job.thread_id,
                            &format!(
                                "Instruction noted for job {}; a new attempt will start once the current one finishes.",
                                job_id
                            ),
                        )
                        .await;
                } else {
                    // The attempt finished in between. Revive from terminal.
                    self.revive(job_id, &job.thread_id).await?;
                }
            }
            JobState::Completed | JobState::Failed => {
                self.revive(job_id, &job.thread_id).await?;
            }
            // Queued, PendingApproval, AwaitingInstruction: the instruction
            // is already part of the brief the next attempt will see.
            _ => {}
        }
        self.get_job(job_id).await
    }

    /// Re-run a finished job from scratch with the brief it already has.
    pub async fn rerun(self: &Arc<Self>, job_id: i64, actor_id: &str) -> Result<Job, JobError> {
        self.ensure_owner(actor_id)?;
        let job = self.get_job(job_id).await?;
        if !job.state.is_terminal() {
            return Err(JobError::InvalidState {
                from: job.state.to_string(),
                action: "rerun".to_string(),
            });
        }
        if job.instructions.iter().all(|i| i.trim().is_empty()) {
            return Err(JobError::NoInstructions(job_id));
        }
        // Reset and requeue in one guarded write: a rerun that loses the
        // race must not clear another attempt's fields.
        let from = job.state;
        let moved = self
            .db
            .call(move |db| db.reset_and_requeue(job_id, from))
            .await?;
        if !moved {
            let current = self.get_job(job_id).await?;
            return Err(JobError::InvalidState {
                from: current.state.to_string(),
                action: "rerun".to_string(),
            });
        }
        self.notifier
            .notify(&job.thread_id, &format!("Job {} queued for another run.", job_id))
            .await;
        self.spawn_execution(job_id);
        self.get_job(job_id).await
    }

    /// Startup recovery: any job still `Running` in the store was cut off
    /// by a crash or restart. Mark it failed so an owner can rerun it;
    /// never resume blind into a half-finished workspace.
    pub async fn recover_interrupted(self: &Arc<Self>) -> Result<usize, JobError> {
        let interrupted = self.db.call(|db| db.list_active()).await?;
        let count = interrupted.len();
        for job in interrupted {
            let job_id = job.id;
            let message = JobError::Interrupted.to_string();
            self.db
                .call(move |db| {
                    if db.compare_and_set_state(job_id, JobState::Running, JobState::Failed)? {
                        db.update_last_error(job_id, Some(&message))?;
                    }
                    Ok(())
                })
                .await?;
            warn!(job_id, "Marked interrupted job as failed");
            self.notifier
                .notify(
                    &job.thread_id,
                    &format!(
                        "Job {} was interrupted by a restart and marked failed. Use rerun to retry.",
                        job_id
                    ),
                )
                .await;
        }
        Ok(count)
    }

    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, JobError> {
        Ok(self.db.call(move |db| db.list_recent(limit)).await?)
    }

    /// Claim the job and run one attempt to a terminal state. Public so
    /// callers that need to await completion (rather than fire-and-forget)
    /// can do so.
    pub async fn claim_and_execute(self: &Arc<Self>, job_id: i64) -> Result<(), JobError> {
        let claimed = self
            .db
            .call(move |db| db.claim_for_execution(job_id))
            .await?;
        if !claimed {
            return Err(JobError::AlreadyClaimed(job_id));
        }
        let job = self.get_job(job_id).await?;
        info!(job_id, attempt = job.attempt_count, "Attempt started");
        self.notifier
            .notify(
                &job.thread_id,
                &format!("Job {} attempt {} started.", job_id, job.attempt_count),
            )
            .await;

        let result = self.run_attempt(&job).await;
        self.settle_attempt(&job, result).await
    }

    fn spawn_execution(self: &Arc<Self>, job_id: i64) {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            match mgr.claim_and_execute(job_id).await {
                Ok(()) => {}
                // Expected when something else got there first.
                Err(JobError::AlreadyClaimed(_)) => {
                    debug!(job_id, "Job already claimed by another attempt")
                }
                Err(e) => error!(job_id, error = %e, "Attempt ended with error"),
            }
        });
    }

    /// One attempt: workspace, agent, publish. The workspace is released on
    /// every exit path; the outcome is returned for settlement.
    async fn run_attempt(&self, job: &Job) -> Result<PublishOutcome, JobError> {
        let brief = job.brief();
        if brief.trim().is_empty() {
            return Err(JobError::NoInstructions(job.id));
        }

        let workspace = self
            .workspaces
            .prepare(&job.repo_key, job.id, job.attempt_count)
            .await?;
        {
            let job_id = job.id;
            let path = workspace.path.to_string_lossy().into_owned();
            let branch = workspace.branch.clone();
            self.db
                .call(move |db| db.update_attempt_isolation(job_id, Some(&path), Some(&branch)))
                .await?;
        }

        let base = self.config.base_branch(&job.repo_key);
        let result = async {
            let report = self.agent.run(&workspace.path, &brief).await?;
            let title = report
                .pr_title
                .clone()
                .unwrap_or_else(|| default_pr_title(&report.summary));
            let body = report.pr_body.clone().unwrap_or_else(|| report.summary.clone());
            self.vcs
                .publish(&workspace.path, &workspace.branch, base, &title, &body)
                .await
        }
        .await;

        // Once the worktree is gone, the record must stop pointing at it.
        // On release failure the path still exists, so it is kept.
        match self.workspaces.release(&job.repo_key, &workspace).await {
            Ok(()) => {
                let job_id = job.id;
                let branch = workspace.branch.clone();
                self.db
                    .call(move |db| db.update_attempt_isolation(job_id, None, Some(&branch)))
                    .await?;
            }
            Err(e) => warn!(job_id = job.id, error = %e, "Failed to release workspace"),
        }
        result
    }

    /// Persist the attempt outcome and drive the job to its next state.
    /// Outcome fields are written before the state flips and before any
    /// notification, so a crash mid-settlement never loses the result.
    async fn settle_attempt(
        self: &Arc<Self>,
        job: &Job,
        result: Result<PublishOutcome, JobError>,
    ) -> Result<(), JobError> {
        let job_id = job.id;
        let (terminal, message) = match &result {
            Ok(PublishOutcome::PullRequest { url }) => {
                let url_owned = url.clone();
                self.db
                    .call(move |db| db.update_pr_url(job_id, &url_owned))
                    .await?;
                (
                    JobState::Completed,
                    format!("Job {} completed: {}", job_id, url),
                )
            }
            Ok(PublishOutcome::NoChanges) => (
                JobState::Completed,
                format!("Job {} completed with no changes to publish.", job_id),
            ),
            Err(e) => {
                let error = e.to_string();
                let error_owned = error.clone();
                self.db
                    .call(move |db| db.update_last_error(job_id, Some(&error_owned)))
                    .await?;
                (JobState::Failed, format!("Job {} failed: {}", job_id, error))
            }
        };

        let moved = self
            .db
            .call(move |db| db.compare_and_set_state(job_id, JobState::Running, terminal))
            .await?;
        if moved {
            info!(job_id, state = %terminal, "Attempt settled");
            self.notifier.notify(&job.thread_id, &message).await;
            return Ok(());
        }

        // The state moved under us. The only legal writer while an attempt
        // is live is an instruction flipping Running -> AwaitingInstruction.
        let current = self.get_job(job_id).await?;
        if current.state == JobState::AwaitingInstruction {
            self.notifier.notify(&job.thread_id, &message).await;
            self.revive(job_id, &job.thread_id).await?;
            return Ok(());
        }
        warn!(job_id, state = %current.state, "Unexpected state at settlement");
        Ok(())
    }

    /// Move a job back to `Queued` from whatever revivable state it is in
    /// and start the next attempt.
    async fn revive(self: &Arc<Self>, job_id: i64, thread_id: &str) -> Result<(), JobError> {
        let current = self.get_job(job_id).await?;
        let from = current.state;
        if !from.can_apply(JobState::Queued) {
            // Already queued or running again; nothing to do.
            return Ok(());
        }
        let moved = self
            .db
            .call(move |db| db.compare_and_set_state(job_id, from, JobState::Queued))
            .await?;
        if moved {
            self.notifier
                .notify(
                    thread_id,
                    &format!("Job {} queued for a new attempt with updated instructions.", job_id),
                )
                .await;
            self.spawn_execution(job_id);
        }
        Ok(())
    }

    fn ensure_owner(&self, actor_id: &str) -> Result<(), JobError> {
        if self.config.is_owner(actor_id) {
            Ok(())
        } else {
            Err(JobError::NotAuthorized(actor_id.to_string()))
        }
    }

    async fn get_job(&self, job_id: i64) -> Result<Job, JobError> {
        self.db
            .call(move |db| db.get(job_id))
            .await?
            .ok_or(JobError::JobNotFound(job_id))
    }
}

/// First non-empty line of the agent summary, clipped for a PR title.
fn default_pr_title(summary: &str) -> String {
    let line = summary
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("Automated fix");
    let mut title: String = line.chars().take(72).collect();
    if title.len() < line.len() {
        title.push_str("...");
    }
    title
}
