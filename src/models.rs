use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job. Transitions are validated by
/// [`JobState::can_apply`] and enforced atomically by the store's
/// compare-and-set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    PendingApproval,
    Queued,
    Running,
    AwaitingInstruction,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::AwaitingInstruction => "awaiting_instruction",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states are revivable: a rerun or new instruction moves
    /// them back to `Queued`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `to` is a legal direct successor of `self`.
    pub fn can_apply(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (PendingApproval, Queued)
                | (Queued, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, AwaitingInstruction)
                | (AwaitingInstruction, Queued)
                | (Completed, Queued)
                | (Failed, Queued)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_approval" => Ok(Self::PendingApproval),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "awaiting_instruction" => Ok(Self::AwaitingInstruction),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Owner command against an existing job. Closed set — the ingestion layer
/// maps platform slash-commands onto these variants, never onto raw strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "action", content = "payload")]
pub enum CommandAction {
    Approve,
    Instruct(String),
    Rerun,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Instruct(_) => "instruct",
            Self::Rerun => "rerun",
        }
    }
}

/// One job per forum thread that has triggered work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub thread_id: String,
    pub repo_key: String,
    pub state: JobState,
    /// Ordered brief for the agent; element 0 is the thread body.
    pub instructions: Vec<String>,
    pub attempt_count: i64,
    pub workspace_path: Option<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    /// Concatenate the instructions into the single ordered brief handed
    /// to the agent on the next attempt.
    pub fn brief(&self) -> String {
        self.instructions.join("\n\n")
    }
}

/// Result of a successful agent run inside a workspace.
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub summary: String,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
}

/// Outcome of publishing an attempt's changes.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Branch pushed and PR opened.
    PullRequest { url: String },
    /// The agent produced no file changes; nothing to publish.
    NoChanges,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_roundtrip() {
        for s in &[
            "pending_approval",
            "queued",
            "running",
            "awaiting_instruction",
            "completed",
            "failed",
        ] {
            let parsed: JobState = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<JobState>().is_err());
    }

    #[test]
    fn test_serde_produces_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&JobState::PendingApproval).unwrap(),
            "\"pending_approval\""
        );
        assert_eq!(
            serde_json::from_str::<JobState>("\"awaiting_instruction\"").unwrap(),
            JobState::AwaitingInstruction
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Queued.is_terminal());
    }

    #[test]
    fn test_transition_edges() {
        use JobState::*;
        assert!(PendingApproval.can_apply(Queued));
        assert!(Queued.can_apply(Running));
        assert!(Running.can_apply(Completed));
        assert!(Running.can_apply(Failed));
        assert!(Running.can_apply(AwaitingInstruction));
        assert!(AwaitingInstruction.can_apply(Queued));
        assert!(Completed.can_apply(Queued));
        assert!(Failed.can_apply(Queued));

        // No shortcut into Running except through Queued.
        assert!(!PendingApproval.can_apply(Running));
        assert!(!Completed.can_apply(Running));
        assert!(!Failed.can_apply(Running));
        assert!(!AwaitingInstruction.can_apply(Running));
        assert!(!Running.can_apply(Queued));
    }

    #[test]
    fn test_command_action_serde() {
        let json = serde_json::to_string(&CommandAction::Instruct("add tests".into())).unwrap();
        assert_eq!(json, r#"{"action":"instruct","payload":"add tests"}"#);
        let parsed: CommandAction = serde_json::from_str(r#"{"action":"rerun"}"#).unwrap();
        assert_eq!(parsed, CommandAction::Rerun);
    }

    #[test]
    fn test_brief_preserves_arrival_order() {
        let job = Job {
            id: 1,
            thread_id: "t-1".into(),
            repo_key: "api".into(),
            state: JobState::Queued,
            instructions: vec!["fix the crash".into(), "also add a regression test".into()],
            attempt_count: 0,
            workspace_path: None,
            branch_name: None,
            pr_url: None,
            last_error: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(job.brief(), "fix the crash\n\nalso add a regression test");
    }
}
