use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::lifecycle::LifecycleManager;
use crate::models::CommandAction;

/// Inbound platform event, one JSON object per line. The chat-platform
/// bridge translates forum threads and slash-commands into these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformEvent {
    ThreadCreated {
        thread_id: String,
        repo_key: String,
        author_id: String,
        #[serde(default)]
        body: String,
    },
    Command {
        job_id: i64,
        actor_id: String,
        #[serde(flatten)]
        action: CommandAction,
    },
}

/// Read newline-delimited events from stdin until EOF. Malformed lines and
/// rejected commands are logged and skipped; one bad event never takes the
/// loop down.
pub async fn run_stdin_loop(mgr: Arc<LifecycleManager>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<PlatformEvent>(line) {
            Ok(event) => handle_event(&mgr, event).await,
            Err(e) => warn!(error = %e, "Ignoring malformed event line"),
        }
    }
    info!("Event stream closed");
    Ok(())
}

pub async fn handle_event(mgr: &Arc<LifecycleManager>, event: PlatformEvent) {
    match event {
        PlatformEvent::ThreadCreated {
            thread_id,
            repo_key,
            author_id,
            body,
        } => match mgr
            .ingest_thread(&thread_id, &repo_key, &author_id, &body)
            .await
        {
            Ok(job) => info!(job_id = job.id, thread_id, state = %job.state, "Thread ingested"),
            Err(e) => warn!(thread_id, error = %e, "Thread rejected"),
        },
        PlatformEvent::Command {
            job_id,
            actor_id,
            action,
        } => {
            let name = action.as_str();
            match mgr.dispatch(job_id, &actor_id, action).await {
                Ok(job) => info!(job_id, command = name, state = %job.state, "Command applied"),
                Err(e) => warn!(job_id, command = name, error = %e, "Command rejected"),
            }
        }
    }
}
