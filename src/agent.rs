use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::JobError;
use crate::models::AgentReport;

/// Abstraction over the external code-generation agent for testability.
/// Real implementation: `ClaudeAgent`. Test doubles live next to the
/// lifecycle tests.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Run the agent inside `workspace` against the accumulated brief.
    /// The agent edits files in place; it never commits or pushes.
    async fn run(&self, workspace: &Path, brief: &str) -> Result<AgentReport, JobError>;
}

/// Drives the `claude` CLI in print mode and reads its stream-json output.
pub struct ClaudeAgent {
    cmd: String,
    timeout: Duration,
    system_prompt: Option<String>,
}

impl ClaudeAgent {
    pub fn from_config(config: &Arc<Config>) -> Self {
        Self {
            cmd: config.claude_cmd.clone(),
            timeout: Duration::from_secs(config.agent_timeout_secs),
            system_prompt: config.agent_system_prompt.clone(),
        }
    }

    fn build_prompt(&self, brief: &str) -> String {
        match &self.system_prompt {
            Some(system) => format!("{}\n\n{}", system, brief),
            None => brief.to_string(),
        }
    }
}

#[async_trait]
impl AgentAdapter for ClaudeAgent {
    async fn run(&self, workspace: &Path, brief: &str) -> Result<AgentReport, JobError> {
        let prompt = self.build_prompt(brief);
        let mut child = Command::new(&self.cmd)
            .args([
                "--print",
                "--dangerously-skip-permissions",
                "--output-format",
                "stream-json",
                "-p",
                &prompt,
            ])
            .current_dir(workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn agent process")
            .map_err(JobError::Other)?;

        debug!(workspace = %workspace.display(), "Agent started");

        let outcome = tokio::time::timeout(self.timeout, drive(&mut child)).await;
        let (summary, success, stderr) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.start_kill();
                return Err(JobError::AgentFailure(format!(
                    "agent timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        if !success {
            return Err(JobError::AgentFailure(format!(
                "agent exited with failure: {}",
                stderr.trim()
            )));
        }
        if summary.trim().is_empty() {
            return Err(JobError::AgentFailure("agent produced no output".to_string()));
        }

        info!(workspace = %workspace.display(), "Agent finished");
        Ok(AgentReport {
            pr_title: extract_section(&summary, "PR Title"),
            pr_body: extract_section(&summary, "PR Body"),
            summary,
        })
    }
}

/// Read the agent's stream until exit. Returns (summary, success, stderr).
/// The final `result` event wins as summary; assistant text is the fallback
/// for older CLI versions that do not emit one.
async fn drive(child: &mut tokio::process::Child) -> Result<(String, bool, String), JobError> {
    let mut transcript = Vec::new();
    let mut final_result = None;

    // Drain stderr concurrently: an agent that fills the stderr pipe while
    // stdout is still open would otherwise deadlock against us.
    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut content = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                content.push_str(&line);
                content.push('\n');
            }
            content
        })
    });

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_stream_line(&line) {
                StreamEvent::Result(text) => final_result = Some(text),
                StreamEvent::Text(text) => transcript.push(text),
                StreamEvent::Ignored => {}
            }
        }
    }

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    let status = child
        .wait()
        .await
        .context("Failed to wait for agent process")
        .map_err(JobError::Other)?;

    let summary = final_result.unwrap_or_else(|| transcript.join("\n"));
    Ok((summary, status.success(), stderr))
}

enum StreamEvent {
    /// Final summary from a `result` event.
    Result(String),
    /// Assistant-visible text.
    Text(String),
    Ignored,
}

fn parse_stream_line(line: &str) -> StreamEvent {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return StreamEvent::Ignored;
    }
    if !trimmed.starts_with('{') {
        return StreamEvent::Text(trimmed.to_string());
    }
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return StreamEvent::Ignored;
    };
    match parsed.get("type").and_then(|t| t.as_str()) {
        Some("result") => match parsed.get("result").and_then(|r| r.as_str()) {
            Some(text) => StreamEvent::Result(text.to_string()),
            None => StreamEvent::Ignored,
        },
        Some("assistant") => {
            let blocks = parsed
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array());
            let Some(blocks) = blocks else {
                return StreamEvent::Ignored;
            };
            let text: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            if text.is_empty() {
                StreamEvent::Ignored
            } else {
                StreamEvent::Text(text.join("\n"))
            }
        }
        _ => StreamEvent::Ignored,
    }
}

/// Pull one `## <heading>` section out of the agent's summary markdown.
/// Returns the trimmed content up to the next `## ` heading.
pub fn extract_section(text: &str, heading: &str) -> Option<String> {
    let mut collected: Option<Vec<&str>> = None;
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("## ") {
            if collected.is_some() {
                break;
            }
            if rest.trim().eq_ignore_ascii_case(heading) {
                collected = Some(Vec::new());
            }
            continue;
        }
        if let Some(lines) = collected.as_mut() {
            lines.push(line);
        }
    }
    let body = collected?.join("\n").trim().to_string();
    if body.is_empty() { None } else { Some(body) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_section_basic() {
        let text = "intro\n\n## PR Title\nFix null deref in parser\n\n## PR Body\nDetails here.\nMore.\n";
        assert_eq!(
            extract_section(text, "PR Title").as_deref(),
            Some("Fix null deref in parser")
        );
        assert_eq!(
            extract_section(text, "PR Body").as_deref(),
            Some("Details here.\nMore.")
        );
    }

    #[test]
    fn test_extract_section_missing_or_empty() {
        assert!(extract_section("no headings here", "PR Title").is_none());
        assert!(extract_section("## PR Title\n\n## PR Body\nx", "PR Title").is_none());
    }

    #[test]
    fn test_extract_section_last_section_runs_to_end() {
        let text = "## PR Body\nline one\nline two";
        assert_eq!(
            extract_section(text, "PR Body").as_deref(),
            Some("line one\nline two")
        );
    }

    #[test]
    fn test_extract_section_heading_case_insensitive() {
        let text = "## pr title\nThe title";
        assert_eq!(extract_section(text, "PR Title").as_deref(), Some("The title"));
    }

    #[test]
    fn test_parse_stream_line_result_event() {
        let line = r#"{"type":"result","result":"all done"}"#;
        assert!(matches!(
            parse_stream_line(line),
            StreamEvent::Result(s) if s == "all done"
        ));
    }

    #[test]
    fn test_parse_stream_line_assistant_text() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"},{"type":"tool_use","name":"edit"}]}}"#;
        assert!(matches!(
            parse_stream_line(line),
            StreamEvent::Text(s) if s == "working on it"
        ));
    }

    #[test]
    fn test_parse_stream_line_ignores_noise() {
        assert!(matches!(parse_stream_line(""), StreamEvent::Ignored));
        assert!(matches!(
            parse_stream_line(r#"{"type":"system","subtype":"init"}"#),
            StreamEvent::Ignored
        ));
        assert!(matches!(parse_stream_line("{not json"), StreamEvent::Ignored));
    }

    #[test]
    fn test_parse_stream_line_plain_text_passthrough() {
        assert!(matches!(
            parse_stream_line("plain progress line"),
            StreamEvent::Text(s) if s == "plain progress line"
        ));
    }

    #[tokio::test]
    async fn test_run_survives_chatty_stderr() {
        use std::os::unix::fs::PermissionsExt;

        // Writes well past the pipe buffer on stderr before producing the
        // result on stdout.
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("fake-agent.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             i=0\n\
             while [ $i -lt 20000 ]; do echo 'noise destined for the stderr pipe' >&2; i=$((i+1)); done\n\
             printf '%s\\n' '{\"type\":\"result\",\"result\":\"done\\n\\n## PR Title\\nQuiet fix\"}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let agent = ClaudeAgent {
            cmd: script.to_str().unwrap().to_string(),
            timeout: Duration::from_secs(30),
            system_prompt: None,
        };
        let report = agent.run(tmp.path(), "brief").await.unwrap();
        assert!(report.summary.starts_with("done"));
        assert_eq!(report.pr_title.as_deref(), Some("Quiet fix"));
    }

    #[test]
    fn test_build_prompt_prepends_system_prompt() {
        let agent = ClaudeAgent {
            cmd: "claude".to_string(),
            timeout: Duration::from_secs(1),
            system_prompt: Some("You fix bugs.".to_string()),
        };
        assert_eq!(agent.build_prompt("do it"), "You fix bugs.\n\ndo it");

        let bare = ClaudeAgent {
            cmd: "claude".to_string(),
            timeout: Duration::from_secs(1),
            system_prompt: None,
        };
        assert_eq!(bare.build_prompt("do it"), "do it");
    }
}
