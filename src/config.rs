use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

/// Runtime configuration, built once at startup and passed explicitly to
/// the lifecycle manager and ingestion layer. Never read from ambient
/// global state after construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// All target repositories must live under this root (safety check).
    pub repo_root: PathBuf,
    /// `repo_key` → baseline clone path.
    pub repo_map: HashMap<String, PathBuf>,
    /// Platform identities allowed to approve, instruct, and rerun.
    pub owner_ids: HashSet<String>,
    /// Per-repo base branch override; falls back to `default_base_branch`.
    pub base_branch_map: HashMap<String, String>,
    pub default_base_branch: String,
    /// Root under which per-attempt worktrees are materialized.
    pub worktree_root: PathBuf,
    pub db_path: PathBuf,
    pub claude_cmd: String,
    pub agent_timeout_secs: u64,
    pub agent_system_prompt: Option<String>,
}

impl Config {
    /// Load configuration from the environment. `.env` is honored if
    /// present (dotenvy), real environment variables win.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let repo_root = PathBuf::from(
            std::env::var("REPO_ROOT").context("REPO_ROOT is required")?,
        );

        let repo_map_raw =
            std::env::var("BUGHUNTER_REPO_MAP").context("BUGHUNTER_REPO_MAP is required")?;
        let repo_map = parse_repo_map(&repo_root, &repo_map_raw)?;
        if repo_map.is_empty() {
            return Err(anyhow!("BUGHUNTER_REPO_MAP must map at least one repo_key"));
        }

        let owner_ids: HashSet<String> = std::env::var("OWNER_IDS")
            .context("OWNER_IDS is required")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if owner_ids.is_empty() {
            return Err(anyhow!("OWNER_IDS must list at least one owner"));
        }

        let base_branch_map = match std::env::var("BASE_BRANCH_MAP") {
            Ok(raw) => serde_json::from_str::<HashMap<String, String>>(&raw)
                .context("BASE_BRANCH_MAP is not a valid JSON object")?,
            Err(_) => HashMap::new(),
        };

        let worktree_root = std::env::var("WORKTREE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| repo_root.join("worktrees"));

        let db_path = std::env::var("BUGHUNTER_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/bughunter.db"));

        let agent_timeout_secs = match std::env::var("AGENT_TIMEOUT_SECS") {
            Ok(raw) => raw
                .parse::<u64>()
                .context("AGENT_TIMEOUT_SECS must be an integer")?,
            Err(_) => 1800,
        };

        Ok(Self {
            repo_root,
            repo_map,
            owner_ids,
            base_branch_map,
            default_base_branch: std::env::var("DEFAULT_BASE_BRANCH")
                .unwrap_or_else(|_| "main".to_string()),
            worktree_root,
            db_path,
            claude_cmd: std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string()),
            agent_timeout_secs,
            agent_system_prompt: std::env::var("AGENT_SYSTEM_PROMPT").ok(),
        })
    }

    pub fn is_owner(&self, actor_id: &str) -> bool {
        self.owner_ids.contains(actor_id)
    }

    /// Resolve a repo key to its baseline clone path, rejecting anything
    /// that escapes `repo_root`.
    pub fn repo_path(&self, repo_key: &str) -> Option<&Path> {
        let path = self.repo_map.get(repo_key)?;
        if path.starts_with(&self.repo_root) {
            Some(path)
        } else {
            None
        }
    }

    pub fn base_branch(&self, repo_key: &str) -> &str {
        self.base_branch_map
            .get(repo_key)
            .map(String::as_str)
            .unwrap_or(&self.default_base_branch)
    }
}

fn parse_repo_map(repo_root: &Path, raw: &str) -> Result<HashMap<String, PathBuf>> {
    let parsed: HashMap<String, String> =
        serde_json::from_str(raw).context("BUGHUNTER_REPO_MAP is not a valid JSON object")?;
    let mut map = HashMap::new();
    for (key, raw_path) in parsed {
        let path = PathBuf::from(&raw_path);
        let path = if path.is_absolute() {
            path
        } else {
            repo_root.join(path)
        };
        map.insert(key, path);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            repo_root: PathBuf::from("/srv/repos"),
            repo_map: HashMap::from([
                ("api".to_string(), PathBuf::from("/srv/repos/api")),
                ("rogue".to_string(), PathBuf::from("/etc/passwd-repo")),
            ]),
            owner_ids: HashSet::from(["owner-1".to_string()]),
            base_branch_map: HashMap::from([("api".to_string(), "develop".to_string())]),
            default_base_branch: "main".to_string(),
            worktree_root: PathBuf::from("/srv/repos/worktrees"),
            db_path: PathBuf::from("/tmp/test.db"),
            claude_cmd: "claude".to_string(),
            agent_timeout_secs: 60,
            agent_system_prompt: None,
        }
    }

    #[test]
    fn test_parse_repo_map_resolves_relative_paths() {
        let map = parse_repo_map(
            Path::new("/srv/repos"),
            r#"{"api": "api", "web": "/opt/web"}"#,
        )
        .unwrap();
        assert_eq!(map["api"], PathBuf::from("/srv/repos/api"));
        assert_eq!(map["web"], PathBuf::from("/opt/web"));
    }

    #[test]
    fn test_parse_repo_map_rejects_non_object() {
        assert!(parse_repo_map(Path::new("/srv"), "[1,2]").is_err());
        assert!(parse_repo_map(Path::new("/srv"), "not json").is_err());
    }

    #[test]
    fn test_repo_path_rejects_escapes() {
        let config = test_config();
        assert!(config.repo_path("api").is_some());
        // Mapped but outside repo_root — treated as unconfigured.
        assert!(config.repo_path("rogue").is_none());
        assert!(config.repo_path("missing").is_none());
    }

    #[test]
    fn test_base_branch_falls_back_to_default() {
        let config = test_config();
        assert_eq!(config.base_branch("api"), "develop");
        assert_eq!(config.base_branch("web"), "main");
    }

    #[test]
    fn test_is_owner() {
        let config = test_config();
        assert!(config.is_owner("owner-1"));
        assert!(!config.is_owner("stranger"));
    }
}
