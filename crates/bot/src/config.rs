use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use serde::Deserialize;
use tracing::warn;

use bridge_ai::AiConfig;
use bridge_core::{DelegationConfig, ExecutorConfig, HistoryConfig, ReplyConfig, RouterConfig};

/// Fallback for `workdir.default_root` when the config leaves it unset.
pub const DEFAULT_WORKDIR_ENV: &str = "DEFAULT_WORKDIR";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct WorkdirConfig {
    /// Starting directory for every new session.
    pub default_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BotConfig {
    pub workdir: WorkdirConfig,
    pub executor: ExecutorConfig,
    pub ai: AiConfig,
    pub history: HistoryConfig,
    pub delegation: DelegationConfig,
    pub reply: ReplyConfig,
    /// Room ids the bridge answers in; empty means every joined room.
    pub rooms: Vec<String>,
}

impl BotConfig {
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            history: self.history.clone(),
            delegation: self.delegation.clone(),
            reply: self.reply.clone(),
        }
    }

    pub fn answers_in(&self, room_id: &str) -> bool {
        self.rooms.is_empty() || self.rooms.iter().any(|r| r == room_id)
    }

    /// First usable directory of `workdir.default_root` and `DEFAULT_WORKDIR`,
    /// else the process working directory.
    pub fn default_root(&self) -> Result<PathBuf> {
        self.resolve_root(std::env::var_os(DEFAULT_WORKDIR_ENV).map(PathBuf::from))
    }

    fn resolve_root(&self, from_env: Option<PathBuf>) -> Result<PathBuf> {
        for candidate in self.workdir.default_root.iter().cloned().chain(from_env) {
            let raw = candidate.to_string_lossy();
            let expanded = PathBuf::from(shellexpand::tilde(&raw).into_owned());
            match expanded.canonicalize() {
                Ok(path) if path.is_dir() => return Ok(path),
                Ok(_) | Err(_) => warn!(
                    path = %candidate.display(),
                    "Default root candidate is not a directory; skipping"
                ),
            }
        }
        std::env::current_dir()
            .and_then(|dir| dir.canonicalize())
            .context("resolving current directory as default root")
    }
}

/// Missing file means defaults; an unreadable or invalid one is fatal.
pub fn load_config(path: &Path) -> Result<BotConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found; using defaults");
        return Ok(BotConfig::default());
    }
    let yaml = fs::read_to_string(path)
        .with_context(|| format!("reading config file at {}", path.display()))?;
    let cfg: BotConfig = serde_yaml::from_str(&yaml).context("parsing YAML config")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_uses_defaults() {
        let cfg: BotConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.executor.timeout_secs, 60);
        assert_eq!(cfg.history.max_turns, 20);
        assert!(cfg.delegation.program.is_none());
        assert!(cfg.answers_in("!any:room"));
    }

    #[test]
    fn parses_full_config() {
        let yaml = r#"
workdir:
  default_root: /tmp
executor:
  shell: ["bash", "-lc"]
  timeout_secs: 5
ai:
  provider: openai
  model: gpt-4o-mini
  api_key_env: MY_KEY
history:
  max_turns: 6
  max_age_hours: 0
delegation:
  program: ["gemini", "-p", "{payload}", "-y"]
reply:
  max_chars: 1000
rooms: ["!abc:example.org"]
"#;
        let cfg: BotConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.executor.shell, ["bash", "-lc"]);
        assert_eq!(cfg.ai.provider, bridge_ai::Provider::OpenAi);
        assert_eq!(cfg.ai.api_key_env.as_deref(), Some("MY_KEY"));
        assert_eq!(cfg.history.max_age_hours, 0);
        assert_eq!(cfg.reply.max_chars, 1000);
        assert!(cfg.answers_in("!abc:example.org"));
        assert!(!cfg.answers_in("!other:example.org"));
        assert_eq!(
            cfg.router_config().delegation.command_line("ls"),
            "gemini -p ls -y"
        );
    }

    #[test]
    fn missing_root_falls_back_to_cwd() {
        let cfg = BotConfig {
            workdir: WorkdirConfig {
                default_root: Some(PathBuf::from("/definitely/not/here")),
            },
            ..BotConfig::default()
        };
        let root = cfg.resolve_root(None).unwrap();
        assert_eq!(root, std::env::current_dir().unwrap().canonicalize().unwrap());
    }

    #[test]
    fn env_root_is_used_when_config_has_none() {
        let tmp = tempfile::tempdir().unwrap();
        let root = BotConfig::default()
            .resolve_root(Some(tmp.path().to_path_buf()))
            .unwrap();
        assert_eq!(root, tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn configured_root_wins_over_env() {
        let configured = tempfile::tempdir().unwrap();
        let from_env = tempfile::tempdir().unwrap();
        let cfg = BotConfig {
            workdir: WorkdirConfig {
                default_root: Some(configured.path().to_path_buf()),
            },
            ..BotConfig::default()
        };
        let root = cfg.resolve_root(Some(from_env.path().to_path_buf())).unwrap();
        assert_eq!(root, configured.path().canonicalize().unwrap());
    }

    #[test]
    fn missing_file_is_default() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = load_config(&tmp.path().join("nope.yaml")).unwrap();
        assert!(cfg.rooms.is_empty());
    }
}
