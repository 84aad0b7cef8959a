use core::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::session::Turn;

/// Placeholder substituted with the delegated instruction in
/// [`DelegationConfig::program`].
pub const PAYLOAD_PLACEHOLDER: &str = "{payload}";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Shell argv prefix; the command string is appended as the last argument.
    pub shell: Vec<String>,
    pub timeout_secs: u64,
    /// Per-stream capture limit; anything beyond it is read and discarded.
    pub max_output_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        #[cfg(windows)]
        let shell = vec!["powershell".to_owned(), "-Command".to_owned()];
        #[cfg(not(windows))]
        let shell = vec!["sh".to_owned(), "-c".to_owned()];
        Self {
            shell,
            timeout_secs: 60,
            max_output_bytes: 64 * 1024,
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// How much prior conversation is handed to the AI adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_turns: usize,
    /// Turns older than this are not sent. `0` disables the age cut-off.
    pub max_age_hours: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_age_hours: 12,
        }
    }
}

impl HistoryConfig {
    /// The trailing slice of a chronological history that fits the policy.
    #[must_use]
    pub fn window<'a>(&self, history: &'a [Turn], now: OffsetDateTime) -> &'a [Turn] {
        let by_count = history.len().saturating_sub(self.max_turns);
        let by_age = if self.max_age_hours == 0 {
            0
        } else {
            let hours = i64::try_from(self.max_age_hours).unwrap_or(i64::MAX);
            let cutoff = now.checked_sub(time::Duration::hours(hours));
            cutoff.map_or(0, |cutoff| {
                history.partition_point(|turn| turn.timestamp <= cutoff)
            })
        };
        &history[by_count.max(by_age)..]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Optional argv template for delegated instructions, e.g.
    /// `["gemini", "-p", "{payload}", "-y"]`. When unset the payload itself is
    /// run as a shell command.
    pub program: Option<Vec<String>>,
}

impl DelegationConfig {
    /// Command line handed to the executor for a delegated payload.
    #[must_use]
    pub fn command_line(&self, payload: &str) -> String {
        let Some(program) = self.program.as_ref().filter(|argv| !argv.is_empty()) else {
            return payload.to_owned();
        };
        let mut argv: Vec<String> = program
            .iter()
            .map(|arg| arg.replace(PAYLOAD_PLACEHOLDER, payload))
            .collect();
        if !program.iter().any(|arg| arg.contains(PAYLOAD_PLACEHOLDER)) {
            argv.push(payload.to_owned());
        }
        shell_words::join(argv)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    pub max_chars: usize,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self { max_chars: 4000 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub history: HistoryConfig,
    pub delegation: DelegationConfig,
    pub reply: ReplyConfig,
}
