use core::fmt;
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    ai::AiClient,
    config::RouterConfig,
    delegation::{self, DelegationDirective},
    executor::Executor,
    sanitize_line,
    session::{SessionHandle, SessionStore, Turn},
    truncate,
};

pub const UPSTREAM_APOLOGY: &str =
    "Sorry, the AI service is unavailable right now. Please try again in a moment.";
pub const EMPTY_COMMAND_HINT: &str =
    "Usage: !<command> runs a shell command, !cd <path> changes directory, !pwd shows it.";
const TRUNCATION_MARKER: &str = "\n… (truncated)";

/// One text message delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub user_key: String,
    pub text: String,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent<'a> {
    ChangeDirectory(&'a str),
    ResetDirectory,
    PrintDirectory,
    EmptyCommand,
    /// Everything after the leading `!`, untouched.
    Shell(&'a str),
    AiQuery(&'a str),
}

impl Intent<'_> {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ChangeDirectory(_) => "cd",
            Self::ResetDirectory => "cd-reset",
            Self::PrintDirectory => "pwd",
            Self::EmptyCommand => "empty-command",
            Self::Shell(_) => "shell",
            Self::AiQuery(_) => "ai",
        }
    }
}

/// Classification rules in priority order; the first match wins and
/// anything unmatched is an AI query.
const RULES: &[fn(&str) -> Option<Intent<'_>>] = &[match_cd, match_cd_reset, match_pwd, match_shell];

fn match_cd(text: &str) -> Option<Intent<'_>> {
    text.strip_prefix("!cd ")
        .map(str::trim)
        .filter(|target| !target.is_empty())
        .map(Intent::ChangeDirectory)
}

fn match_cd_reset(text: &str) -> Option<Intent<'_>> {
    text.strip_prefix("!cd")
        .filter(|rest| rest.trim().is_empty())
        .map(|_| Intent::ResetDirectory)
}

fn match_pwd(text: &str) -> Option<Intent<'_>> {
    (text.trim_end() == "!pwd").then_some(Intent::PrintDirectory)
}

fn match_shell(text: &str) -> Option<Intent<'_>> {
    text.strip_prefix('!').map(|command| {
        if command.trim().is_empty() {
            Intent::EmptyCommand
        } else {
            Intent::Shell(command)
        }
    })
}

#[must_use]
pub fn classify(text: &str) -> Intent<'_> {
    RULES
        .iter()
        .find_map(|rule| rule(text))
        .unwrap_or(Intent::AiQuery(text))
}

pub struct Router {
    store: Arc<SessionStore>,
    executor: Arc<dyn Executor>,
    ai: Arc<dyn AiClient>,
    config: RouterConfig,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(
        store: Arc<SessionStore>,
        executor: Arc<dyn Executor>,
        ai: Arc<dyn AiClient>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            executor,
            ai,
            config,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Routes one message to completion and returns the single reply for it.
    /// Holds the user's session for the whole pass, so messages from the same
    /// user never interleave.
    pub async fn route(&self, message: &InboundMessage) -> String {
        let intent = classify(&message.text);
        info!(
            user = %message.user_key,
            intent = intent.label(),
            body = %sanitize_line(&message.text, 200),
            "Routing message"
        );

        let mut session = self.store.acquire(&message.user_key).await;
        let reply = match intent {
            Intent::AiQuery(text) => self.ai_query(&mut session, message, text).await,
            Intent::ChangeDirectory(target) => {
                let reply = Self::change_directory(&mut session, target).await;
                self.record(&mut session, message, reply)
            }
            Intent::ResetDirectory => {
                let reply = format!(
                    "Working directory reset to default:\n{}",
                    session.reset_working_directory().display()
                );
                self.record(&mut session, message, reply)
            }
            Intent::PrintDirectory => {
                let reply = format!(
                    "Current working directory:\n{}",
                    session.working_directory().display()
                );
                self.record(&mut session, message, reply)
            }
            Intent::EmptyCommand => {
                self.record(&mut session, message, EMPTY_COMMAND_HINT.to_owned())
            }
            Intent::Shell(command) => {
                let result = self
                    .executor
                    .execute(command, session.working_directory())
                    .await;
                info!(exit_code = result.exit_code, timed_out = result.timed_out, "Shell command done");
                self.record(&mut session, message, result.render())
            }
        };

        if let Err(err) = session.persist().await {
            warn!(user = %message.user_key, error = %err, "Failed to persist session; keeping in-memory state");
        }
        reply
    }

    async fn change_directory(session: &mut SessionHandle<'_>, target: &str) -> String {
        match session.set_working_directory(target).await {
            Ok(dir) => format!("Working directory changed to:\n{}", dir.display()),
            Err(err) => {
                info!(error = %err, "Rejected working directory change");
                format!(
                    "❌ Invalid directory: {err}. Working directory unchanged:\n{}",
                    session.working_directory().display()
                )
            }
        }
    }

    /// Appends the user's message and the (bounded) reply as one exchange.
    fn record(
        &self,
        session: &mut SessionHandle<'_>,
        message: &InboundMessage,
        reply: String,
    ) -> String {
        let reply = self.limit(reply);
        session.append_turn(Turn::user(&message.text, message.timestamp));
        session.append_turn(Turn::assistant(&reply));
        reply
    }

    async fn ai_query(
        &self,
        session: &mut SessionHandle<'_>,
        message: &InboundMessage,
        text: &str,
    ) -> String {
        let window = self
            .config
            .history
            .window(session.history(), OffsetDateTime::now_utc())
            .to_vec();
        session.append_turn(Turn::user(text, message.timestamp));

        debug!(context_turns = window.len(), "Calling AI adapter");
        let response = match self.ai.complete(&window, text).await {
            Ok(response) => response,
            Err(err) => {
                warn!(user = %message.user_key, error = %err, "AI completion failed");
                return UPSTREAM_APOLOGY.to_owned();
            }
        };

        let reply = match delegation::parse(&response) {
            None => response,
            Some(directive) => self.delegate(session, directive).await,
        };
        let reply = self.limit(reply);
        session.append_turn(Turn::assistant(&reply));
        reply
    }

    async fn delegate(&self, session: &SessionHandle<'_>, directive: DelegationDirective) -> String {
        let payload = directive.command_payload.trim();
        if payload.is_empty() {
            warn!("AI reply carried an empty delegation directive; not executing");
            return if directive.commentary.is_empty() {
                "(the assistant sent an empty instruction)".to_owned()
            } else {
                directive.commentary
            };
        }

        let command = self.config.delegation.command_line(payload);
        info!(command = %sanitize_line(&command, 200), "Executing delegated instruction");
        let result = self
            .executor
            .execute(&command, session.working_directory())
            .await;
        info!(exit_code = result.exit_code, timed_out = result.timed_out, "Delegated command done");

        if directive.commentary.is_empty() {
            result.render()
        } else {
            format!("{}\n\n{}", directive.commentary, result.render())
        }
    }

    fn limit(&self, reply: String) -> String {
        let max = self.config.reply.max_chars;
        if max == 0 || reply.chars().count() <= max {
            return reply;
        }
        let marker_len = TRUNCATION_MARKER.chars().count();
        if max <= marker_len {
            return truncate(&reply, max);
        }
        let mut out = truncate(&reply, max - marker_len);
        out.push_str(TRUNCATION_MARKER);
        out
    }
}
