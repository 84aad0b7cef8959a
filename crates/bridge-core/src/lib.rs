pub mod ai;
pub mod config;
pub mod delegation;
pub mod executor;
pub mod router;
pub mod session;

pub use ai::{AiClient, UpstreamError};
pub use config::{DelegationConfig, ExecutorConfig, HistoryConfig, ReplyConfig, RouterConfig};
pub use delegation::DelegationDirective;
pub use executor::{ExecutionResult, Executor, ShellExecutor};
pub use router::{InboundMessage, Intent, Router, classify};
pub use session::{
    PersistenceError, Role, SessionError, SessionHandle, SessionStore, StoreError, Turn,
    UserSession,
};

#[must_use]
pub fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[must_use]
pub fn sanitize_line(s: &str, max: usize) -> String {
    let compact = s.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate(&compact, max)
}
