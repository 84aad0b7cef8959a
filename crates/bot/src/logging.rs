use anyhow::{Context as _, Result};
use tracing::{Subscriber, level_filters::LevelFilter};
use tracing_subscriber::{
    EnvFilter, Layer, layer::SubscriberExt as _, registry::LookupSpan, util::SubscriberInitExt as _,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// `RUST_LOG_MODE=json` selects JSON lines; anything else is pretty.
    pub fn from_env() -> Self {
        match std::env::var("RUST_LOG_MODE").as_deref() {
            Ok("json") => Self::Json,
            _ => Self::Pretty,
        }
    }

    pub fn layer<S>(self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        for<'a> S: Subscriber + LookupSpan<'a>,
    {
        let fmt = tracing_subscriber::fmt::layer().with_thread_names(true);
        match self {
            Self::Json => Box::new(fmt.json().with_target(false)),
            Self::Pretty => Box::new(fmt.pretty().with_target(true).with_line_number(true)),
        }
    }
}

/// Installs the global subscriber. Defaults to `info`; `RUST_LOG` overrides.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()
        .context("parsing RUST_LOG filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(LogFormat::from_env().layer())
        .try_init()
        .context("installing tracing subscriber")
}
