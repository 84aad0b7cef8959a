use core::time::Duration;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use bridge_core::AiClient;

pub mod gemini;
pub mod openai;

pub use gemini::GeminiClient;
pub use openai::OpenAiClient;

pub const DEFAULT_SYSTEM_PROMPT: &str = r"
You turn a user's programming requests into clear, concrete instructions for a
command-line coding agent that runs in the user's current working directory.

Rules:
1. When the request is concrete enough to act on, write exactly one instruction
   for the agent between <gemini-cli> and </gemini-cli>.
2. After the instruction, add one short sentence telling the user what will be
   done, for example 'Creating index.html now.'
3. When the request is ambiguous, do not guess. Ask a clarifying question and
   do not emit the tags.
4. When the user is just chatting, answer normally without the tags.
5. Never put more than one <gemini-cli> block in a reply.
";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Gemini,
    #[serde(alias = "openai-compatible")]
    OpenAi,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub provider: Provider,
    pub model: Option<String>,
    pub api_base: Option<String>,
    pub api_path: Option<String>,
    pub api_key: Option<String>,
    /// Name of an environment variable holding the key.
    pub api_key_env: Option<String>,
    pub system_prompt: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl AiConfig {
    fn model(&self) -> String {
        self.model
            .clone()
            .or_else(|| std::env::var("AI_MODEL").ok())
            .unwrap_or_else(|| match self.provider {
                Provider::Gemini => "gemini-2.5-flash".to_owned(),
                Provider::OpenAi => "gpt-4o-mini".to_owned(),
            })
    }

    /// Key plus a description of where it came from (for logs, never the key).
    fn api_key(&self) -> Option<(String, String)> {
        if let Some(key) = self.api_key.clone().filter(|k| !k.is_empty()) {
            return Some((key, "config.api_key".to_owned()));
        }
        let provider_vars: &[&str] = match self.provider {
            Provider::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            Provider::OpenAi => &["OPENAI_API_KEY"],
        };
        self.api_key_env
            .iter()
            .map(String::as_str)
            .chain(core::iter::once("AI_API_KEY"))
            .chain(provider_vars.iter().copied())
            .find_map(|name| {
                std::env::var(name)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .map(|v| (v, format!("env.{name}")))
            })
    }

    fn url(&self, model: &str) -> String {
        let api_base = self
            .api_base
            .clone()
            .or_else(|| std::env::var("AI_API_BASE").ok());
        let api_path = self
            .api_path
            .clone()
            .or_else(|| std::env::var("AI_API_PATH").ok());
        match self.provider {
            Provider::Gemini => {
                let base = api_base.unwrap_or_else(|| {
                    "https://generativelanguage.googleapis.com/v1beta/models".to_owned()
                });
                format!("{}/{model}:generateContent", base.trim_end_matches('/'))
            }
            Provider::OpenAi => {
                let base = api_base.unwrap_or_else(|| "https://api.openai.com".to_owned());
                let path = api_path.unwrap_or_else(|| "/v1/chat/completions".to_owned());
                format!("{}{path}", base.trim_end_matches('/'))
            }
        }
    }

    fn system_prompt(&self) -> Option<String> {
        match self.system_prompt.as_deref().map(str::trim) {
            Some("") => None,
            Some(prompt) => Some(prompt.to_owned()),
            None => Some(DEFAULT_SYSTEM_PROMPT.trim().to_owned()),
        }
    }
}

/// Builds the configured adapter. A missing API key is a startup error.
pub fn build_client(config: &AiConfig) -> Result<Arc<dyn AiClient>> {
    let model = config.model();
    let url = config.url(&model);
    let Some((api_key, key_source)) = config.api_key() else {
        warn!(provider = ?config.provider, "No AI API key found in config or environment");
        return Err(anyhow!(
            "AI key missing: set ai.api_key, ai.api_key_env, AI_API_KEY or the provider's key variable"
        ));
    };

    let timeout = Duration::from_secs(config.timeout_secs.unwrap_or(60));
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("building HTTP client for AI adapter")?;

    info!(
        provider = ?config.provider,
        model = %model,
        url = %url,
        key_source = %key_source,
        timeout_s = timeout.as_secs(),
        "AI adapter prepared"
    );

    let system_prompt = config.system_prompt();
    Ok(match config.provider {
        Provider::Gemini => Arc::new(GeminiClient::new(http, url, api_key, system_prompt)),
        Provider::OpenAi => Arc::new(OpenAiClient::new(http, url, api_key, model, system_prompt)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_url_uses_model_path() {
        let cfg = AiConfig {
            api_base: Some("http://localhost:9000/models/".to_owned()),
            ..AiConfig::default()
        };
        assert_eq!(
            cfg.url("gemini-2.5-flash"),
            "http://localhost:9000/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn openai_url_joins_base_and_path() {
        let cfg = AiConfig {
            provider: Provider::OpenAi,
            api_base: Some("http://localhost:8080/".to_owned()),
            api_path: Some("/v1/chat/completions".to_owned()),
            ..AiConfig::default()
        };
        assert_eq!(cfg.url("m"), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn configured_key_wins() {
        let cfg = AiConfig {
            api_key: Some("k".to_owned()),
            ..AiConfig::default()
        };
        let (key, source) = cfg.api_key().unwrap();
        assert_eq!(key, "k");
        assert_eq!(source, "config.api_key");
    }

    #[test]
    fn empty_system_prompt_disables_it() {
        let cfg = AiConfig {
            system_prompt: Some("  ".to_owned()),
            ..AiConfig::default()
        };
        assert_eq!(cfg.system_prompt(), None);
        assert!(
            AiConfig::default()
                .system_prompt()
                .unwrap()
                .contains("<gemini-cli>")
        );
    }

    #[test]
    fn provider_parses_from_yaml_names() {
        #[derive(Deserialize)]
        struct Wrap {
            provider: Provider,
        }
        let wrap: Wrap = serde_json::from_str(r#"{"provider":"openai"}"#).unwrap();
        assert_eq!(wrap.provider, Provider::OpenAi);
    }
}
