use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use bridge_core::{AiClient, Role, Turn, UpstreamError, truncate};

const PROVIDER: &str = "openai";

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Msg {
    pub role: String,
    pub content: String,
}

#[derive(Serialize, Debug)]
pub struct Body {
    pub model: String,
    pub messages: Vec<Msg>,
    pub max_tokens: Option<u32>,
}

#[derive(Deserialize, Debug)]
pub struct ChoiceMsg {
    pub content: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct Choice {
    pub message: ChoiceMsg,
}

#[derive(Deserialize, Debug)]
pub struct ChatResp {
    pub choices: Vec<Choice>,
}

fn msg(role: &str, content: &str) -> Msg {
    Msg {
        role: role.to_owned(),
        content: content.to_owned(),
    }
}

#[must_use]
pub fn build_body(model: &str, system_prompt: Option<&str>, history: &[Turn], message: &str) -> Body {
    let mut messages = Vec::with_capacity(history.len() + 2);
    if let Some(prompt) = system_prompt {
        messages.push(msg("system", prompt));
    }
    messages.extend(history.iter().map(|turn| {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        msg(role, &turn.content)
    }));
    messages.push(msg("user", message));
    Body {
        model: model.to_owned(),
        messages,
        max_tokens: Some(1024),
    }
}

#[derive(Debug)]
pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    system_prompt: Option<String>,
}

impl OpenAiClient {
    pub const fn new(
        http: reqwest::Client,
        url: String,
        api_key: String,
        model: String,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            http,
            url,
            api_key,
            model,
            system_prompt,
        }
    }
}

#[async_trait]
impl AiClient for OpenAiClient {
    async fn complete(&self, history: &[Turn], message: &str) -> Result<String, UpstreamError> {
        let body = build_body(&self.model, self.system_prompt.as_deref(), history, message);
        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport {
                provider: PROVIDER,
                message: e.to_string(),
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| UpstreamError::Transport {
            provider: PROVIDER,
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(UpstreamError::Status {
                provider: PROVIDER,
                status: status.as_u16(),
                body: truncate(&text, 500),
            });
        }

        let parsed: ChatResp = serde_json::from_str(&text).map_err(|e| UpstreamError::Malformed {
            provider: PROVIDER,
            message: e.to_string(),
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(UpstreamError::Malformed {
                provider: PROVIDER,
                message: "no content in first choice".to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn body_prepends_system_prompt() {
        let history = [Turn {
            role: Role::Assistant,
            content: "Hello!".to_owned(),
            timestamp: datetime!(2025-06-01 12:00 UTC),
        }];
        let body = build_body("gpt-4o-mini", Some("sys"), &history, "hi");
        assert_eq!(
            body.messages,
            [msg("system", "sys"), msg("assistant", "Hello!"), msg("user", "hi")]
        );
        assert_eq!(body.model, "gpt-4o-mini");
    }

    #[test]
    fn parses_choice_content() {
        let resp: ChatResp = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"ok"}}]}"#,
        )
        .unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("ok"));
    }
}
