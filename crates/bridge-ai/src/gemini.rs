use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use bridge_core::{AiClient, Role, Turn, UpstreamError, truncate};

const PROVIDER: &str = "gemini";

#[derive(Serialize, Debug)]
pub struct GeminiBody {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    pub candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    pub finish_reason: Option<String>,
}

fn text_content(role: &str, text: &str) -> Content {
    Content {
        role: role.to_owned(),
        parts: vec![Part {
            text: Some(text.to_owned()),
        }],
    }
}

#[must_use]
pub fn build_body(system_prompt: Option<&str>, history: &[Turn], message: &str) -> GeminiBody {
    let mut contents: Vec<Content> = history
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            text_content(role, &turn.content)
        })
        .collect();
    contents.push(text_content("user", message));
    GeminiBody {
        contents,
        system_instruction: system_prompt.map(|prompt| text_content("user", prompt)),
    }
}

/// Text of the first candidate, or `None` if it carried no text (blocked,
/// empty, or function-call only).
#[must_use]
pub fn extract_text(response: &GeminiResponse) -> Option<String> {
    let candidate = response.candidates.as_ref()?.first()?;
    let text: String = candidate
        .content
        .as_ref()?
        .parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect();
    (!text.trim().is_empty()).then_some(text)
}

#[derive(Debug)]
pub struct GeminiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    system_prompt: Option<String>,
}

impl GeminiClient {
    pub const fn new(
        http: reqwest::Client,
        url: String,
        api_key: String,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            http,
            url,
            api_key,
            system_prompt,
        }
    }
}

#[async_trait]
impl AiClient for GeminiClient {
    async fn complete(&self, history: &[Turn], message: &str) -> Result<String, UpstreamError> {
        let body = build_body(self.system_prompt.as_deref(), history, message);
        let resp = self
            .http
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
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

        let parsed: GeminiResponse =
            serde_json::from_str(&text).map_err(|e| UpstreamError::Malformed {
                provider: PROVIDER,
                message: e.to_string(),
            })?;
        extract_text(&parsed).ok_or_else(|| {
            let reason = parsed
                .candidates
                .as_ref()
                .and_then(|c| c.first())
                .and_then(|c| c.finish_reason.clone())
                .unwrap_or_else(|| "no candidates".to_owned());
            UpstreamError::Malformed {
                provider: PROVIDER,
                message: format!("no text in reply ({reason})"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn body_maps_roles_and_appends_message() {
        let history = vec![
            Turn {
                role: Role::User,
                content: "make a counter".to_owned(),
                timestamp: datetime!(2025-06-01 12:00 UTC),
            },
            Turn {
                role: Role::Assistant,
                content: "Which language?".to_owned(),
                timestamp: datetime!(2025-06-01 12:01 UTC),
            },
        ];
        let body = build_body(Some("be brief"), &history, "JavaScript");
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(
            value,
            json!({
                "contents": [
                    { "role": "user", "parts": [{ "text": "make a counter" }] },
                    { "role": "model", "parts": [{ "text": "Which language?" }] },
                    { "role": "user", "parts": [{ "text": "JavaScript" }] },
                ],
                "system_instruction": { "role": "user", "parts": [{ "text": "be brief" }] },
            })
        );
    }

    #[test]
    fn system_instruction_omitted_when_unset() {
        let value = serde_json::to_value(build_body(None, &[], "hi")).unwrap();
        assert!(value.get("system_instruction").is_none());
    }

    #[test]
    fn extracts_joined_text_parts() {
        let resp: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "Sure. " }, { "text": "Done." }] },
                "finishReason": "STOP"
            }]
        }))
        .unwrap();
        assert_eq!(extract_text(&resp).as_deref(), Some("Sure. Done."));
    }

    #[test]
    fn blocked_candidate_has_no_text() {
        let resp: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{ "finishReason": "SAFETY" }]
        }))
        .unwrap();
        assert_eq!(extract_text(&resp), None);

        let empty: GeminiResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(extract_text(&empty), None);
    }
}
