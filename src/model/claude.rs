//! Claude API provider.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{format_context, GenerationRequest, LanguageModelClient};
use crate::error::ProviderError;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 1024;

/// Claude API request structure
#[derive(Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    system: String,
    temperature: f32,
    messages: Vec<ClaudeMessage>,
}

#[derive(Serialize)]
struct ClaudeMessage {
    role: String,
    content: Vec<RequestBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

/// Claude API response structure
#[derive(Deserialize)]
struct ClaudeResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Persona reply generation backed by the Anthropic messages API
pub struct ClaudeClient {
    client: Client,
    api_key: String,
    model: String,
}

impl ClaudeClient {
    pub fn new(api_key: String, model: String) -> Self {
        info!("Claude client initialized (model: {})", model);
        Self {
            client: Client::new(),
            api_key,
            model,
        }
    }

    fn build_request(&self, request: &GenerationRequest) -> ClaudeRequest {
        ClaudeRequest {
            model: self.model.clone(),
            max_tokens: MAX_OUTPUT_TOKENS,
            system: request.instructions.clone(),
            temperature: 1.0,
            messages: vec![ClaudeMessage {
                role: "user".to_string(),
                content: build_user_content(request),
            }],
        }
    }
}

/// Transcript plus the new message, in the persona's working language.
fn build_user_content(request: &GenerationRequest) -> Vec<RequestBlock> {
    let transcript = format_context(&request.context);
    let task = match (&request.input_text, &request.image) {
        (Some(text), Some(_)) => format!(
            "New message from the contact (with an image): {}\n\nReact to both the text and the image.\n\nYour reply:",
            text
        ),
        (None, Some(_)) => {
            "The contact sent an image. React to it the way your instructions describe.\n\nYour reply:"
                .to_string()
        }
        (Some(text), None) => format!("New message from the contact: {}\n\nYour reply:", text),
        (None, None) => "Write the message now.".to_string(),
    };

    let mut blocks = vec![RequestBlock::Text {
        text: format!("{}\n\n{}", transcript, task),
    }];
    if let Some(image) = &request.image {
        blocks.push(RequestBlock::Image {
            source: ImageSource {
                kind: "base64",
                media_type: image.mime_type.clone(),
                data: STANDARD.encode(&image.bytes),
            },
        });
    }
    blocks
}

/// Map an HTTP failure to the provider error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = format!("{} - {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
        || status.as_u16() == 529
    {
        ProviderError::Transient(detail)
    } else {
        ProviderError::Other(detail)
    }
}

fn extract_reply(response: ClaudeResponse) -> Result<String, ProviderError> {
    if response.stop_reason.as_deref() == Some("refusal") {
        return Err(ProviderError::ContentPolicy(
            "model refused to answer".to_string(),
        ));
    }

    let text: String = response
        .content
        .into_iter()
        .filter_map(|block| block.text)
        .collect::<Vec<_>>()
        .join("");
    // Markdown emphasis reads as robotic in chat
    let text = text.replace('*', "").trim().to_string();

    if text.is_empty() {
        return Err(ProviderError::Other("empty response text".to_string()));
    }
    Ok(text)
}

#[async_trait]
impl LanguageModelClient for ClaudeClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        if request.relaxed_safety {
            debug!(
                "[claude {}] thread has relaxed restrictions; no per-request moderation setting on this API",
                request.thread_id
            );
        }

        let body = self.build_request(request);
        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let claude_response: ClaudeResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Other(format!("failed to parse response: {}", e)))?;

        if let Some(usage) = claude_response.usage {
            debug!(
                "[claude {}] usage: {} in, {} out",
                request.thread_id, usage.input_tokens, usage.output_tokens
            );
        }

        extract_reply(claude_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImageInput;

    fn request(text: Option<&str>, image: bool) -> GenerationRequest {
        GenerationRequest {
            thread_id: 3,
            instructions: "You are Alex.".into(),
            context: vec![],
            input_text: text.map(String::from),
            image: image.then(|| ImageInput {
                bytes: vec![1, 2, 3],
                mime_type: "image/jpeg".into(),
            }),
            relaxed_safety: false,
        }
    }

    #[test]
    fn test_request_serializes_image_block() {
        let client = ClaudeClient::new("key".into(), DEFAULT_MODEL.into());
        let json = serde_json::to_value(client.build_request(&request(Some("hi"), true))).unwrap();

        assert_eq!(json["system"], "You are Alex.");
        let content = &json["messages"][0]["content"];
        assert_eq!(content[0]["type"], "text");
        assert!(content[0]["text"].as_str().unwrap().contains("with an image"));
        assert_eq!(content[1]["type"], "image");
        assert_eq!(content[1]["source"]["type"], "base64");
        assert_eq!(content[1]["source"]["data"], "AQID");
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, "").is_retryable());
        assert!(classify_status(StatusCode::from_u16(529).unwrap(), "").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_retryable());
    }

    #[test]
    fn test_extract_reply() {
        let ok: ClaudeResponse = serde_json::from_str(
            r#"{"content":[{"type":"text","text":" *hey* there "}],"stop_reason":"end_turn"}"#,
        )
        .unwrap();
        assert_eq!(extract_reply(ok).unwrap(), "hey there");

        let refused: ClaudeResponse =
            serde_json::from_str(r#"{"content":[],"stop_reason":"refusal"}"#).unwrap();
        assert!(matches!(
            extract_reply(refused),
            Err(ProviderError::ContentPolicy(_))
        ));

        let empty: ClaudeResponse =
            serde_json::from_str(r#"{"content":[{"type":"text","text":"  "}]}"#).unwrap();
        assert!(matches!(extract_reply(empty), Err(ProviderError::Other(_))));
    }
}
