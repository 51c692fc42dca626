use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{AnalysisError, AnalysisRequest, VisionClient};

/// Longest error body kept in [`AnalysisError::Status`].
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [UserMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: [ContentPart<'a>; 2],
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Debug, Serialize)]
struct ImageUrl<'a> {
    url: String,
    detail: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl<'a> ChatCompletionRequest<'a> {
    fn from_request(request: &'a AnalysisRequest) -> Self {
        Self {
            model: &request.model,
            messages: [UserMessage {
                role: "user",
                content: [
                    ContentPart::Text {
                        text: request.prompt,
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: request.image.data_url(),
                            detail: request.detail.as_str(),
                        },
                    },
                ],
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }
}

/// Vision client for OpenAI-compatible `chat/completions` endpoints.
pub struct OpenAiVisionClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiVisionClient {
    pub fn new(endpoint: &str, api_key: String, timeout: Duration) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AnalysisError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl VisionClient for OpenAiVisionClient {
    async fn describe(&self, request: &AnalysisRequest) -> Result<String, AnalysisError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = ChatCompletionRequest::from_request(request);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        debug!(status = status.as_u16(), "vision service responded");
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(AnalysisError::Unauthorized)
            }
            StatusCode::TOO_MANY_REQUESTS => return Err(AnalysisError::RateLimited),
            s if !s.is_success() => {
                let mut body = response.text().await.unwrap_or_default();
                if body.len() > MAX_ERROR_BODY {
                    let cut = (0..=MAX_ERROR_BODY)
                        .rev()
                        .find(|&i| body.is_char_boundary(i))
                        .unwrap_or(0);
                    body.truncate(cut);
                }
                return Err(AnalysisError::Status {
                    status: s.as_u16(),
                    body,
                });
            }
            _ => {}
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        parse_description(&bytes)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

fn transport_error(e: reqwest::Error) -> AnalysisError {
    if e.is_timeout() {
        AnalysisError::Timeout
    } else {
        AnalysisError::Transport(e.to_string())
    }
}

fn parse_description(body: &[u8]) -> Result<String, AnalysisError> {
    let response: ChatCompletionResponse =
        serde_json::from_slice(body).map_err(|e| AnalysisError::Malformed(e.to_string()))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|text| !text.trim().is_empty())
        .ok_or(AnalysisError::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::NAVIGATION_PROMPT;
    use sightline_common::config::DetailLevel;
    use sightline_common::frame::EncodedImage;

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            model: "gpt-4o-mini".into(),
            prompt: NAVIGATION_PROMPT,
            image: EncodedImage {
                base64: "QUJD".into(),
                width: 4,
                height: 3,
                seq: 0,
            },
            detail: DetailLevel::Low,
            max_tokens: 150,
            temperature: 0.5,
        }
    }

    #[test]
    fn request_body_has_prompt_and_low_detail_image() {
        let request = request();
        let json = serde_json::to_value(ChatCompletionRequest::from_request(&request)).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["max_tokens"], 150);
        assert_eq!(json["temperature"], 0.5);
        let content = &json["messages"][0]["content"];
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], NAVIGATION_PROMPT);
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/jpeg;base64,QUJD");
        assert_eq!(content[1]["image_url"]["detail"], "low");
    }

    #[test]
    fn description_is_taken_from_first_choice() {
        let body = br#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"Stairs ahead, near."}}]}"#;
        assert_eq!(parse_description(body).unwrap(), "Stairs ahead, near.");
    }

    #[test]
    fn missing_choices_is_empty() {
        assert!(matches!(
            parse_description(br#"{"choices":[]}"#),
            Err(AnalysisError::Empty)
        ));
        assert!(matches!(
            parse_description(br#"{"choices":[{"message":{"content":null}}]}"#),
            Err(AnalysisError::Empty)
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_description(b"<html>bad gateway</html>"),
            Err(AnalysisError::Malformed(_))
        ));
    }
}
