use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{SpeechError, Synthesizer};

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

/// Synthesizer backed by the OpenAI `audio/speech` endpoint.
pub struct OpenAiSynthesizer {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiSynthesizer {
    pub fn new(
        endpoint: &str,
        api_key: String,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, SpeechError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SpeechError::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str, out: &Path) -> Result<(), SpeechError> {
        let url = format!("{}/audio/speech", self.endpoint);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&SpeechRequest {
                model: &self.model,
                input: text,
                voice,
                response_format: "mp3",
            })
            .send()
            .await
            .map_err(|e| SpeechError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SpeechError::Status(response.status().as_u16()));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| SpeechError::Http(e.to_string()))?;
        debug!(bytes = audio.len(), "speech audio received");
        tokio::fs::write(out, &audio)
            .await
            .map_err(|e| SpeechError::Artifact(format!("{}: {e}", out.display())))?;
        Ok(())
    }

    fn extension(&self) -> &str {
        "mp3"
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_shape() {
        let body = serde_json::to_value(SpeechRequest {
            model: "tts-1",
            input: "Clear path ahead",
            voice: "alloy",
            response_format: "mp3",
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "model": "tts-1",
                "input": "Clear path ahead",
                "voice": "alloy",
                "response_format": "mp3",
            })
        );
    }
}
