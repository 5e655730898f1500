use crate::config::{LlmConfig, Secret};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TestGenError {
    #[error("failed to reach text-generation API: {0}")]
    Request(String),
    #[error("text-generation API error: {status} - {body}")]
    Api { status: u16, body: String },
    #[error("text-generation API returned no text")]
    EmptyResponse,
    #[error("test generation interrupted")]
    Interrupted,
}

/// A hosted model that turns a prompt into text.
#[allow(async_fn_in_trait)]
pub trait TextGenerator {
    async fn generate(&self, system_instruction: &str, prompt: &str) -> Result<String, TestGenError>;
}

/// Client for the Gemini `generateContent` API
pub struct GeminiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Secret,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiClient {
    /// Create a new client with the configured request timeout
    pub fn new(config: &LlmConfig, api_key: Secret) -> Result<Self, TestGenError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| TestGenError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl TextGenerator for GeminiClient {
    async fn generate(&self, system_instruction: &str, prompt: &str) -> Result<String, TestGenError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let request = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: system_instruction,
                }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig { temperature: 0.2 },
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose())
            .json(&request)
            .send()
            .await
            .map_err(|e| TestGenError::Request(self.api_key.redact(&e.to_string())))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TestGenError::Api {
                status,
                body: self.api_key.redact(&body),
            });
        }

        let result: GenerateResponse = response
            .json()
            .await
            .map_err(|e| TestGenError::Request(format!("Failed to parse response: {}", e)))?;

        let text: String = result
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(TestGenError::EmptyResponse);
        }
        Ok(text)
    }
}
