use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::BackendError;
use crate::types::{AnalysisResult, SampleWindow};

use super::prompt::{parse_response, AnalysisPromptBuilder};
use super::ReasoningBackend;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Text-in, text-out inference endpoint.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, BackendError>;
}

/// Backend that asks a language model for the forecast and risk judgment.
pub struct RemoteInference {
    client: Arc<dyn InferenceClient>,
    model: String,
    prompts: AnalysisPromptBuilder,
    spacing: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RemoteInference {
    pub fn new(client: Arc<dyn InferenceClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            prompts: AnalysisPromptBuilder::new(),
            spacing: Duration::ZERO,
            last_call: Mutex::new(None),
        }
    }

    /// Minimum time between two requests to the client.
    pub fn with_spacing(mut self, spacing: Duration) -> Self {
        self.spacing = spacing;
        self
    }

    async fn wait_for_slot(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.spacing {
                let wait = self.spacing - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, "spacing remote request");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl ReasoningBackend for RemoteInference {
    async fn analyze(&self, window: &SampleWindow) -> Result<AnalysisResult, BackendError> {
        let prompt = self.prompts.build(window);
        self.wait_for_slot().await;
        let text = self.client.generate(&self.model, &prompt).await?;
        parse_response(&text)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// [`InferenceClient`] for the Generative Language `generateContent` API.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        Self::with_base_url(DEFAULT_GEMINI_BASE_URL, api_key, timeout)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

fn classify_status(status: StatusCode) -> Option<BackendError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Unauthorized(status.as_u16())
        }
        other => BackendError::Status(other.as_u16()),
    })
}

/// Concatenated text of the first candidate.
fn candidate_text(response: GenerateResponse) -> Result<String, BackendError> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(BackendError::Malformed("response has no candidate text".to_string()));
    }
    Ok(text)
}

#[async_trait]
impl InferenceClient for GeminiClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, BackendError> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);
        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
        };

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let parsed: GenerateResponse = response.json().await?;
        candidate_text(parsed)
    }
}
