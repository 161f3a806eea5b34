//! Ollama-compatible local LLM client.
//!
//! Two endpoints only: `GET /api/tags` to list installed models and
//! `POST /api/generate` (non-streaming) for completions. The client is a
//! thin wire wrapper; model selection and fallback live in the service.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn list_models(&self, timeout: Duration) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .context("ollama tags request")?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("ollama tags {}", status.as_u16()));
        }

        let parsed: TagsResponse = resp.json().await.context("ollama tags json parse")?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    pub async fn generate(&self, model: &str, prompt: &str, timeout: Duration) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let req = GenerateRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            stream: false,
        };

        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&req)
            .send()
            .await
            .context("ollama generate request")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(anyhow!("ollama generate {}: {}", status.as_u16(), snippet));
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&body).context("ollama generate json parse")?;
        Ok(parsed.response)
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}
