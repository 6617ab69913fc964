//! Ollama `/api/generate` client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use super::generative::ModelClient;
use crate::config::OllamaSection;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    num_ctx: u32,
}

impl OllamaClient {
    pub fn new(config: &OllamaSection) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Ollama HTTP client")?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            num_ctx: config.num_ctx,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn payload(&self, prompt: &str, schema: Option<Value>) -> Value {
        let mut body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_ctx": self.num_ctx,
            },
        });
        if let Some(schema) = schema {
            body["format"] = schema;
        }
        body
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn generate(&self, prompt: &str, schema: Option<Value>) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        tracing::debug!(model = %self.model, prompt_chars = prompt.len(), "ollama generate");
        let resp: GenerateResponse = self
            .http
            .post(&url)
            .json(&self.payload(prompt, schema))
            .send()
            .await
            .with_context(|| format!("Failed to reach Ollama at {}", self.base_url))?
            .error_for_status()
            .context("Ollama returned error status")?
            .json()
            .await
            .context("Failed to parse Ollama response")?;
        Ok(resp.response)
    }
}
