//! Client for a text-generation-inference server hosting the fine-tuned
//! model (`hf` patcher mode).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use super::generative::ModelClient;
use crate::config::HfSection;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    generated_text: String,
}

#[derive(Debug, Clone)]
pub struct TgiClient {
    http: reqwest::Client,
    base_url: String,
    adapter: Option<String>,
    max_new_tokens: u32,
    temperature: f32,
    top_p: f32,
}

impl TgiClient {
    pub fn new(config: &HfSection) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build inference HTTP client")?;
        let adapter = Some(config.adapter.trim().to_string()).filter(|a| !a.is_empty());
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            adapter,
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
        })
    }

    fn payload(&self, prompt: &str, schema: Option<Value>) -> Value {
        let mut parameters = json!({
            "max_new_tokens": self.max_new_tokens,
            "top_p": self.top_p,
            "return_full_text": false,
        });
        // The server rejects temperature == 0; greedy decoding instead.
        if self.temperature > 0.0 {
            parameters["temperature"] = json!(self.temperature);
            parameters["do_sample"] = json!(true);
        }
        if let Some(adapter) = &self.adapter {
            parameters["adapter_id"] = json!(adapter);
        }
        if let Some(schema) = schema {
            parameters["grammar"] = json!({"type": "json", "value": schema});
        }
        json!({"inputs": prompt, "parameters": parameters})
    }
}

#[async_trait]
impl ModelClient for TgiClient {
    async fn generate(&self, prompt: &str, schema: Option<Value>) -> Result<String> {
        let url = format!("{}/generate", self.base_url);
        tracing::debug!(adapter = ?self.adapter, prompt_chars = prompt.len(), "tgi generate");
        let resp: GenerateResponse = self
            .http
            .post(&url)
            .json(&self.payload(prompt, schema))
            .send()
            .await
            .with_context(|| format!("Failed to reach inference server at {}", self.base_url))?
            .error_for_status()
            .context("Inference server returned error status")?
            .json()
            .await
            .context("Failed to parse inference response")?;
        Ok(resp.generated_text)
    }
}
