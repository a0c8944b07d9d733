//! Generation capability and concrete providers.
//!
//! `generate(context, question)` turns retrieved context plus the user's
//! question into an answer string. Calls are single-shot with an explicit
//! request timeout; expiry is a provider failure, never a hang. Failures
//! surface as [`Error::GenerationProvider`] and are converted by the
//! caller into a visible error reply.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::GenerationConfig;
use crate::error::{Error, Result};

/// Build the grounding prompt for one question.
pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "Use the following context to answer the user's question.\n\n\
         Context:\n{context}\n\nQuestion: {question}"
    )
}

/// Capability that answers a question grounded in assembled context.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, context: &str, question: &str) -> Result<String>;
}

/// Instantiate the provider named in the configuration.
pub fn create_client(config: &GenerationConfig) -> Result<Box<dyn GenerationClient>> {
    match config.provider.as_str() {
        "ollama" => Ok(Box::new(OllamaGenerator::new(config)?)),
        "openai" => Ok(Box::new(OpenAiGenerator::new(config)?)),
        other => Err(Error::GenerationProvider(format!(
            "unknown generation provider: {other}"
        ))),
    }
}

// ============ Ollama ============

/// Generation provider backed by a local Ollama instance.
pub struct OllamaGenerator {
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::GenerationProvider(e.to_string()))?;

        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            client,
        })
    }
}

#[async_trait]
impl GenerationClient for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, context: &str, question: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": build_prompt(context, question),
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::GenerationProvider(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::GenerationProvider(format!(
                "Ollama error {status}: {text}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::GenerationProvider(e.to_string()))?;

        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::GenerationProvider("invalid Ollama response: missing response field".into())
            })
    }
}

// ============ OpenAI ============

/// Generation provider backed by the OpenAI chat completions API.
///
/// Reads the API key from `OPENAI_API_KEY`.
pub struct OpenAiGenerator {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::GenerationProvider("OPENAI_API_KEY not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::GenerationProvider(e.to_string()))?;

        Ok(Self {
            model: config.model.clone(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl GenerationClient for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, context: &str, question: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": build_prompt(context, question) }
            ],
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::GenerationProvider(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::GenerationProvider(format!(
                "OpenAI error {status}: {text}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::GenerationProvider(e.to_string()))?;

        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::GenerationProvider("invalid OpenAI response: missing content".into())
            })
    }
}
