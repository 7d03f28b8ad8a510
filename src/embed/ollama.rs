// src/embed/ollama.rs

//! Local-inference embedding tier. Talks to an Ollama server over HTTP:
//! the batch `/api/embed` endpoint first, then the older per-prompt
//! `/api/embeddings` endpoint. Any transport error or timeout means the
//! tier is unavailable for that call — never an error to the caller.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{MemoryError, Result};

use super::EmbeddingBackend;

pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct BatchResponse {
    embeddings: Option<Vec<Vec<f32>>>,
}

#[derive(Deserialize)]
struct SingleResponse {
    embedding: Option<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
        }
    }

    async fn embed_batch_endpoint(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(|_| MemoryError::Unavailable)?;
        if !response.status().is_success() {
            return Err(MemoryError::Unavailable);
        }
        let body: BatchResponse = response.json().await.map_err(|_| MemoryError::Unavailable)?;
        match body.embeddings {
            Some(rows) if rows.len() == texts.len() => Ok(rows),
            _ => Err(MemoryError::Unavailable),
        }
    }

    async fn embed_legacy_endpoint(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let mut rows = Vec::with_capacity(texts.len());
        for text in texts {
            let response = self
                .client
                .post(&url)
                .timeout(self.timeout)
                .json(&json!({ "model": self.model, "prompt": text }))
                .send()
                .await
                .map_err(|_| MemoryError::Unavailable)?;
            if !response.status().is_success() {
                return Err(MemoryError::Unavailable);
            }
            let body: SingleResponse =
                response.json().await.map_err(|_| MemoryError::Unavailable)?;
            match body.embedding {
                Some(vector) if !vector.is_empty() => rows.push(vector),
                _ => return Err(MemoryError::Unavailable),
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbedder {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match self.embed_batch_endpoint(texts).await {
            Ok(rows) => Ok(rows),
            Err(_) => {
                debug!("ollama /api/embed failed, trying legacy endpoint");
                self.embed_legacy_endpoint(texts).await
            }
        }
    }
}
