// src/embed/local.rs

//! Local sentence-transformer embedding tier (feature `local-embed`).
//! BERT via Candle, model files fetched through hf-hub and cached locally.
//! Mean pooling over token states, L2-normalized output.

use std::sync::Arc;

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{MemoryError, Result};

use super::EmbeddingBackend;

const MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";

pub struct LocalEmbedder {
    model: Arc<RwLock<Option<(BertModel, Tokenizer)>>>,
    device: Device,
    dim: usize,
}

impl LocalEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            model: Arc::new(RwLock::new(None)),
            device: Device::Cpu,
            dim,
        }
    }

    /// Downloads (or reuses the cached copy of) the model and tokenizer.
    /// Failure here is an unavailability signal, not an error.
    async fn ensure_loaded(&self) -> Result<()> {
        if self.model.read().await.is_some() {
            return Ok(());
        }

        let device = self.device.clone();
        let loaded = tokio::task::spawn_blocking(move || -> anyhow::Result<(BertModel, Tokenizer)> {
            let api = Api::new()?;
            let repo = api.repo(Repo::new(MODEL_ID.to_string(), RepoType::Model));
            let config_path = repo.get("config.json")?;
            let tokenizer_path = repo.get("tokenizer.json")?;
            let weights_path = repo.get("model.safetensors")?;

            let config: Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
            let tokenizer = Tokenizer::from_file(tokenizer_path)
                .map_err(|e| anyhow::anyhow!("tokenizer load failed: {e}"))?;
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DTYPE, &device)? };
            let model = BertModel::load(vb, &config)?;
            Ok((model, tokenizer))
        })
        .await
        .map_err(|_| MemoryError::Unavailable)?
        .map_err(|err| {
            warn!(%err, "local embedding model load failed");
            MemoryError::Unavailable
        })?;

        *self.model.write().await = Some(loaded);
        debug!(model = MODEL_ID, "local embedding model ready");
        Ok(())
    }

    fn embed_one(
        model: &BertModel,
        tokenizer: &Tokenizer,
        device: &Device,
        text: &str,
    ) -> Result<Vec<f32>> {
        let run = || -> candle_core::Result<Vec<f32>> {
            let encoding = tokenizer
                .encode(text, true)
                .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
            let token_ids = Tensor::new(encoding.get_ids(), device)?.unsqueeze(0)?;
            let token_type_ids = Tensor::zeros_like(&token_ids)?;

            let states = model.forward(&token_ids, &token_type_ids, None)?;
            let (_batch, n_tokens, _hidden) = states.dims3()?;
            let pooled = (states.sum(1)? / (n_tokens as f64))?.squeeze(0)?;

            let norm = pooled.sqr()?.sum_all()?.sqrt()?;
            let normalized = pooled.broadcast_div(&norm)?;
            normalized.to_vec1::<f32>()
        };
        run().map_err(|_| MemoryError::Unavailable)
    }
}

#[async_trait]
impl EmbeddingBackend for LocalEmbedder {
    fn name(&self) -> &'static str {
        "local-model"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_loaded().await?;
        let guard = self.model.read().await;
        let (model, tokenizer) = guard.as_ref().ok_or(MemoryError::Unavailable)?;

        let mut rows = Vec::with_capacity(texts.len());
        for text in texts {
            let vector = Self::embed_one(model, tokenizer, &self.device, text)?;
            if vector.len() != self.dim {
                // Dimension disagreement with the configured width makes this
                // tier unavailable for the call rather than poisoning the index.
                return Err(MemoryError::Unavailable);
            }
            rows.push(vector);
        }
        Ok(rows)
    }
}
