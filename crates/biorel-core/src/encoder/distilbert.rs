//! # DistilBERT Encoder
//!
//! Loads a pretrained DistilBERT checkpoint (`config.json`, `tokenizer.json`,
//! `model.safetensors`) into trainable variables and registers one start and
//! one end marker token per entity type with the tokenizer. The word
//! embedding table is grown to the new vocabulary size: pretrained rows are
//! copied over and the marker rows keep their fresh initialization.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::distilbert::{Config as BertConfig, DistilBertModel};
use tokenizers::{AddedToken, Tokenizer as HfTokenizer};

use super::{EncoderInput, SequenceEncoder};
use crate::error::{BiorelError, Result};
use crate::marker::MarkerVocab;
use crate::types::UNTYPED_ENTITY;

/// Variable prefix of the encoder inside its [`VarMap`].
pub const ENCODER_PREFIX: &str = "encoder";

/// Prefix used by Hugging Face task heads for the base model weights.
const HF_BASE_PREFIX: &str = "distilbert.";

const WORD_EMBEDDINGS: &str = "embeddings.word_embeddings.weight";

pub struct DistilBertEncoder {
    model: DistilBertModel,
    markers: MarkerVocab,
    hidden_size: usize,
    pad_id: u32,
    device: Device,
}

impl DistilBertEncoder {
    /// Loads the checkpoint in `model_dir` into `varmap` under
    /// [`ENCODER_PREFIX`], growing the vocabulary for `entity_types`.
    pub fn load<P: AsRef<Path>>(
        model_dir: P,
        entity_types: &[String],
        varmap: &VarMap,
        device: &Device,
    ) -> Result<Self> {
        let model_dir = model_dir.as_ref();

        let mut tokenizer = HfTokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| BiorelError::EncoderLoad(format!("tokenizer: {e}")))?;
        let markers = register_markers(&mut tokenizer, entity_types)?;

        let config_path = model_dir.join("config.json");
        let config_str = std::fs::read_to_string(&config_path).map_err(|e| {
            BiorelError::EncoderLoad(format!("failed to read {}: {e}", config_path.display()))
        })?;
        let mut raw_config: serde_json::Value = serde_json::from_str(&config_str)
            .map_err(|e| BiorelError::EncoderLoad(format!("failed to parse config: {e}")))?;

        let hidden_size = raw_config
            .get("dim")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| BiorelError::EncoderLoad("config has no \"dim\"".into()))?
            as usize;
        let pad_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| {
                raw_config
                    .get("pad_token_id")
                    .and_then(serde_json::Value::as_u64)
                    .map(|id| id as u32)
            })
            .unwrap_or(0);

        let vocab_size = markers.vocab_size();
        raw_config["vocab_size"] = serde_json::Value::from(vocab_size);
        let config: BertConfig = serde_json::from_value(raw_config)
            .map_err(|e| BiorelError::EncoderLoad(format!("failed to parse config: {e}")))?;

        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let model = DistilBertModel::load(vb.pp(ENCODER_PREFIX), &config)?;

        let weights_path = model_dir.join("model.safetensors");
        let pretrained = candle_core::safetensors::load(&weights_path, device)?;
        copy_pretrained(varmap, &pretrained)?;

        tracing::info!(
            base_vocab = markers.base_vocab_size(),
            vocab_size,
            hidden_size,
            "loaded DistilBERT encoder from {}",
            model_dir.display()
        );

        Ok(Self {
            model,
            markers,
            hidden_size,
            pad_id,
            device: device.clone(),
        })
    }

    /// Marker ids assigned by the tokenizer.
    pub fn markers(&self) -> &MarkerVocab {
        &self.markers
    }
}

impl SequenceEncoder for DistilBertEncoder {
    fn encode(&self, input: &EncoderInput) -> Result<Tensor> {
        // DistilBERT masks positions where the mask is 1
        let (batch, seq_len) = input.attention_mask.dims2()?;
        let padding = input
            .attention_mask
            .eq(0u32)?
            .reshape((batch, 1, 1, seq_len))?;
        Ok(self.model.forward(&input.token_ids, &padding)?)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Adds the marker tokens of every entity type (plus the untyped fallback)
/// to the tokenizer as special tokens.
fn register_markers(tokenizer: &mut HfTokenizer, entity_types: &[String]) -> Result<MarkerVocab> {
    let base_vocab_size = tokenizer.get_vocab_size(true);

    let mut types: Vec<&str> = entity_types.iter().map(String::as_str).collect();
    types.push(UNTYPED_ENTITY);
    types.sort_unstable();
    types.dedup();

    let added: Vec<AddedToken> = types
        .iter()
        .flat_map(|ty| [MarkerVocab::start_token(ty), MarkerVocab::end_token(ty)])
        .map(|token| AddedToken::from(token, true))
        .collect();
    tokenizer.add_special_tokens(&added);

    let mut markers = Vec::with_capacity(types.len());
    for ty in types {
        let lookup = |token: String| {
            tokenizer.token_to_id(&token).ok_or_else(|| {
                BiorelError::EncoderLoad(format!("tokenizer did not register {token}"))
            })
        };
        let start = lookup(MarkerVocab::start_token(ty))?;
        let end = lookup(MarkerVocab::end_token(ty))?;
        markers.push((ty.to_string(), (start, end)));
    }
    Ok(MarkerVocab::from_assigned(base_vocab_size, markers))
}

/// Overwrites every encoder variable with its pretrained value.
///
/// The grown word-embedding table keeps its extra rows.
fn copy_pretrained(
    varmap: &VarMap,
    pretrained: &std::collections::HashMap<String, Tensor>,
) -> Result<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| BiorelError::EncoderLoad("variable map lock poisoned".into()))?;
    let prefix = format!("{ENCODER_PREFIX}.");

    for (name, var) in vars.iter() {
        let Some(local) = name.strip_prefix(&prefix) else {
            continue;
        };
        let source = pretrained
            .get(local)
            .or_else(|| pretrained.get(&format!("{HF_BASE_PREFIX}{local}")))
            .ok_or_else(|| BiorelError::EncoderLoad(format!("checkpoint has no tensor {local}")))?
            .to_dtype(DType::F32)?;

        if source.shape() == var.shape() {
            var.set(&source)?;
            continue;
        }

        let mismatch = || {
            BiorelError::EncoderLoad(format!(
                "shape mismatch for {local}: checkpoint {:?}, model {:?}",
                source.dims(),
                var.as_tensor().dims()
            ))
        };
        if local != WORD_EMBEDDINGS {
            return Err(mismatch());
        }
        let (rows, cols) = var.as_tensor().dims2()?;
        let (source_rows, source_cols) = source.dims2()?;
        if source_cols != cols || source_rows >= rows {
            return Err(mismatch());
        }
        let fresh = var.as_tensor().narrow(0, source_rows, rows - source_rows)?;
        var.set(&Tensor::cat(&[&source, &fresh], 0)?)?;
    }
    Ok(())
}
