//! # Sequence Encoders
//!
//! The contextual encoder is a black box behind [`SequenceEncoder`]: it maps
//! a padded batch of token ids to one hidden vector per token. Two
//! implementations ship with the crate:
//!
//! - [`DistilBertEncoder`]: a pretrained DistilBERT checkpoint whose
//!   embedding table is grown for the marker tokens.
//! - [`LiteEncoder`]: a small trainable encoder with no pretrained weights,
//!   used for tests, benches and quick experiments.

pub mod distilbert;
pub mod lite;

use candle_core::{Device, Tensor};

use crate::error::Result;

pub use distilbert::DistilBertEncoder;
pub use lite::LiteEncoder;

/// A padded batch of token sequences.
#[derive(Debug, Clone)]
pub struct EncoderInput {
    /// `[batch, seq_len]` token ids.
    pub token_ids: Tensor,
    /// `[batch, seq_len]`, 1 for real tokens and 0 for padding.
    pub attention_mask: Tensor,
    /// `[batch, seq_len]` positions `0..seq_len` per row.
    pub position_ids: Tensor,
    /// Unpadded length of each sequence.
    pub lengths: Vec<usize>,
}

impl EncoderInput {
    /// Right-pads `sequences` with `pad_id` to the longest length.
    pub fn from_sequences(sequences: &[Vec<u32>], pad_id: u32, device: &Device) -> Result<Self> {
        let batch = sequences.len();
        let seq_len = sequences.iter().map(Vec::len).max().unwrap_or(0).max(1);

        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for seq in sequences {
            ids.extend_from_slice(seq);
            ids.extend(std::iter::repeat_n(pad_id, seq_len - seq.len()));
            mask.extend(std::iter::repeat_n(1u32, seq.len()));
            mask.extend(std::iter::repeat_n(0u32, seq_len - seq.len()));
        }
        let positions: Vec<u32> = (0..batch)
            .flat_map(|_| 0..seq_len as u32)
            .collect();

        Ok(Self {
            token_ids: Tensor::from_vec(ids, (batch, seq_len), device)?,
            attention_mask: Tensor::from_vec(mask, (batch, seq_len), device)?,
            position_ids: Tensor::from_vec(positions, (batch, seq_len), device)?,
            lengths: sequences.iter().map(Vec::len).collect(),
        })
    }
}

/// Contextual token encoder.
pub trait SequenceEncoder {
    /// Encodes a batch, returning `[batch, seq_len, hidden_size]`.
    fn encode(&self, input: &EncoderInput) -> Result<Tensor>;

    /// Width of each per-token hidden vector.
    fn hidden_size(&self) -> usize;

    /// Token id used to pad sequences.
    fn pad_id(&self) -> u32;

    /// Device the encoder's weights live on.
    fn device(&self) -> &Device;
}
