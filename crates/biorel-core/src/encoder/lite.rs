//! Lightweight trainable encoder.
//!
//! Token and position embeddings are mixed with a masked mean of the whole
//! sentence, so every hidden vector sees some sentence context. There is no
//! attention; the encoder exists so the pair and ensemble machinery can be
//! trained and tested without a pretrained checkpoint.

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder};

use super::{EncoderInput, SequenceEncoder};
use crate::error::Result;

/// Default maximum sequence length (including markers).
pub const DEFAULT_MAX_POSITIONS: usize = 512;

pub struct LiteEncoder {
    token_embeddings: Embedding,
    position_embeddings: Embedding,
    context: Linear,
    norm: LayerNorm,
    hidden_size: usize,
    pad_id: u32,
    device: Device,
}

impl LiteEncoder {
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        max_positions: usize,
        pad_id: u32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let token_embeddings =
            candle_nn::embedding(vocab_size, hidden_size, vb.pp("token_embeddings"))?;
        let position_embeddings =
            candle_nn::embedding(max_positions, hidden_size, vb.pp("position_embeddings"))?;
        let context = candle_nn::linear(hidden_size, hidden_size, vb.pp("context"))?;
        let norm = candle_nn::layer_norm(hidden_size, 1e-5, vb.pp("norm"))?;

        Ok(Self {
            token_embeddings,
            position_embeddings,
            context,
            norm,
            hidden_size,
            pad_id,
            device: vb.device().clone(),
        })
    }
}

impl SequenceEncoder for LiteEncoder {
    fn encode(&self, input: &EncoderInput) -> Result<Tensor> {
        let embedded = self
            .token_embeddings
            .forward(&input.token_ids)?
            .add(&self.position_embeddings.forward(&input.position_ids)?)?;

        // masked mean over real tokens: [batch, hidden]
        let mask = input.attention_mask.to_dtype(DType::F32)?.unsqueeze(D::Minus1)?;
        let summed = embedded.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?.clamp(1f32, f32::MAX)?;
        let sentence = summed.broadcast_div(&counts)?;

        let context = self.context.forward(&sentence)?.tanh()?.unsqueeze(1)?;
        let hidden = embedded.broadcast_add(&context)?;
        Ok(self.norm.forward(&hidden)?)
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

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_encode_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = LiteEncoder::new(20, 8, 16, 0, vb).unwrap();

        let input =
            EncoderInput::from_sequences(&[vec![1, 2, 3, 4], vec![5, 6]], 0, &Device::Cpu)
                .unwrap();
        let hidden = encoder.encode(&input).unwrap();
        assert_eq!(hidden.dims(), &[2, 4, 8]);
        assert_eq!(encoder.hidden_size(), 8);
    }

    #[test]
    fn test_padding_does_not_change_real_tokens() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = LiteEncoder::new(20, 8, 16, 0, vb).unwrap();

        let alone = EncoderInput::from_sequences(&[vec![5, 6]], 0, &Device::Cpu).unwrap();
        let padded =
            EncoderInput::from_sequences(&[vec![5, 6], vec![1, 2, 3, 4]], 0, &Device::Cpu)
                .unwrap();

        let a = encoder.encode(&alone).unwrap().get(0).unwrap();
        let b = encoder
            .encode(&padded)
            .unwrap()
            .get(0)
            .unwrap()
            .narrow(0, 0, 2)
            .unwrap();
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }
}
