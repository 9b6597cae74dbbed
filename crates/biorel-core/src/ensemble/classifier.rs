use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::error::Result;

/// Two-layer yes/no head: `Linear(d -> d/2) -> ReLU -> Linear(d/2 -> 2)`,
/// both layers without bias.
///
/// A frozen classifier still produces logits, but from detached weights, so
/// no gradient reaches its variables and the optimizer leaves them alone.
#[derive(Debug, Clone)]
pub struct BinaryClassifier {
    fc1: Linear,
    fc2: Linear,
    requires_grad: bool,
}

impl BinaryClassifier {
    pub fn new(input_dim: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = (input_dim / 2).max(1);
        Ok(Self {
            fc1: candle_nn::linear_no_bias(input_dim, hidden, vb.pp("fc1"))?,
            fc2: candle_nn::linear_no_bias(hidden, 2, vb.pp("fc2"))?,
            requires_grad: true,
        })
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// `[..., d]` to `[..., 2]` logits, index 0 = no, 1 = yes.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        if self.requires_grad {
            let hidden = self.fc1.forward(xs)?.relu()?;
            return Ok(self.fc2.forward(&hidden)?);
        }
        let fc1 = Linear::new(self.fc1.weight().detach(), None);
        let fc2 = Linear::new(self.fc2.weight().detach(), None);
        let hidden = fc1.forward(xs)?.relu()?;
        Ok(fc2.forward(&hidden)?)
    }
}
