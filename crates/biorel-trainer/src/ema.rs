//! Exponential moving average of model parameters.
//!
//! Validation and test passes run on the averaged weights: [`Ema::apply`]
//! swaps them in and [`Ema::restore`] puts the trained weights back.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::TrainerError;
use crate::model::NamedVar;

pub struct Ema {
    decay: f64,
    shadow: BTreeMap<String, Tensor>,
    backup: BTreeMap<String, Tensor>,
}

impl Ema {
    pub fn new(decay: f64) -> Self {
        Self {
            decay,
            shadow: BTreeMap::new(),
            backup: BTreeMap::new(),
        }
    }

    /// Starts the average from the current parameter values.
    pub fn register(&mut self, params: &[NamedVar]) -> Result<(), TrainerError> {
        self.shadow.clear();
        for param in params {
            self.shadow
                .insert(param.name.clone(), param.var.as_tensor().detach().copy()?);
        }
        Ok(())
    }

    /// `shadow = decay * shadow + (1 - decay) * param` for every trainable
    /// parameter. Frozen parameters keep their average.
    pub fn update(&mut self, params: &[NamedVar]) -> Result<(), TrainerError> {
        for param in params.iter().filter(|p| !p.frozen) {
            let current = param.var.as_tensor().detach();
            let averaged = match self.shadow.get(&param.name) {
                Some(shadow) => {
                    (shadow.affine(self.decay, 0.0)? + current.affine(1.0 - self.decay, 0.0)?)?
                }
                None => current.copy()?,
            };
            self.shadow.insert(param.name.clone(), averaged);
        }
        Ok(())
    }

    /// Loads the averaged values into the parameters, keeping a backup.
    pub fn apply(&mut self, params: &[NamedVar]) -> Result<(), TrainerError> {
        self.backup.clear();
        for param in params {
            let Some(shadow) = self.shadow.get(&param.name) else {
                continue;
            };
            self.backup
                .insert(param.name.clone(), param.var.as_tensor().detach().copy()?);
            param.var.set(shadow)?;
        }
        Ok(())
    }

    /// Puts back the values saved by the last [`Ema::apply`].
    pub fn restore(&mut self, params: &[NamedVar]) -> Result<(), TrainerError> {
        for param in params {
            if let Some(saved) = self.backup.remove(&param.name) {
                param.var.set(&saved)?;
            }
        }
        Ok(())
    }

    pub fn shadow(&self) -> &BTreeMap<String, Tensor> {
        &self.shadow
    }

    /// Replaces the averages, e.g. with values read from a checkpoint.
    pub fn load_shadow(&mut self, shadow: BTreeMap<String, Tensor>) {
        self.shadow = shadow;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn param(name: &str, values: &[f32], frozen: bool) -> NamedVar {
        NamedVar {
            name: name.to_string(),
            var: Var::new(values, &Device::Cpu).unwrap(),
            frozen,
        }
    }

    fn values(p: &NamedVar) -> Vec<f32> {
        p.var.as_tensor().to_vec1().unwrap()
    }

    #[test]
    fn update_moves_toward_params() {
        let params = vec![param("shared.w", &[0.0, 2.0], false)];
        let mut ema = Ema::new(0.5);
        ema.register(&params).unwrap();

        params[0].var.set(&Tensor::new(&[4.0f32, 2.0], &Device::Cpu).unwrap()).unwrap();
        ema.update(&params).unwrap();
        let shadow: Vec<f32> = ema.shadow()["shared.w"].to_vec1().unwrap();
        assert_eq!(shadow, vec![2.0, 2.0]);
    }

    #[test]
    fn frozen_params_keep_their_average() {
        let params = vec![param("relation.relation_a.fc1.weight", &[1.0], true)];
        let mut ema = Ema::new(0.9);
        ema.register(&params).unwrap();
        params[0].var.set(&Tensor::new(&[5.0f32], &Device::Cpu).unwrap()).unwrap();
        ema.update(&params).unwrap();
        let shadow: Vec<f32> = ema.shadow()["relation.relation_a.fc1.weight"].to_vec1().unwrap();
        assert_eq!(shadow, vec![1.0]);
    }

    #[test]
    fn apply_then_restore_is_exact() {
        let params = vec![
            param("shared.a", &[0.1, 0.2, 0.3], false),
            param("shared.b", &[-1.5], false),
        ];
        let mut ema = Ema::new(0.999);
        ema.register(&params).unwrap();
        params[0].var.set(&Tensor::new(&[0.7f32, 0.11, 0.123_456_7], &Device::Cpu).unwrap()).unwrap();
        ema.update(&params).unwrap();
        let trained: Vec<Vec<f32>> = params.iter().map(values).collect();

        ema.apply(&params).unwrap();
        assert_ne!(values(&params[0]), trained[0]);
        ema.restore(&params).unwrap();

        let restored: Vec<Vec<f32>> = params.iter().map(values).collect();
        assert_eq!(restored, trained);
    }
}
