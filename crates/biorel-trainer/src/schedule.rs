//! Learning-rate schedules.

use crate::config::LrBounds;

/// Linear warm-up to `max`, then either constant or a linear decay to
/// `min`.
#[derive(Debug, Clone, PartialEq)]
pub struct LrSchedule {
    bounds: LrBounds,
    warmup_steps: usize,
    decay_steps: Option<usize>,
    step: usize,
}

impl LrSchedule {
    pub fn new(bounds: LrBounds, warmup_steps: usize, decay_steps: Option<usize>) -> Self {
        Self {
            bounds,
            warmup_steps,
            decay_steps,
            step: 0,
        }
    }

    /// Builds a schedule whose phases are measured in epochs.
    pub fn per_epoch(
        bounds: LrBounds,
        steps_per_epoch: usize,
        warmup_epochs: usize,
        decay_epochs: Option<usize>,
    ) -> Self {
        Self::new(
            bounds,
            warmup_epochs * steps_per_epoch,
            decay_epochs.map(|epochs| epochs * steps_per_epoch),
        )
    }

    /// Rate for the current step.
    pub fn lr(&self) -> f64 {
        let LrBounds { max, min } = self.bounds;
        if self.step < self.warmup_steps {
            return max * self.step as f64 / self.warmup_steps as f64;
        }
        match self.decay_steps {
            Some(decay) if decay > 0 => {
                let progress = ((self.step - self.warmup_steps) as f64 / decay as f64).min(1.0);
                max - (max - min) * progress
            }
            _ => max,
        }
    }

    /// Moves to the next step and returns its rate.
    pub fn advance(&mut self) -> f64 {
        self.step += 1;
        self.lr()
    }

    pub fn step(&self) -> usize {
        self.step
    }
}
