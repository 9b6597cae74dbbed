//! Training configuration.
//!
//! Loaded from a JSON file; every field has a default so a config file only
//! needs to name what it changes. [`TrainingConfig::validate`] runs once
//! before anything is built and rejects inconsistent settings.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use biorel_core::encoder::lite::DEFAULT_MAX_POSITIONS;
use biorel_core::{LossPolicy, RepresentationMode, Task};
use serde::{Deserialize, Serialize};

use crate::error::TrainerError;

/// How batches are scheduled within an epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrainingMode {
    /// One shuffled stream of batches from all corpora.
    #[default]
    Flat,
    /// Batches bucketed by corpus and split into groups, with classifier
    /// gating per corpus turn.
    Continual,
}

impl fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingMode::Flat => f.write_str("flat"),
            TrainingMode::Continual => f.write_str("continual"),
        }
    }
}

impl FromStr for TrainingMode {
    type Err = TrainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flat" => Ok(TrainingMode::Flat),
            "continual" => Ok(TrainingMode::Continual),
            other => Err(TrainerError::invalid(format!("unknown training mode {other:?}"))),
        }
    }
}

/// Learning-rate bounds of one optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LrBounds {
    pub max: f64,
    pub min: f64,
}

impl LrBounds {
    pub fn new(max: f64, min: f64) -> Self {
        Self { max, min }
    }
}

/// Which contextual encoder to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EncoderSettings {
    /// Small trainable encoder; `vocab_size` is the base vocabulary before
    /// marker tokens are appended.
    Lite {
        vocab_size: usize,
        hidden_size: usize,
        max_positions: usize,
        pad_id: u32,
    },
    /// Pretrained DistilBERT checkpoint directory.
    DistilBert { model_dir: PathBuf },
}

impl Default for EncoderSettings {
    fn default() -> Self {
        EncoderSettings::Lite {
            vocab_size: 30_522,
            hidden_size: 128,
            max_positions: DEFAULT_MAX_POSITIONS,
            pad_id: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub train_file: PathBuf,
    pub valid_file: PathBuf,
    pub test_file: Option<PathBuf>,
    /// Corpus catalog (id prefixes and label vocabularies).
    pub catalog_file: PathBuf,
    /// Corpora to train on, in turn order.
    pub corpora: Vec<String>,
    /// Jointly trained tasks. The last one drives early stopping.
    pub tasks: Vec<Task>,
    /// Loss weight per task; must sum to 1 over `tasks`.
    pub task_weights: BTreeMap<Task, f32>,
    pub representation: RepresentationMode,
    pub loss_policy: LossPolicy,
    /// `[no, yes]` class weights.
    pub class_weights: [f32; 2],
    pub encoder: EncoderSettings,
    pub encoder_lr: LrBounds,
    pub task_lr: BTreeMap<Task, LrBounds>,
    pub warmup_epochs: usize,
    /// Linear decay from `max` to `min` after warm-up, over this many epochs.
    /// Without it the rate stays at `max`.
    pub decay_epochs: Option<usize>,
    pub weight_decay: f64,
    pub batch_size: usize,
    pub mode: TrainingMode,
    pub group_num: usize,
    /// Probability of freezing out-of-corpus classifiers for a corpus turn.
    pub random_ratio: f64,
    pub patience: usize,
    pub max_epochs: usize,
    /// First epoch that is evaluated.
    pub min_eval_epoch: usize,
    pub ema_decay: f64,
    pub seed: u64,
    pub average_runs: usize,
    /// Checkpoints are written here on every improvement.
    pub output_dir: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            train_file: PathBuf::from("data/train.jsonl"),
            valid_file: PathBuf::from("data/valid.jsonl"),
            test_file: None,
            catalog_file: PathBuf::from("data/corpora.json"),
            corpora: vec![
                "DDI".to_string(),
                "CPR".to_string(),
                "Twi_ADE".to_string(),
                "ADE".to_string(),
            ],
            tasks: vec![Task::EntityType, Task::Relation],
            task_weights: [(Task::EntityType, 0.4), (Task::Relation, 0.6)]
                .into_iter()
                .collect(),
            representation: RepresentationMode::Marker,
            loss_policy: LossPolicy::BinaryCrossEntropy,
            class_weights: [0.5, 5.0],
            encoder: EncoderSettings::default(),
            encoder_lr: LrBounds::new(1e-5, 1e-6),
            task_lr: [
                (Task::EntityType, LrBounds::new(2e-5, 2e-6)),
                (Task::Relation, LrBounds::new(1e-4, 5e-6)),
            ]
            .into_iter()
            .collect(),
            warmup_epochs: 3,
            decay_epochs: None,
            weight_decay: 1e-2,
            batch_size: 8,
            mode: TrainingMode::Flat,
            group_num: 40,
            random_ratio: 1.0,
            patience: 20,
            max_epochs: 100,
            min_eval_epoch: 0,
            ema_decay: 0.999,
            seed: 1234,
            average_runs: 1,
            output_dir: None,
        }
    }
}

impl TrainingConfig {
    /// Reads a JSON config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)
            .map_err(|e| TrainerError::invalid(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    /// Weight of a task's loss.
    pub fn task_weight(&self, task: Task) -> f32 {
        self.task_weights.get(&task).copied().unwrap_or(0.0)
    }

    /// The task whose validation F1 drives early stopping.
    pub fn early_stop_task(&self) -> Task {
        self.tasks.last().copied().unwrap_or(Task::Relation)
    }

    /// Checks every cross-field constraint.
    pub fn validate(&self) -> Result<(), TrainerError> {
        if !self.tasks.contains(&Task::Relation) {
            return Err(TrainerError::invalid("the relation task is required"));
        }
        for (i, task) in self.tasks.iter().enumerate() {
            if self.tasks[..i].contains(task) {
                return Err(TrainerError::invalid(format!("task {task} listed twice")));
            }
        }

        let mut weight_sum = 0.0f32;
        for task in &self.tasks {
            let weight = self
                .task_weights
                .get(task)
                .copied()
                .ok_or_else(|| TrainerError::invalid(format!("no loss weight for task {task}")))?;
            if weight < 0.0 {
                return Err(TrainerError::invalid(format!("negative weight for task {task}")));
            }
            weight_sum += weight;

            let bounds = self
                .task_lr
                .get(task)
                .ok_or_else(|| TrainerError::invalid(format!("no learning rate for task {task}")))?;
            check_lr(&format!("task {task}"), bounds)?;
        }
        if (weight_sum - 1.0).abs() > 1e-4 {
            return Err(TrainerError::invalid(format!(
                "task weights must sum to 1, got {weight_sum}"
            )));
        }
        check_lr("encoder", &self.encoder_lr)?;

        if self.corpora.is_empty() {
            return Err(TrainerError::invalid("no corpora configured"));
        }
        if self.batch_size == 0 {
            return Err(TrainerError::invalid("batch_size must be at least 1"));
        }
        if self.group_num == 0 {
            return Err(TrainerError::invalid("group_num must be at least 1"));
        }
        if self.max_epochs == 0 {
            return Err(TrainerError::invalid("max_epochs must be at least 1"));
        }
        if self.min_eval_epoch > self.max_epochs {
            return Err(TrainerError::invalid(format!(
                "min_eval_epoch {} is past max_epochs {}",
                self.min_eval_epoch, self.max_epochs
            )));
        }
        if self.test_file.is_some() && self.output_dir.is_none() {
            return Err(TrainerError::invalid(
                "test_file needs an output_dir to hold the best checkpoint",
            ));
        }
        if self.patience == 0 {
            return Err(TrainerError::invalid("patience must be at least 1"));
        }
        if self.average_runs == 0 {
            return Err(TrainerError::invalid("average_runs must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.random_ratio) {
            return Err(TrainerError::invalid("random_ratio must lie in [0, 1]"));
        }
        if !(0.0..1.0).contains(&self.ema_decay) {
            return Err(TrainerError::invalid("ema_decay must lie in [0, 1)"));
        }
        if self.class_weights.iter().any(|w| *w <= 0.0) {
            return Err(TrainerError::invalid("class weights must be positive"));
        }
        if let EncoderSettings::Lite {
            hidden_size,
            max_positions,
            ..
        } = &self.encoder
        {
            if *hidden_size < 2 || *max_positions == 0 {
                return Err(TrainerError::invalid("lite encoder dimensions are too small"));
            }
        }
        Ok(())
    }
}

fn check_lr(what: &str, bounds: &LrBounds) -> Result<(), TrainerError> {
    if bounds.max <= 0.0 || bounds.min < 0.0 || bounds.min > bounds.max {
        return Err(TrainerError::invalid(format!(
            "{what} learning rate bounds must satisfy 0 <= min <= max, 0 < max"
        )));
    }
    Ok(())
}
