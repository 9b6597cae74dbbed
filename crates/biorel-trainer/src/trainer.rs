//! The training scheduler.
//!
//! One epoch walks a plan of turns (see [`crate::curriculum`]). Every step
//! runs the joint model on a batch, sums the task losses with their
//! weights, backpropagates once, then steps the encoder optimizer followed
//! by each task optimizer and folds the new weights into the moving
//! average. In continual mode a corpus turn may first freeze every
//! classifier the corpus does not annotate; the freeze is always lifted when
//! the turn ends.
//!
//! Validation runs on the averaged weights. The last configured task's F1
//! drives early stopping.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use biorel_core::{Sentence, Span, SpanPair, Task};
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use oorandom::Rand32;

use crate::checkpoint;
use crate::config::{TrainingConfig, TrainingMode};
use crate::curriculum::{Curriculum, Turn, flat_plan};
use crate::data::{CorpusCatalog, Dataset};
use crate::ema::Ema;
use crate::error::TrainerError;
use crate::model::JointModel;
use crate::schedule::LrSchedule;
use crate::scorer::{MicroF1Scorer, Scorer, SubTaskResults, TaskScore};

/// Directory under `output_dir` holding the best checkpoint.
pub const BEST_CHECKPOINT: &str = "best";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    RunningEpoch(usize),
    EpochComplete(usize),
    Stopped(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Validation F1 did not improve for `patience` evaluations.
    EarlyStop,
    MaxEpochs,
}

/// Mean training loss of one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub steps: usize,
    pub losses: BTreeMap<Task, f32>,
    /// Mean of the per-task losses.
    pub average_loss: f32,
}

/// Scores of one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub scores: BTreeMap<Task, TaskScore>,
}

impl Evaluation {
    pub fn f1(&self, task: Task) -> f64 {
        self.scores.get(&task).map_or(0.0, |s| s.micro.f1())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    pub stop: StopReason,
    pub best_epoch: Option<usize>,
    pub best: Option<Evaluation>,
}

/// What an early-stopping observation concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Improved,
    Waiting,
    Stop,
}

/// Patience counter over validation F1. A score equal to the best so far
/// counts as an improvement.
#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStopping {
    patience: usize,
    left: usize,
    best_f1: f64,
    best_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            left: patience,
            best_f1: 0.0,
            best_epoch: None,
        }
    }

    pub fn observe(&mut self, epoch: usize, f1: f64) -> Verdict {
        let verdict = if f1 >= self.best_f1 {
            self.best_f1 = f1;
            self.best_epoch = Some(epoch);
            self.left = self.patience;
            Verdict::Improved
        } else {
            self.left = self.left.saturating_sub(1);
            Verdict::Waiting
        };
        if self.left == 0 { Verdict::Stop } else { verdict }
    }

    pub fn best_f1(&self) -> f64 {
        self.best_f1
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

struct OptimizerSlot {
    optimizer: AdamW,
    schedule: LrSchedule,
}

impl OptimizerSlot {
    fn new(
        vars: Vec<Var>,
        schedule: LrSchedule,
        weight_decay: f64,
    ) -> Result<Self, TrainerError> {
        let optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: schedule.lr(),
                weight_decay,
                ..ParamsAdamW::default()
            },
        )?;
        Ok(Self {
            optimizer,
            schedule,
        })
    }

    fn step(&mut self, grads: &candle_core::backprop::GradStore) -> Result<(), TrainerError> {
        let lr = self.schedule.advance();
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(grads)?;
        Ok(())
    }
}

pub struct TrainingScheduler {
    config: TrainingConfig,
    catalog: CorpusCatalog,
    model: JointModel,
    encoder_slot: OptimizerSlot,
    task_slots: BTreeMap<Task, OptimizerSlot>,
    ema: Ema,
    rng: Rand32,
    state: SchedulerState,
    early_stopping: EarlyStopping,
    epochs_run: usize,
}

impl TrainingScheduler {
    /// Sets up one optimizer per parameter group. `train_len` sizes the
    /// learning-rate schedules.
    pub fn new(
        config: TrainingConfig,
        catalog: CorpusCatalog,
        model: JointModel,
        train_len: usize,
    ) -> Result<Self, TrainerError> {
        let steps_per_epoch = train_len.div_ceil(config.batch_size.max(1));
        let schedule = |bounds| {
            LrSchedule::per_epoch(
                bounds,
                steps_per_epoch,
                config.warmup_epochs,
                config.decay_epochs,
            )
        };

        let encoder_slot = OptimizerSlot::new(
            model.shared_vars().all_vars(),
            schedule(config.encoder_lr),
            config.weight_decay,
        )?;
        let mut task_slots = BTreeMap::new();
        for task in model.tasks() {
            let bounds = config
                .task_lr
                .get(&task)
                .copied()
                .ok_or_else(|| TrainerError::invalid(format!("no learning rate for task {task}")))?;
            let vars = model
                .task_vars(task)
                .map(|vars| vars.all_vars())
                .unwrap_or_default();
            task_slots.insert(
                task,
                OptimizerSlot::new(vars, schedule(bounds), config.weight_decay)?,
            );
        }

        let mut ema = Ema::new(config.ema_decay);
        ema.register(&model.parameters()?)?;

        Ok(Self {
            rng: Rand32::new(config.seed),
            early_stopping: EarlyStopping::new(config.patience),
            config,
            catalog,
            model,
            encoder_slot,
            task_slots,
            ema,
            state: SchedulerState::Idle,
            epochs_run: 0,
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn model(&self) -> &JointModel {
        &self.model
    }

    /// Trains until early stopping or `max_epochs`, validating after every
    /// epoch from `min_eval_epoch` on.
    pub fn fit(&mut self, train: &Dataset, valid: &Dataset) -> Result<TrainingSummary, TrainerError> {
        let stop_task = self.config.early_stop_task();
        let mut best: Option<Evaluation> = None;
        let mut stop = StopReason::MaxEpochs;

        for epoch in 1..=self.config.max_epochs {
            let report = self.train_epoch(epoch, train)?;
            tracing::info!(
                epoch,
                steps = report.steps,
                loss = report.average_loss,
                "epoch complete"
            );
            for (task, loss) in &report.losses {
                tracing::debug!(epoch, task = %task, loss, "task loss");
            }
            if epoch < self.config.min_eval_epoch {
                continue;
            }

            let evaluation = self.evaluate(valid)?;
            log_evaluation("valid", &evaluation);
            let verdict = self.early_stopping.observe(epoch, evaluation.f1(stop_task));
            if self.early_stopping.best_epoch() == Some(epoch) {
                tracing::info!(epoch, f1 = self.early_stopping.best_f1(), "new best {stop_task} F1");
                if let Some(dir) = &self.config.output_dir {
                    checkpoint::save(
                        dir.join(BEST_CHECKPOINT),
                        epoch,
                        self.config.representation,
                        &self.model,
                        &self.ema,
                    )?;
                }
                best = Some(evaluation);
            }
            if verdict == Verdict::Stop {
                tracing::info!(epoch, "early stopping");
                stop = StopReason::EarlyStop;
                break;
            }
        }

        self.state = SchedulerState::Stopped(stop);
        Ok(TrainingSummary {
            epochs_run: self.epochs_run,
            stop,
            best_epoch: self.early_stopping.best_epoch(),
            best,
        })
    }

    /// Runs one epoch over `train`.
    pub fn train_epoch(&mut self, epoch: usize, train: &Dataset) -> Result<EpochReport, TrainerError> {
        if let SchedulerState::Stopped(_) = self.state {
            return Err(TrainerError::invalid("training has already stopped"));
        }
        self.state = SchedulerState::RunningEpoch(epoch);

        let batches = train.batches(self.config.batch_size, Some(&mut self.rng));
        let turns = match self.config.mode {
            TrainingMode::Flat => flat_plan(batches),
            TrainingMode::Continual => {
                Curriculum::build(batches, train, &self.config.corpora, self.config.group_num)
                    .into_turns()
            }
        };

        let mut sums: BTreeMap<Task, f32> = BTreeMap::new();
        let mut steps = 0;
        for turn in &turns {
            let frozen = self.gate(turn)?;
            let result = self.run_turn(train, turn, &mut sums, &mut steps);
            self.model.unfreeze(&frozen)?;
            result?;
        }

        self.epochs_run += 1;
        self.state = SchedulerState::EpochComplete(epoch);

        let losses: BTreeMap<Task, f32> = self
            .config
            .tasks
            .iter()
            .map(|task| {
                let sum = sums.get(task).copied().unwrap_or(0.0);
                (*task, if steps > 0 { sum / steps as f32 } else { 0.0 })
            })
            .collect();
        let average_loss = losses.values().sum::<f32>() / losses.len().max(1) as f32;
        Ok(EpochReport {
            epoch,
            steps,
            losses,
            average_loss,
        })
    }

    /// Freezes the classifiers a corpus turn does not annotate, with
    /// probability `random_ratio`. Returns what was frozen.
    fn gate(&mut self, turn: &Turn) -> Result<Vec<String>, TrainerError> {
        let Some(corpus) = &turn.corpus else {
            return Ok(Vec::new());
        };
        if (self.rng.rand_float() as f64) >= self.config.random_ratio {
            return Ok(Vec::new());
        }
        let keep: BTreeSet<String> = self
            .model
            .tasks()
            .flat_map(|task| self.catalog.sub_tasks_of(corpus, task))
            .collect();
        let frozen = self.model.freeze_except(&keep)?;
        tracing::trace!(corpus = %corpus, frozen = frozen.len(), "gated classifiers");
        Ok(frozen)
    }

    fn run_turn(
        &mut self,
        train: &Dataset,
        turn: &Turn,
        sums: &mut BTreeMap<Task, f32>,
        steps: &mut usize,
    ) -> Result<(), TrainerError> {
        for indices in &turn.batches {
            let batch = train.batch(indices);
            for (task, loss) in self.step(&batch)? {
                *sums.entry(task).or_default() += loss;
            }
            *steps += 1;
        }
        Ok(())
    }

    /// One optimization step. Returns the unweighted loss of every task the
    /// batch supervised.
    pub fn step(&mut self, batch: &[Sentence]) -> Result<BTreeMap<Task, f32>, TrainerError> {
        let output = self.model.forward(batch)?;

        let mut losses = BTreeMap::new();
        let mut total: Option<Tensor> = None;
        for &task in &self.config.tasks {
            let Some(loss) = output.loss(task) else {
                continue;
            };
            losses.insert(task, loss.to_scalar::<f32>()?);
            let weighted = loss.affine(f64::from(self.config.task_weight(task)), 0.0)?;
            total = Some(match total {
                Some(sum) => (sum + weighted)?,
                None => weighted,
            });
        }
        let Some(total) = total else {
            return Ok(losses);
        };

        let grads = total.backward()?;
        self.encoder_slot.step(&grads)?;
        for slot in self.task_slots.values_mut() {
            slot.step(&grads)?;
        }
        self.ema.update(&self.model.parameters()?)?;
        Ok(losses)
    }

    /// Scores `dataset` with the averaged weights swapped in.
    pub fn evaluate(&mut self, dataset: &Dataset) -> Result<Evaluation, TrainerError> {
        let params = self.model.parameters()?;
        let result = self
            .ema
            .apply(&params)
            .and_then(|()| self.score(dataset));
        self.ema.restore(&params)?;
        result
    }

    /// Restores a checkpoint and scores `dataset` once.
    pub fn test<P: AsRef<Path>>(
        &mut self,
        checkpoint_dir: P,
        dataset: &Dataset,
    ) -> Result<Evaluation, TrainerError> {
        checkpoint::load(
            checkpoint_dir,
            self.config.representation,
            &self.model,
            &mut self.ema,
        )?;
        self.evaluate(dataset)
    }

    fn score(&self, dataset: &Dataset) -> Result<Evaluation, TrainerError> {
        let mut relations: Vec<SubTaskResults<SpanPair>> = Vec::with_capacity(dataset.len());
        let mut entities: Vec<SubTaskResults<Span>> = Vec::new();
        for indices in dataset.batches(self.config.batch_size, None) {
            let output = self.model.forward(&dataset.batch(&indices))?;
            relations.extend(output.relation.results);
            if let Some(entity_type) = output.entity_type {
                entities.extend(entity_type.results);
            }
        }

        let mut scores = BTreeMap::new();
        scores.insert(Task::Relation, MicroF1Scorer.score(&relations));
        if self.model.ensemble(Task::EntityType).is_some() {
            scores.insert(Task::EntityType, MicroF1Scorer.score(&entities));
        }
        Ok(Evaluation { scores })
    }
}

/// Logs micro scores per task and per sub-task.
pub fn log_evaluation(split: &str, evaluation: &Evaluation) {
    for (task, score) in &evaluation.scores {
        tracing::info!(
            split,
            task = %task,
            precision = score.micro.precision(),
            recall = score.micro.recall(),
            f1 = score.micro.f1(),
            "evaluation"
        );
        for (sub_task, prf) in &score.per_sub_task {
            tracing::debug!(
                split,
                sub_task = %sub_task,
                tp = prf.true_positives,
                fp = prf.false_positives,
                fn_ = prf.false_negatives,
                f1 = prf.f1(),
                "sub-task score"
            );
        }
    }
}
