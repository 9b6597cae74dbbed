//! # Binary Classifier Ensembles
//!
//! One [`BinaryClassifier`] per sub-task, applied to every candidate
//! vector, with a fusion rule that turns the independent yes/no decisions
//! into a single label per candidate.
//!
//! ## Fusion
//!
//! For each candidate and each sub-task, the score is the classifier's
//! maximum logit if its arg-max is "yes" and [`MASK_SCORE`] otherwise. An
//! extra "no label" slot scored [`NO_LABEL_SCORE`] is appended after the
//! last sub-task. The fused decision is the first index holding the highest
//! score, so a candidate no classifier claims falls through to the "no
//! label" slot, and ties go to the sub-task that comes first in ensemble
//! order.

pub mod classifier;
pub mod loss;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::error::{BiorelError, Result};
use crate::types::Task;

pub use classifier::BinaryClassifier;
pub use loss::{LossPolicy, binary_cross_entropy, cross_entropy};

/// Score of a sub-task whose classifier says "no".
pub const MASK_SCORE: f32 = -999.0;
/// Score of the trailing "no label" slot.
pub const NO_LABEL_SCORE: f32 = -998.0;

/// Ensemble construction parameters.
#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    pub task: Task,
    /// Bare labels, in ensemble order.
    pub labels: Vec<String>,
    pub input_dim: usize,
    pub loss_policy: LossPolicy,
    /// `[no, yes]` weights. Cross-entropy uses them as class weights,
    /// binary cross-entropy as positive weights.
    pub class_weights: [f32; 2],
}

impl EnsembleConfig {
    pub fn new(task: Task, labels: Vec<String>, input_dim: usize) -> Self {
        Self {
            task,
            labels,
            input_dim,
            loss_policy: LossPolicy::default(),
            class_weights: [1.0, 1.0],
        }
    }

    pub fn with_loss_policy(mut self, loss_policy: LossPolicy) -> Self {
        self.loss_policy = loss_policy;
        self
    }

    pub fn with_class_weights(mut self, class_weights: [f32; 2]) -> Self {
        self.class_weights = class_weights;
        self
    }
}

/// Logits and fused decisions for one batch.
#[derive(Debug, Clone)]
pub struct EnsembleOutput {
    /// Fused decision per `[sentence][candidate]` over the padded width.
    /// Values `0..n` name a sub-task, `n` means no label.
    pub fused: Vec<Vec<usize>>,
    /// `[batch, width, 2]` logits per sub-task, in ensemble order.
    pub logits: Vec<Tensor>,
}

/// A set of binary classifiers over one task's sub-tasks.
pub struct EnsembleClassifier {
    task: Task,
    sub_tasks: Vec<String>,
    classifiers: HashMap<String, BinaryClassifier>,
    loss_policy: LossPolicy,
    class_weights: [f32; 2],
}

impl EnsembleClassifier {
    /// Builds one classifier per label under `vb.pp(sub_task)`.
    pub fn new(config: EnsembleConfig, vb: VarBuilder) -> Result<Self> {
        if config.labels.is_empty() {
            return Err(BiorelError::Config(format!(
                "{} ensemble needs at least one label",
                config.task
            )));
        }
        let sub_tasks: Vec<String> = config
            .labels
            .iter()
            .map(|label| config.task.sub_task(label))
            .collect();
        let unique: BTreeSet<&String> = sub_tasks.iter().collect();
        if unique.len() != sub_tasks.len() {
            return Err(BiorelError::Config(format!(
                "duplicate labels in {} ensemble",
                config.task
            )));
        }

        let mut classifiers = HashMap::with_capacity(sub_tasks.len());
        for sub_task in &sub_tasks {
            let classifier = BinaryClassifier::new(config.input_dim, vb.pp(sub_task))?;
            classifiers.insert(sub_task.clone(), classifier);
        }

        Ok(Self {
            task: config.task,
            sub_tasks,
            classifiers,
            loss_policy: config.loss_policy,
            class_weights: config.class_weights,
        })
    }

    pub fn task(&self) -> Task {
        self.task
    }

    /// Sub-task identifiers in ensemble order.
    pub fn sub_tasks(&self) -> &[String] {
        &self.sub_tasks
    }

    /// Fused index meaning "no label".
    pub fn no_label_index(&self) -> usize {
        self.sub_tasks.len()
    }

    pub fn loss_policy(&self) -> LossPolicy {
        self.loss_policy
    }

    pub fn classifier(&self, sub_task: &str) -> Result<&BinaryClassifier> {
        self.classifiers
            .get(sub_task)
            .ok_or_else(|| BiorelError::UnknownSubTask(sub_task.to_string()))
    }

    pub fn set_requires_grad(&mut self, sub_task: &str, requires_grad: bool) -> Result<()> {
        self.classifiers
            .get_mut(sub_task)
            .ok_or_else(|| BiorelError::UnknownSubTask(sub_task.to_string()))?
            .set_requires_grad(requires_grad);
        Ok(())
    }

    /// Sub-tasks whose classifiers are currently frozen.
    pub fn frozen(&self) -> Vec<&str> {
        self.sub_tasks
            .iter()
            .filter(|id| self.classifiers.get(*id).is_some_and(|c| !c.requires_grad()))
            .map(String::as_str)
            .collect()
    }

    /// Runs every classifier over `vectors` (`[batch, width, d]`) and fuses.
    pub fn decide(&self, vectors: &Tensor) -> Result<EnsembleOutput> {
        let logits = self
            .sub_tasks
            .iter()
            .map(|id| self.classifier(id)?.forward(vectors))
            .collect::<Result<Vec<_>>>()?;
        let fused = fuse(&logits)?;
        Ok(EnsembleOutput { fused, logits })
    }

    /// Mean loss over sub-tasks. `labels` is `[n_sub_tasks, batch, width]`.
    pub fn loss(&self, logits: &[Tensor], labels: &Tensor) -> Result<Tensor> {
        let n_sub = labels.dim(0)?;
        if n_sub != logits.len() || n_sub != self.sub_tasks.len() {
            return Err(BiorelError::AlignmentMismatch {
                sentence: 0,
                candidates: logits.len(),
                rows: n_sub,
            });
        }

        let mut losses = Vec::with_capacity(n_sub);
        for (t, sub_logits) in logits.iter().enumerate() {
            let sub_labels = labels.get(t)?;
            let loss = match self.loss_policy {
                LossPolicy::CrossEntropy => {
                    cross_entropy(sub_logits, &sub_labels, &self.class_weights)?
                }
                LossPolicy::BinaryCrossEntropy => {
                    binary_cross_entropy(sub_logits, &sub_labels, &self.class_weights)?
                }
            };
            losses.push(loss);
        }
        Ok(Tensor::stack(&losses, 0)?.mean_all()?)
    }

    /// Collects predicted items per sub-task from fused decisions.
    ///
    /// Only the first `candidates[s].len()` positions of each row are real;
    /// padding and placeholder positions are skipped.
    pub fn predicted_sets<K: Ord + Clone>(
        &self,
        fused: &[Vec<usize>],
        candidates: &[Vec<K>],
    ) -> Vec<BTreeMap<String, Vec<K>>> {
        fused
            .iter()
            .zip(candidates)
            .map(|(row, sentence_candidates)| {
                let mut sets: BTreeMap<String, Vec<K>> = self
                    .sub_tasks
                    .iter()
                    .map(|id| (id.clone(), Vec::new()))
                    .collect();
                for (decision, candidate) in row.iter().zip(sentence_candidates) {
                    if let Some(id) = self.sub_tasks.get(*decision) {
                        if let Some(items) = sets.get_mut(id) {
                            items.push(candidate.clone());
                        }
                    }
                }
                sets
            })
            .collect()
    }
}

/// Fuses per-sub-task logits into one decision per candidate.
pub fn fuse(logits: &[Tensor]) -> Result<Vec<Vec<usize>>> {
    let per_sub_task = logits
        .iter()
        .map(|l| l.to_vec3::<f32>())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let Some(first) = per_sub_task.first() else {
        return Ok(Vec::new());
    };

    let no_label = per_sub_task.len();
    let mut fused = Vec::with_capacity(first.len());
    for b in 0..first.len() {
        let mut row = Vec::with_capacity(first[b].len());
        for p in 0..first[b].len() {
            let mut best = no_label;
            let mut best_score = NO_LABEL_SCORE;
            for (t, sub_task) in per_sub_task.iter().enumerate() {
                let score = sub_task_score(&sub_task[b][p]);
                if score > best_score || (score == best_score && t < best) {
                    best = t;
                    best_score = score;
                }
            }
            row.push(best);
        }
        fused.push(row);
    }
    Ok(fused)
}

/// Max logit when the arg-max is "yes", [`MASK_SCORE`] otherwise.
///
/// Equal logits resolve to "no".
fn sub_task_score(pair_logits: &[f32]) -> f32 {
    match pair_logits {
        [no, yes] if yes > no => *yes,
        _ => MASK_SCORE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gold::{IGNORE_INDEX, NO, YES};
    use crate::types::{Span, SpanPair};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn logits(rows: &[[f32; 2]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (1, rows.len(), 2), &Device::Cpu).unwrap()
    }

    fn ensemble(labels: &[&str]) -> (VarMap, EnsembleClassifier) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = EnsembleConfig::new(
            Task::Relation,
            labels.iter().map(|l| l.to_string()).collect(),
            8,
        );
        let ensemble = EnsembleClassifier::new(config, vb).unwrap();
        (varmap, ensemble)
    }

    #[test]
    fn test_fusion_picks_highest_yes() {
        // candidate 0: both say yes, sub-task 1 more confidently
        // candidate 1: only sub-task 0 says yes
        // candidate 2: nobody says yes
        let a = logits(&[[0.0, 1.0], [0.0, 2.0], [1.0, 0.0]]);
        let b = logits(&[[0.0, 3.0], [5.0, 0.0], [1.0, 1.0]]);
        let fused = fuse(&[a, b]).unwrap();
        assert_eq!(fused, vec![vec![1, 0, 2]]);
    }

    #[test]
    fn test_fusion_ties_go_to_first_sub_task() {
        let a = logits(&[[0.0, 2.5]]);
        let b = logits(&[[0.0, 2.5]]);
        let c = logits(&[[0.0, 2.5]]);
        assert_eq!(fuse(&[a, b, c]).unwrap(), vec![vec![0]]);
    }

    #[test]
    fn test_fusion_equal_logits_mean_no() {
        assert_eq!(sub_task_score(&[0.3, 0.3]), MASK_SCORE);
        assert_eq!(sub_task_score(&[0.3, 0.4]), 0.4);
    }

    #[test]
    fn test_decide_shapes() {
        let (_, ensemble) = ensemble(&["interaction", "association"]);
        let vectors = Tensor::randn(0f32, 1f32, (2, 3, 8), &Device::Cpu).unwrap();
        let output = ensemble.decide(&vectors).unwrap();

        assert_eq!(output.logits.len(), 2);
        assert_eq!(output.logits[0].dims(), &[2, 3, 2]);
        assert_eq!(output.fused.len(), 2);
        assert!(output.fused.iter().flatten().all(|&d| d <= 2));
        assert_eq!(ensemble.no_label_index(), 2);
        assert_eq!(
            ensemble.sub_tasks(),
            &["relation_interaction", "relation_association"]
        );
    }

    #[test]
    fn test_rejects_duplicate_or_missing_labels() {
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &Device::Cpu);
        let dup = EnsembleConfig::new(Task::Relation, vec!["x".into(), "x".into()], 4);
        assert!(EnsembleClassifier::new(dup, vb.clone()).is_err());
        let empty = EnsembleConfig::new(Task::Relation, Vec::new(), 4);
        assert!(EnsembleClassifier::new(empty, vb).is_err());
    }

    #[test]
    fn test_loss_all_ignored_sub_task_contributes_zero() {
        let (_, ensemble) = ensemble(&["interaction", "association"]);
        let a = logits(&[[0.0, 0.0]]);
        let b = logits(&[[4.0, -4.0]]);
        let labels =
            Tensor::from_vec(vec![YES, IGNORE_INDEX], (2, 1, 1), &Device::Cpu).unwrap();
        let loss = ensemble
            .loss(&[a, b], &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - std::f32::consts::LN_2 / 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_loss_rejects_wrong_sub_task_count() {
        let (_, ensemble) = ensemble(&["interaction", "association"]);
        let labels = Tensor::from_vec(vec![NO], (1, 1, 1), &Device::Cpu).unwrap();
        assert!(ensemble.loss(&[logits(&[[0.0, 0.0]])], &labels).is_err());
    }

    #[test]
    fn test_freezing_is_tracked_per_sub_task() {
        let (_, mut ensemble) = ensemble(&["interaction", "association"]);
        ensemble
            .set_requires_grad("relation_association", false)
            .unwrap();
        assert_eq!(ensemble.frozen(), vec!["relation_association"]);
        assert!(ensemble.set_requires_grad("relation_unknown", false).is_err());
    }

    #[test]
    fn test_predicted_sets_skip_padding() {
        let (_, ensemble) = ensemble(&["interaction", "association"]);
        let pair = SpanPair::new(Span::new(0, 0), Span::new(2, 2));
        let fused = vec![vec![1, 0], vec![0]];
        let candidates = vec![vec![pair], Vec::new()];
        let sets = ensemble.predicted_sets(&fused, &candidates);

        assert_eq!(sets[0]["relation_association"], vec![pair]);
        assert!(sets[0]["relation_interaction"].is_empty());
        assert!(sets[1].values().all(Vec::is_empty));
    }
}
