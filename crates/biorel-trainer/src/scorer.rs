//! Precision / recall / F1 scoring.

use std::collections::{BTreeMap, BTreeSet};

/// Gold and predicted items per sub-task for one sentence.
pub type SubTaskResults<K> = BTreeMap<String, (Vec<K>, Vec<K>)>;

/// Counts and rates for one scope (a sub-task, or a whole task).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Prf {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl Prf {
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r > 0.0 { 2.0 * p * r / (p + r) } else { 0.0 }
    }

    fn add(&mut self, other: &Prf) {
        self.true_positives += other.true_positives;
        self.false_positives += other.false_positives;
        self.false_negatives += other.false_negatives;
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 { num as f64 / den as f64 } else { 0.0 }
}

/// Scores of one task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskScore {
    pub micro: Prf,
    pub per_sub_task: BTreeMap<String, Prf>,
}

/// Turns per-sentence gold/predicted sets into scores.
pub trait Scorer<K> {
    fn score(&self, sentences: &[SubTaskResults<K>]) -> TaskScore;
}

/// Micro-averaged scorer: counts are pooled over sentences and sub-tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct MicroF1Scorer;

impl<K: Ord> Scorer<K> for MicroF1Scorer {
    fn score(&self, sentences: &[SubTaskResults<K>]) -> TaskScore {
        let mut score = TaskScore::default();
        for sentence in sentences {
            for (sub_task, (gold, predicted)) in sentence {
                let gold: BTreeSet<&K> = gold.iter().collect();
                let predicted: BTreeSet<&K> = predicted.iter().collect();
                let tp = gold.intersection(&predicted).count();
                let counts = Prf {
                    true_positives: tp,
                    false_positives: predicted.len() - tp,
                    false_negatives: gold.len() - tp,
                };
                score
                    .per_sub_task
                    .entry(sub_task.clone())
                    .or_default()
                    .add(&counts);
                score.micro.add(&counts);
            }
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(entries: &[(&str, &[u32], &[u32])]) -> SubTaskResults<u32> {
        entries
            .iter()
            .map(|(id, gold, pred)| (id.to_string(), (gold.to_vec(), pred.to_vec())))
            .collect()
    }

    #[test]
    fn micro_scores_pool_counts() {
        let sentences = vec![
            results(&[("relation_a", &[1, 2], &[1]), ("relation_b", &[], &[3])]),
            results(&[("relation_a", &[4], &[4])]),
        ];
        let score = MicroF1Scorer.score(&sentences);

        assert_eq!(score.micro.true_positives, 2);
        assert_eq!(score.micro.false_positives, 1);
        assert_eq!(score.micro.false_negatives, 1);
        assert!((score.micro.f1() - 2.0 / 3.0).abs() < 1e-9);
        assert!((score.per_sub_task["relation_a"].recall() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(score.per_sub_task["relation_b"].precision(), 0.0);
    }

    #[test]
    fn empty_input_scores_zero() {
        let score = Scorer::<u32>::score(&MicroF1Scorer, &[]);
        assert_eq!(score.micro.f1(), 0.0);
        assert!(score.per_sub_task.is_empty());
    }

    #[test]
    fn duplicates_count_once() {
        let sentences = vec![results(&[("relation_a", &[1, 1], &[1, 1])])];
        let score = MicroF1Scorer.score(&sentences);
        assert_eq!(score.micro.true_positives, 1);
        assert_eq!(score.micro.f1(), 1.0);
    }
}
