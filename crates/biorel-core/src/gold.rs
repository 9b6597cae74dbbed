//! # Gold Alignment
//!
//! Builds per-candidate supervision for every sub-task of an ensemble.
//!
//! Each candidate (entity pair for relations, entity span for entity types)
//! gets one label per sub-task: [`NO`], [`YES`], or [`IGNORE_INDEX`] for
//! positions the loss must skip. Sentences without candidates contribute a
//! single ignore row so that the gold tensor and the candidate vectors always
//! line up row for row.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::error::{BiorelError, Result};

/// Label: the candidate does not belong to the sub-task.
pub const NO: u32 = 0;
/// Label: the candidate belongs to the sub-task.
pub const YES: u32 = 1;
/// Label excluded from the loss (padding and placeholder rows).
pub const IGNORE_INDEX: u32 = 2;

/// Gold supervision for one batch and one task.
#[derive(Debug, Clone)]
pub struct GoldAlignment<K> {
    /// `[n_sub_tasks, batch, width]` labels, sub-tasks in ensemble order.
    pub labels: Tensor,
    /// Deduplicated gold items per sentence and sub-task.
    pub gold_sets: Vec<BTreeMap<String, Vec<K>>>,
}

/// Aligns gold annotations with enumerated candidates for a fixed sub-task
/// order.
#[derive(Debug, Clone)]
pub struct GoldAligner {
    sub_tasks: Vec<String>,
}

impl GoldAligner {
    pub fn new(sub_tasks: Vec<String>) -> Self {
        Self { sub_tasks }
    }

    pub fn sub_tasks(&self) -> &[String] {
        &self.sub_tasks
    }

    /// Gold items per sub-task for one sentence, deduplicated. Sub-tasks
    /// without annotations map to an empty list.
    pub fn gold_sets<K: Ord + Clone>(
        &self,
        annotations: &BTreeMap<String, Vec<K>>,
    ) -> BTreeMap<String, Vec<K>> {
        self.sub_tasks
            .iter()
            .map(|sub_task| {
                let mut items = annotations.get(sub_task).cloned().unwrap_or_default();
                items.sort();
                items.dedup();
                (sub_task.clone(), items)
            })
            .collect()
    }

    /// Labels of one sentence as `[candidate][sub_task]`.
    pub fn sentence_labels<K: Ord>(
        &self,
        gold: &BTreeMap<String, Vec<K>>,
        candidates: &[K],
    ) -> Vec<Vec<u32>> {
        candidates
            .iter()
            .map(|candidate| {
                self.sub_tasks
                    .iter()
                    .map(|sub_task| match gold.get(sub_task) {
                        Some(items) if items.binary_search(candidate).is_ok() => YES,
                        _ => NO,
                    })
                    .collect()
            })
            .collect()
    }

    /// Aligns a whole batch.
    ///
    /// `candidates[s]` must be the enumeration the candidate vectors were
    /// built from and `counts[s]` the number of true candidates the encoder
    /// reported for sentence `s`. Any disagreement is an
    /// [`BiorelError::AlignmentMismatch`].
    pub fn align<K: Ord + Clone>(
        &self,
        annotations: &[&BTreeMap<String, Vec<K>>],
        candidates: &[Vec<K>],
        counts: &[usize],
        device: &Device,
    ) -> Result<GoldAlignment<K>> {
        let batch = candidates.len();
        if annotations.len() != batch || counts.len() != batch {
            return Err(BiorelError::AlignmentMismatch {
                sentence: annotations.len().min(counts.len()),
                candidates: batch,
                rows: annotations.len().max(counts.len()),
            });
        }
        let width = counts.iter().copied().max().unwrap_or(0).max(1);
        let n_sub = self.sub_tasks.len();

        let mut labels = vec![IGNORE_INDEX; n_sub * batch * width];
        let mut gold_sets = Vec::with_capacity(batch);

        for (s, (sentence_candidates, annotation)) in candidates.iter().zip(annotations).enumerate()
        {
            let gold = self.gold_sets(annotation);
            let rows = self.sentence_labels(&gold, sentence_candidates);
            if rows.len() != counts[s] {
                return Err(BiorelError::AlignmentMismatch {
                    sentence: s,
                    candidates: counts[s],
                    rows: rows.len(),
                });
            }
            for (p, row) in rows.iter().enumerate() {
                for (t, &label) in row.iter().enumerate() {
                    labels[(t * batch + s) * width + p] = label;
                }
            }
            gold_sets.push(gold);
        }

        Ok(GoldAlignment {
            labels: Tensor::from_vec(labels, (n_sub, batch, width), device)?,
            gold_sets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::candidate_pairs;
    use crate::types::{Span, SpanPair};

    fn aligner() -> GoldAligner {
        GoldAligner::new(vec![
            "relation_interaction".to_string(),
            "relation_association".to_string(),
        ])
    }

    fn pair(a: (usize, usize), b: (usize, usize)) -> SpanPair {
        SpanPair::new(Span::new(a.0, a.1), Span::new(b.0, b.1))
    }

    #[test]
    fn labels_match_gold_in_either_order() {
        let spans = [Span::new(0, 0), Span::new(2, 2), Span::new(4, 5)];
        let candidates = candidate_pairs(&spans);
        let annotations: BTreeMap<_, _> = [(
            "relation_interaction".to_string(),
            vec![pair((2, 2), (0, 0)), pair((0, 0), (2, 2))],
        )]
        .into_iter()
        .collect();

        let aligned = aligner()
            .align(&[&annotations], &[candidates], &[3], &Device::Cpu)
            .unwrap();
        assert_eq!(aligned.labels.dims(), &[2, 1, 3]);
        let labels = aligned.labels.to_vec3::<u32>().unwrap();
        assert_eq!(labels[0][0], vec![YES, NO, NO]);
        assert_eq!(labels[1][0], vec![NO, NO, NO]);
        assert_eq!(aligned.gold_sets[0]["relation_interaction"].len(), 1);
        assert!(aligned.gold_sets[0]["relation_association"].is_empty());
    }

    #[test]
    fn empty_sentence_gets_ignore_row_and_padding_is_ignored() {
        let candidates = vec![
            candidate_pairs(&[Span::new(0, 0), Span::new(1, 1), Span::new(3, 3)]),
            Vec::new(),
        ];
        let empty = BTreeMap::new();
        let aligned = aligner()
            .align(&[&empty, &empty], &candidates, &[3, 0], &Device::Cpu)
            .unwrap();

        let labels = aligned.labels.to_vec3::<u32>().unwrap();
        assert_eq!(labels[0][0], vec![NO, NO, NO]);
        assert_eq!(labels[0][1], vec![IGNORE_INDEX; 3]);
        assert_eq!(labels[1][1], vec![IGNORE_INDEX; 3]);
    }

    #[test]
    fn batch_of_only_empty_sentences_has_width_one() {
        let empty = BTreeMap::<String, Vec<SpanPair>>::new();
        let aligned = aligner()
            .align(&[&empty], &[Vec::new()], &[0], &Device::Cpu)
            .unwrap();
        assert_eq!(aligned.labels.dims(), &[2, 1, 1]);
    }

    #[test]
    fn count_mismatch_is_fatal() {
        let candidates = vec![candidate_pairs(&[Span::new(0, 0), Span::new(2, 2)])];
        let empty = BTreeMap::new();
        let err = aligner()
            .align(&[&empty], &candidates, &[3], &Device::Cpu)
            .unwrap_err();
        assert!(matches!(
            err,
            BiorelError::AlignmentMismatch {
                sentence: 0,
                candidates: 3,
                rows: 1
            }
        ));
    }

    #[test]
    fn works_for_entity_spans() {
        let aligner = GoldAligner::new(vec!["entity_type_Drug".to_string()]);
        let annotations: BTreeMap<_, _> =
            [("entity_type_Drug".to_string(), vec![Span::new(2, 2)])]
                .into_iter()
                .collect();
        let candidates = vec![vec![Span::new(0, 0), Span::new(2, 2)]];
        let aligned = aligner
            .align(&[&annotations], &candidates, &[2], &Device::Cpu)
            .unwrap();
        assert_eq!(aligned.labels.to_vec3::<u32>().unwrap()[0][0], vec![NO, YES]);
    }
}
