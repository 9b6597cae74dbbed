//! Epoch plans.
//!
//! A flat epoch is one turn over all batches. A continual epoch buckets the
//! batches by corpus, splits every bucket into `group_num` consecutive
//! groups and visits `[stage][group][corpus]` with stages in reverse order,
//! so each corpus gets many short turns interleaved with the others.

use std::collections::BTreeMap;

use crate::data::Dataset;

/// A run of batches trained back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    /// Corpus the batches were bucketed under; `None` in flat epochs.
    pub corpus: Option<String>,
    pub batches: Vec<Vec<usize>>,
}

/// Batches laid out as `[stage][group]`, each group holding one turn per
/// corpus in corpus order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Curriculum {
    stages: Vec<Vec<Vec<Turn>>>,
}

impl Curriculum {
    /// Every batch is assigned to the corpus of its first sentence.
    pub fn build(
        batches: Vec<Vec<usize>>,
        dataset: &Dataset,
        corpus_order: &[String],
        group_num: usize,
    ) -> Self {
        let mut buckets: BTreeMap<&str, Vec<Vec<usize>>> = BTreeMap::new();
        for batch in batches {
            let Some(&first) = batch.first() else {
                continue;
            };
            buckets
                .entry(dataset.corpora[first].as_str())
                .or_default()
                .push(batch);
        }

        let group_num = group_num.max(1);
        let mut groups: Vec<Vec<Turn>> = vec![Vec::new(); group_num];
        for corpus in corpus_order {
            let Some(bucket) = buckets.get(corpus.as_str()) else {
                continue;
            };
            for (group, chunk) in sep_list(bucket, group_num).into_iter().enumerate() {
                groups[group].push(Turn {
                    corpus: Some(corpus.clone()),
                    batches: chunk,
                });
            }
        }

        Self {
            stages: vec![groups],
        }
    }

    /// Turns in visiting order: stages last to first, then groups, then
    /// corpora.
    pub fn into_turns(self) -> Vec<Turn> {
        self.stages
            .into_iter()
            .rev()
            .flatten()
            .flatten()
            .collect()
    }
}

/// The single turn of a flat epoch.
pub fn flat_plan(batches: Vec<Vec<usize>>) -> Vec<Turn> {
    vec![Turn {
        corpus: None,
        batches,
    }]
}

/// Splits `items` into `n` consecutive chunks of `ceil(len / n)` items.
/// Trailing chunks are empty when the items run out early.
pub fn sep_list<T: Clone>(items: &[T], n: usize) -> Vec<Vec<T>> {
    let n = n.max(1);
    let step = items.len().div_ceil(n);
    (0..n)
        .map(|i| {
            let start = (i * step).min(items.len());
            let end = ((i + 1) * step).min(items.len());
            items[start..end].to_vec()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use biorel_core::Sentence;

    fn dataset(corpora: &[&str]) -> Dataset {
        let sentences = corpora
            .iter()
            .enumerate()
            .map(|(i, _)| Sentence {
                id: i.to_string(),
                tokens: vec![1, 2],
                entities: Vec::new(),
                entity_types: Vec::new(),
                gold_entities: BTreeMap::new(),
                gold_relations: BTreeMap::new(),
            })
            .collect();
        Dataset {
            sentences,
            corpora: corpora.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn sep_list_uses_ceil_chunks() {
        assert_eq!(
            sep_list(&[1, 2, 3, 4, 5], 2),
            vec![vec![1, 2, 3], vec![4, 5]]
        );
        assert_eq!(
            sep_list(&[1, 2, 3, 4, 5, 6, 7], 3),
            vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]
        );
        assert_eq!(sep_list(&[1, 2], 4), vec![vec![1], vec![2], vec![], vec![]]);
        assert_eq!(sep_list::<u8>(&[], 2), vec![Vec::<u8>::new(), Vec::new()]);
    }

    #[test]
    fn continual_plan_interleaves_corpora_by_group() {
        let data = dataset(&["DDI", "CPR", "DDI", "CPR", "DDI", "DDI"]);
        // batch corpus is decided by its first sentence
        let batches = vec![vec![0, 1], vec![2], vec![3, 0], vec![4], vec![5]];
        let order = vec!["DDI".to_string(), "CPR".to_string()];
        let turns = Curriculum::build(batches, &data, &order, 2).into_turns();

        let summary: Vec<(Option<&str>, usize)> = turns
            .iter()
            .map(|t| (t.corpus.as_deref(), t.batches.len()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (Some("DDI"), 2),
                (Some("CPR"), 1),
                (Some("DDI"), 2),
                (Some("CPR"), 0),
            ]
        );
        assert_eq!(turns[0].batches, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn corpora_without_batches_get_no_turns() {
        let data = dataset(&["DDI"]);
        let order = vec!["CPR".to_string(), "DDI".to_string()];
        let turns = Curriculum::build(vec![vec![0]], &data, &order, 1).into_turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].corpus.as_deref(), Some("DDI"));
    }

    #[test]
    fn flat_plan_is_one_turn() {
        let turns = flat_plan(vec![vec![0], vec![1]]);
        assert_eq!(turns.len(), 1);
        assert!(turns[0].corpus.is_none());
    }
}
