use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::span::{Span, SpanPair};
use super::task::{Task, UNTYPED_ENTITY};
use crate::error::{BiorelError, Result};

/// One already-tokenized input record as delivered by corpus ingestion.
///
/// Annotation maps are keyed by bare labels (`"Drug"`, `"interaction"`);
/// a label missing from a map simply has no gold items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Record {
    /// Record identifier. Its prefix names the source corpus.
    pub id: String,
    /// Encoder token ids.
    pub tokens: Vec<u32>,
    /// Entity mentions to pair up.
    #[serde(default)]
    pub entities: Vec<Span>,
    /// Gold entity mentions per entity type.
    #[serde(default)]
    pub entity_types: BTreeMap<String, Vec<Span>>,
    /// Gold entity pairs per relation label.
    #[serde(default)]
    pub relations: BTreeMap<String, Vec<SpanPair>>,
}

/// A sentence ready for one forward pass.
///
/// Entities are sorted by start offset (then end) and deduplicated, so that
/// marker insertion and pair enumeration see a single fixed order. Gold maps
/// are keyed by sub-task identifier and already deduplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence {
    pub id: String,
    pub tokens: Vec<u32>,
    pub entities: Vec<Span>,
    /// Entity type per entity, parallel to `entities`.
    pub entity_types: Vec<String>,
    pub gold_entities: BTreeMap<String, Vec<Span>>,
    pub gold_relations: BTreeMap<String, Vec<SpanPair>>,
}

impl Sentence {
    /// Builds a sentence from a record.
    ///
    /// `entity_type_labels` fixes the lookup order used to type each entity:
    /// the first label whose gold list contains the span wins, and untyped
    /// spans get [`UNTYPED_ENTITY`].
    pub fn from_record(record: &Record, entity_type_labels: &[String]) -> Result<Self> {
        let len = record.tokens.len();
        let check = |span: &Span| -> Result<()> {
            if span.end >= len {
                return Err(BiorelError::SpanOutOfBounds {
                    start: span.start,
                    end: span.end,
                    len,
                });
            }
            Ok(())
        };

        let mut entities = record.entities.clone();
        entities.sort();
        entities.dedup();
        entities.iter().try_for_each(check)?;

        let mut gold_entities = BTreeMap::new();
        for (label, spans) in &record.entity_types {
            spans.iter().try_for_each(check)?;
            gold_entities.insert(Task::EntityType.sub_task(label), dedup_sorted(spans));
        }

        let mut gold_relations = BTreeMap::new();
        for (label, pairs) in &record.relations {
            for pair in pairs {
                check(&pair.first)?;
                check(&pair.second)?;
            }
            gold_relations.insert(Task::Relation.sub_task(label), dedup_sorted(pairs));
        }

        let entity_types = entities
            .iter()
            .map(|span| {
                entity_type_labels
                    .iter()
                    .find(|label| {
                        record
                            .entity_types
                            .get(label.as_str())
                            .is_some_and(|spans| spans.contains(span))
                    })
                    .cloned()
                    .unwrap_or_else(|| UNTYPED_ENTITY.to_string())
            })
            .collect();

        Ok(Self {
            id: record.id.clone(),
            tokens: record.tokens.clone(),
            entities,
            entity_types,
            gold_entities,
            gold_relations,
        })
    }

    /// Number of candidate entity pairs in this sentence.
    pub fn pair_count(&self) -> usize {
        let n = self.entities.len();
        n * n.saturating_sub(1) / 2
    }
}

fn dedup_sorted<T: Ord + Clone>(items: &[T]) -> Vec<T> {
    let mut items = items.to_vec();
    items.sort();
    items.dedup();
    items
}
