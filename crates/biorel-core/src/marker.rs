//! # Entity Type Markers
//!
//! Splices typed start/end marker tokens around entity mentions inside an
//! already-tokenized sequence and re-derives the span indices after the
//! insertions. Also fixes the candidate-pair enumeration order shared by
//! gold alignment and prediction.

use std::collections::BTreeMap;

use crate::error::{BiorelError, Result};
use crate::types::{Span, SpanPair, UNTYPED_ENTITY};

/// Marker token ids per entity type.
///
/// Marker tokens are appended after the encoder's base vocabulary, so an
/// encoder built for [`MarkerVocab::vocab_size`] rows can embed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerVocab {
    base_vocab_size: usize,
    markers: BTreeMap<String, (u32, u32)>,
}

impl MarkerVocab {
    /// Start marker text for an entity type, e.g. `[Entity_Drug]`.
    pub fn start_token(entity_type: &str) -> String {
        format!("[Entity_{entity_type}]")
    }

    /// End marker text for an entity type, e.g. `[/Entity_Drug]`.
    pub fn end_token(entity_type: &str) -> String {
        format!("[/Entity_{entity_type}]")
    }

    /// Grows a base vocabulary by one start and one end marker per entity type.
    ///
    /// The untyped fallback is always registered. Ids are assigned in sorted
    /// type order so the same type list always yields the same ids.
    pub fn grow<S: AsRef<str>>(base_vocab_size: usize, entity_types: &[S]) -> Self {
        let mut types: Vec<&str> = entity_types.iter().map(AsRef::as_ref).collect();
        types.push(UNTYPED_ENTITY);
        types.sort_unstable();
        types.dedup();

        let markers = types
            .into_iter()
            .enumerate()
            .map(|(i, ty)| {
                let start = (base_vocab_size + 2 * i) as u32;
                (ty.to_string(), (start, start + 1))
            })
            .collect();

        Self {
            base_vocab_size,
            markers,
        }
    }

    /// Builds a vocabulary from ids already assigned by a tokenizer.
    pub fn from_assigned(
        base_vocab_size: usize,
        markers: impl IntoIterator<Item = (String, (u32, u32))>,
    ) -> Self {
        Self {
            base_vocab_size,
            markers: markers.into_iter().collect(),
        }
    }

    /// `(start, end)` marker ids for an entity type.
    pub fn ids(&self, entity_type: &str) -> Result<(u32, u32)> {
        self.markers
            .get(entity_type)
            .copied()
            .ok_or_else(|| BiorelError::UnknownMarker {
                entity_type: entity_type.to_string(),
            })
    }

    /// Total vocabulary size including marker tokens.
    pub fn vocab_size(&self) -> usize {
        self.markers
            .values()
            .map(|&(start, end)| start.max(end) as usize + 1)
            .max()
            .unwrap_or(0)
            .max(self.base_vocab_size)
    }

    pub fn base_vocab_size(&self) -> usize {
        self.base_vocab_size
    }
}

/// A token sequence with markers spliced in, plus both span views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkedSentence {
    /// Tokens with two markers per entity.
    pub tokens: Vec<u32>,
    /// Entity spans in marker-augmented index space. `start` is the start
    /// marker position and `end` the end marker position.
    pub augmented: Vec<Span>,
    /// Entity spans before marker insertion.
    pub raw: Vec<Span>,
}

/// Inserts typed markers around every entity.
///
/// Entities must be ordered by start offset. Entity `i` at `[s, e]` has its
/// start marker inserted at `s + 2i` and its end marker at `e + 2i + 2`:
/// every earlier entity contributed two markers, and the entity's own start
/// marker pushes its interior one step right. The augmented span is the
/// bracket `(s + 2i, e + 2i + 2)`.
pub fn inject_markers(
    tokens: &[u32],
    entities: &[Span],
    entity_types: &[String],
    vocab: &MarkerVocab,
) -> Result<MarkedSentence> {
    let mut marked = Vec::with_capacity(tokens.len() + 2 * entities.len());
    marked.extend_from_slice(tokens);
    let mut augmented = Vec::with_capacity(entities.len());

    for (i, span) in entities.iter().enumerate() {
        if span.end >= tokens.len() {
            return Err(BiorelError::SpanOutOfBounds {
                start: span.start,
                end: span.end,
                len: tokens.len(),
            });
        }
        let entity_type = entity_types
            .get(i)
            .map(String::as_str)
            .unwrap_or(UNTYPED_ENTITY);
        let (open, close) = vocab.ids(entity_type)?;

        let start = span.start + 2 * i;
        let end = span.end + 2 * i + 2;
        marked.insert(start, open);
        marked.insert(end, close);
        augmented.push(Span { start, end });
    }

    Ok(MarkedSentence {
        tokens: marked,
        augmented,
        raw: entities.to_vec(),
    })
}

/// Candidate pairs of a sentence as entity index pairs.
///
/// Pairs follow combinatorial order over the entity list, `(0, 1), (0, 2),
/// ..., (1, 2), ...`, and each pair puts the side with the smaller raw span
/// first. Both gold alignment and prediction go through this function.
pub fn enumerate_pairs(raw: &[Span]) -> Vec<(usize, usize)> {
    let n = raw.len();
    let mut pairs = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for i in 0..n {
        for j in i + 1..n {
            if raw[j] < raw[i] {
                pairs.push((j, i));
            } else {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

/// The raw-index span pairs for a sentence, in enumeration order.
pub fn candidate_pairs(raw: &[Span]) -> Vec<SpanPair> {
    enumerate_pairs(raw)
        .into_iter()
        .map(|(a, b)| SpanPair::new(raw[a], raw[b]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> MarkerVocab {
        MarkerVocab::grow(100, &["Drug", "Gene"])
    }

    fn types(n: usize, ty: &str) -> Vec<String> {
        vec![ty.to_string(); n]
    }

    #[test]
    fn grow_assigns_ids_after_base_vocab() {
        let vocab = vocab();
        assert_eq!(vocab.ids("Drug").unwrap(), (100, 101));
        assert_eq!(vocab.ids("Gene").unwrap(), (102, 103));
        assert_eq!(vocab.ids(UNTYPED_ENTITY).unwrap(), (104, 105));
        assert_eq!(vocab.vocab_size(), 106);
        assert!(vocab.ids("Disease").is_err());
    }

    #[test]
    fn marker_indices_for_two_entities() {
        let tokens: Vec<u32> = (0..10).collect();
        let entities = [Span::new(2, 2), Span::new(5, 6)];
        let marked = inject_markers(&tokens, &entities, &types(2, "Drug"), &vocab()).unwrap();

        assert_eq!(marked.augmented[0], Span::new(2, 4));
        assert_eq!(marked.augmented[1], Span::new(7, 10));
        assert_eq!(marked.raw, entities.to_vec());
        assert_eq!(marked.tokens.len(), 14);
        assert_eq!(
            marked.tokens,
            vec![0, 1, 100, 2, 101, 3, 4, 100, 5, 6, 101, 7, 8, 9]
        );
    }

    #[test]
    fn augmented_brackets_point_at_markers() {
        let tokens: Vec<u32> = (0..12).collect();
        let entities = [Span::new(0, 1), Span::new(2, 2), Span::new(3, 7)];
        let entity_types = vec!["Gene".to_string(), "Drug".to_string(), "Gene".to_string()];
        let vocab = vocab();
        let marked = inject_markers(&tokens, &entities, &entity_types, &vocab).unwrap();

        for (span, ty) in marked.augmented.iter().zip(&entity_types) {
            let (open, close) = vocab.ids(ty).unwrap();
            assert_eq!(marked.tokens[span.start], open);
            assert_eq!(marked.tokens[span.end], close);
        }
        // interior tokens survive in order
        assert_eq!(marked.tokens[5], 2);
        assert_eq!(&marked.tokens[8..13], &[3, 4, 5, 6, 7]);
    }

    #[test]
    fn adjacent_entities_follow_the_same_arithmetic() {
        let tokens: Vec<u32> = (0..6).collect();
        let entities = [Span::new(2, 2), Span::new(3, 3)];
        let marked = inject_markers(&tokens, &entities, &types(2, "Drug"), &vocab()).unwrap();
        assert_eq!(marked.augmented, vec![Span::new(2, 4), Span::new(5, 7)]);
        assert_eq!(marked.tokens, vec![0, 1, 100, 2, 101, 100, 3, 101, 4, 5]);
    }

    #[test]
    fn nested_entities_shift_like_any_later_entity() {
        let tokens: Vec<u32> = (0..8).collect();
        let entities = [Span::new(1, 4), Span::new(2, 3)];
        let marked = inject_markers(&tokens, &entities, &types(2, "Gene"), &vocab()).unwrap();
        assert_eq!(marked.augmented, vec![Span::new(1, 6), Span::new(4, 7)]);
        assert_eq!(marked.tokens.len(), 12);
    }

    #[test]
    fn entity_without_type_uses_untyped_marker() {
        let tokens: Vec<u32> = (0..4).collect();
        let marked = inject_markers(&tokens, &[Span::new(1, 1)], &[], &vocab()).unwrap();
        assert_eq!(marked.tokens, vec![0, 104, 1, 105, 2, 3]);
    }

    #[test]
    fn out_of_bounds_span_is_rejected() {
        let tokens: Vec<u32> = (0..4).collect();
        let err = inject_markers(&tokens, &[Span::new(3, 4)], &types(1, "Drug"), &vocab());
        assert!(matches!(err, Err(BiorelError::SpanOutOfBounds { .. })));
    }

    #[test]
    fn enumeration_is_combinatorial() {
        let raw = [Span::new(0, 0), Span::new(2, 2), Span::new(4, 5)];
        assert_eq!(enumerate_pairs(&raw), vec![(0, 1), (0, 2), (1, 2)]);
        assert_eq!(
            candidate_pairs(&raw)[2],
            SpanPair::new(Span::new(2, 2), Span::new(4, 5))
        );
    }

    #[test]
    fn enumeration_handles_small_sentences() {
        assert!(enumerate_pairs(&[]).is_empty());
        assert!(enumerate_pairs(&[Span::new(1, 1)]).is_empty());
    }
}
