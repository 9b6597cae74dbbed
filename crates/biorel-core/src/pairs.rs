//! # Entity Pair Encoding
//!
//! Turns a batch of sentences into one vector per candidate entity pair.
//!
//! Two representation modes are supported:
//!
//! - **Marker**: typed markers are spliced around every entity, the marked
//!   sequence is encoded, each entity is represented by the hidden vector at
//!   its start marker, and a pair is the projection of both entity vectors
//!   concatenated (`Linear(2H -> H) -> GELU -> LayerNorm`).
//! - **Sum-pool**: the plain sequence is encoded, each entity is the sum of
//!   its token vectors, and a pair is both entity vectors concatenated
//!   (width `2H`, no projection).
//!
//! Sentences in a batch carry different numbers of pairs. Pair vectors are
//! padded to the longest row; sentences with fewer than two entities get a
//! single zero placeholder row. `pair_counts` always reports the true
//! number of candidates so downstream code can tell padding from pairs.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::encoder::{EncoderInput, SequenceEncoder};
use crate::error::{BiorelError, Result};
use crate::marker::{MarkedSentence, MarkerVocab, enumerate_pairs, inject_markers};
use crate::types::{Sentence, Span, SpanPair};

/// How entities and pairs are represented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepresentationMode {
    /// Start-marker vectors of a marker-augmented encoding, projected.
    #[default]
    Marker,
    /// Summed token vectors of a plain encoding, concatenated.
    SumPool,
}

impl fmt::Display for RepresentationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepresentationMode::Marker => f.write_str("marker"),
            RepresentationMode::SumPool => f.write_str("sum-pool"),
        }
    }
}

impl FromStr for RepresentationMode {
    type Err = BiorelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "marker" => Ok(RepresentationMode::Marker),
            "sum-pool" => Ok(RepresentationMode::SumPool),
            other => Err(BiorelError::Config(format!(
                "unknown representation mode {other:?}"
            ))),
        }
    }
}

/// Pair vectors for a batch.
#[derive(Debug, Clone)]
pub struct PairEncoding {
    /// `[batch, max(1, max pair count), output_dim]`.
    pub pair_vectors: Tensor,
    /// Candidate pairs per sentence in raw index space, enumeration order.
    pub raw_pairs: Vec<Vec<SpanPair>>,
    /// True number of candidates per sentence.
    pub pair_counts: Vec<usize>,
    /// Marker-augmented views (empty in sum-pool mode).
    pub marked: Vec<MarkedSentence>,
}

impl PairEncoding {
    /// Padded pair dimension of `pair_vectors`.
    pub fn width(&self) -> usize {
        self.pair_counts.iter().copied().max().unwrap_or(0).max(1)
    }
}

/// Entity vectors for a batch.
#[derive(Debug, Clone)]
pub struct EntityEncoding {
    /// `[batch, max(1, max entity count), hidden]`.
    pub entity_vectors: Tensor,
    /// Entities per sentence in raw index space.
    pub spans: Vec<Vec<Span>>,
    /// True number of entities per sentence.
    pub entity_counts: Vec<usize>,
}

/// Builds pair (and entity) representations on top of a [`SequenceEncoder`].
pub struct EntityPairEncoder {
    mode: RepresentationMode,
    markers: MarkerVocab,
    hidden_size: usize,
    projection: Option<(Linear, LayerNorm)>,
}

impl EntityPairEncoder {
    /// Creates the encoder. The pair projection only exists in marker mode
    /// and lives under `pair_projection` / `pair_norm` in `vb`.
    pub fn new(
        mode: RepresentationMode,
        markers: MarkerVocab,
        hidden_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let projection = match mode {
            RepresentationMode::Marker => Some((
                candle_nn::linear(2 * hidden_size, hidden_size, vb.pp("pair_projection"))?,
                candle_nn::layer_norm(hidden_size, 1e-5, vb.pp("pair_norm"))?,
            )),
            RepresentationMode::SumPool => None,
        };
        Ok(Self {
            mode,
            markers,
            hidden_size,
            projection,
        })
    }

    pub fn mode(&self) -> RepresentationMode {
        self.mode
    }

    pub fn markers(&self) -> &MarkerVocab {
        &self.markers
    }

    /// Width of each pair vector.
    pub fn output_dim(&self) -> usize {
        match self.mode {
            RepresentationMode::Marker => self.hidden_size,
            RepresentationMode::SumPool => 2 * self.hidden_size,
        }
    }

    /// Encodes every candidate pair of every sentence.
    pub fn encode_pairs(
        &self,
        encoder: &dyn SequenceEncoder,
        batch: &[Sentence],
    ) -> Result<PairEncoding> {
        let device = encoder.device();

        let (marked, entity_table) = match self.mode {
            RepresentationMode::Marker => {
                let marked = batch
                    .iter()
                    .map(|s| inject_markers(&s.tokens, &s.entities, &s.entity_types, &self.markers))
                    .collect::<Result<Vec<_>>>()?;
                let sequences: Vec<Vec<u32>> = marked.iter().map(|m| m.tokens.clone()).collect();
                let hidden = encode_batch(encoder, &sequences)?;
                let starts: Vec<Vec<Span>> = marked.iter().map(|m| m.augmented.clone()).collect();
                let table = start_vectors(&hidden, &starts)?;
                (marked, table)
            }
            RepresentationMode::SumPool => {
                let sequences: Vec<Vec<u32>> = batch.iter().map(|s| s.tokens.clone()).collect();
                let hidden = encode_batch(encoder, &sequences)?;
                let spans: Vec<Vec<Span>> = batch.iter().map(|s| s.entities.clone()).collect();
                let table = pooled_vectors(&hidden, &spans)?;
                (Vec::new(), table)
            }
        };
        let placeholder = entity_table.dim(0)? - 1;

        let mut offset = 0;
        let mut left = Vec::with_capacity(batch.len());
        let mut right = Vec::with_capacity(batch.len());
        let mut raw_pairs: Vec<Vec<SpanPair>> = Vec::with_capacity(batch.len());
        for sentence in batch {
            let pairs = enumerate_pairs(&sentence.entities);
            left.push(pairs.iter().map(|&(a, _)| offset + a).collect::<Vec<_>>());
            right.push(pairs.iter().map(|&(_, b)| offset + b).collect::<Vec<_>>());
            raw_pairs.push(
                pairs
                    .iter()
                    .map(|&(a, b)| SpanPair::new(sentence.entities[a], sentence.entities[b]))
                    .collect(),
            );
            offset += sentence.entities.len();
        }
        let pair_counts: Vec<usize> = raw_pairs.iter().map(Vec::len).collect();
        let width = pair_counts.iter().copied().max().unwrap_or(0).max(1);

        let first = gather_rows(&entity_table, &left, width, placeholder, device)?;
        let second = gather_rows(&entity_table, &right, width, placeholder, device)?;
        let concatenated = Tensor::cat(&[&first, &second], 2)?;

        let pair_vectors = match &self.projection {
            Some((linear, norm)) => {
                let projected = linear.forward(&concatenated)?.gelu_erf()?;
                let normed = norm.forward(&projected)?;
                zero_padding(&normed, &pair_counts)?
            }
            None => concatenated,
        };

        Ok(PairEncoding {
            pair_vectors,
            raw_pairs,
            pair_counts,
            marked,
        })
    }

    /// Encodes every entity of every sentence by summing its token vectors
    /// over a plain (marker-free) encoding.
    pub fn encode_entities(
        &self,
        encoder: &dyn SequenceEncoder,
        batch: &[Sentence],
    ) -> Result<EntityEncoding> {
        let device = encoder.device();
        let sequences: Vec<Vec<u32>> = batch.iter().map(|s| s.tokens.clone()).collect();
        let hidden = encode_batch(encoder, &sequences)?;

        let spans: Vec<Vec<Span>> = batch.iter().map(|s| s.entities.clone()).collect();
        let table = pooled_vectors(&hidden, &spans)?;
        let placeholder = table.dim(0)? - 1;

        let mut offset = 0;
        let layout: Vec<Vec<usize>> = spans
            .iter()
            .map(|s| {
                let rows = (offset..offset + s.len()).collect();
                offset += s.len();
                rows
            })
            .collect();
        let entity_counts: Vec<usize> = spans.iter().map(Vec::len).collect();
        let width = entity_counts.iter().copied().max().unwrap_or(0).max(1);

        Ok(EntityEncoding {
            entity_vectors: gather_rows(&table, &layout, width, placeholder, device)?,
            spans,
            entity_counts,
        })
    }
}

fn encode_batch(encoder: &dyn SequenceEncoder, sequences: &[Vec<u32>]) -> Result<Tensor> {
    let input = EncoderInput::from_sequences(sequences, encoder.pad_id(), encoder.device())?;
    encoder.encode(&input)
}

/// Hidden vectors at each span start, flattened over the batch, with a
/// trailing zero row. Returns `[total_entities + 1, hidden]`.
fn start_vectors(hidden: &Tensor, spans: &[Vec<Span>]) -> Result<Tensor> {
    let (batch, seq_len, hidden_size) = hidden.dims3()?;
    let positions: Vec<u32> = spans
        .iter()
        .enumerate()
        .flat_map(|(b, s)| s.iter().map(move |span| (b * seq_len + span.start) as u32))
        .collect();

    let zero = Tensor::zeros((1, hidden_size), hidden.dtype(), hidden.device())?;
    if positions.is_empty() {
        return Ok(zero);
    }
    let flat = hidden.reshape((batch * seq_len, hidden_size))?;
    let index = Tensor::from_vec(positions.clone(), positions.len(), hidden.device())?;
    Ok(Tensor::cat(&[&flat.index_select(&index, 0)?, &zero], 0)?)
}

/// Inclusive sum of hidden vectors over each span, flattened over the batch,
/// with a trailing zero row. Returns `[total_entities + 1, hidden]`.
fn pooled_vectors(hidden: &Tensor, spans: &[Vec<Span>]) -> Result<Tensor> {
    let (_, _, hidden_size) = hidden.dims3()?;
    let mut rows = Vec::new();
    for (b, sentence_spans) in spans.iter().enumerate() {
        let sentence = hidden.get(b)?;
        for span in sentence_spans {
            rows.push(sentence.narrow(0, span.start, span.len())?.sum(0)?);
        }
    }
    rows.push(Tensor::zeros(hidden_size, hidden.dtype(), hidden.device())?);
    Ok(Tensor::stack(&rows, 0)?)
}

/// Gathers table rows into `[batch, width, dim]`, padding each row list
/// with `placeholder`.
fn gather_rows(
    table: &Tensor,
    layout: &[Vec<usize>],
    width: usize,
    placeholder: usize,
    device: &Device,
) -> Result<Tensor> {
    let dim = table.dim(1)?;
    let mut index = Vec::with_capacity(layout.len() * width);
    for rows in layout {
        index.extend(rows.iter().map(|&r| r as u32));
        index.extend(std::iter::repeat_n(placeholder as u32, width - rows.len()));
    }
    let index = Tensor::from_vec(index, layout.len() * width, device)?;
    Ok(table
        .index_select(&index, 0)?
        .reshape((layout.len(), width, dim))?)
}

/// Zeroes pair rows beyond each sentence's true count.
fn zero_padding(vectors: &Tensor, counts: &[usize]) -> Result<Tensor> {
    let (batch, width, _) = vectors.dims3()?;
    let mask: Vec<f32> = counts
        .iter()
        .flat_map(|&count| (0..width).map(move |p| if p < count { 1.0 } else { 0.0 }))
        .collect();
    let mask = Tensor::from_vec(mask, (batch, width, 1), vectors.device())?
        .to_dtype(vectors.dtype())?;
    Ok(vectors.broadcast_mul(&mask)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::LiteEncoder;
    use crate::types::Record;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn sentence(id: &str, len: usize, entities: &[(usize, usize)]) -> Sentence {
        let record = Record {
            id: id.to_string(),
            tokens: (1..=len as u32).collect(),
            entities: entities.iter().map(|&(s, e)| Span::new(s, e)).collect(),
            entity_types: Default::default(),
            relations: Default::default(),
        };
        Sentence::from_record(&record, &[]).unwrap()
    }

    fn setup(mode: RepresentationMode) -> (LiteEncoder, EntityPairEncoder) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let markers = MarkerVocab::grow(32, &["Drug"]);
        let encoder =
            LiteEncoder::new(markers.vocab_size(), 8, 64, 0, vb.pp("encoder")).unwrap();
        let pairs = EntityPairEncoder::new(mode, markers, 8, vb.pp("pairs")).unwrap();
        (encoder, pairs)
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(
            "sum-pool".parse::<RepresentationMode>().unwrap(),
            RepresentationMode::SumPool
        );
        assert_eq!(RepresentationMode::Marker.to_string(), "marker");
        assert!("mean".parse::<RepresentationMode>().is_err());
    }

    #[test]
    fn test_marker_mode_shapes() {
        let (encoder, pairs) = setup(RepresentationMode::Marker);
        let batch = vec![
            sentence("a", 10, &[(2, 2), (5, 6), (8, 8)]),
            sentence("b", 4, &[(0, 1)]),
        ];
        let encoding = pairs.encode_pairs(&encoder, &batch).unwrap();

        assert_eq!(encoding.pair_counts, vec![3, 0]);
        assert_eq!(encoding.pair_vectors.dims(), &[2, 3, 8]);
        assert_eq!(encoding.width(), 3);
        assert_eq!(encoding.raw_pairs[0].len(), 3);
        assert!(encoding.raw_pairs[1].is_empty());
        assert_eq!(encoding.marked[0].augmented[1], Span::new(7, 10));
    }

    #[test]
    fn test_sum_pool_mode_doubles_width() {
        let (encoder, pairs) = setup(RepresentationMode::SumPool);
        let batch = vec![sentence("a", 6, &[(0, 0), (2, 4)])];
        let encoding = pairs.encode_pairs(&encoder, &batch).unwrap();

        assert_eq!(pairs.output_dim(), 16);
        assert_eq!(encoding.pair_vectors.dims(), &[1, 1, 16]);
        assert!(encoding.marked.is_empty());
    }

    #[test]
    fn test_sum_pool_is_inclusive() {
        let (encoder, pairs) = setup(RepresentationMode::SumPool);
        let batch = vec![sentence("a", 6, &[(0, 0), (2, 4)])];
        let encoding = pairs.encode_pairs(&encoder, &batch).unwrap();

        let hidden = encode_batch(&encoder, &[batch[0].tokens.clone()])
            .unwrap()
            .get(0)
            .unwrap();
        let expected = hidden.narrow(0, 2, 3).unwrap().sum(0).unwrap();
        let second = encoding
            .pair_vectors
            .get(0)
            .unwrap()
            .get(0)
            .unwrap()
            .narrow(0, 8, 8)
            .unwrap();
        let diff = (expected - second)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_placeholder_rows_are_zero() {
        let (encoder, pairs) = setup(RepresentationMode::Marker);
        let batch = vec![sentence("a", 5, &[(0, 0), (2, 2)]), sentence("b", 3, &[])];
        let encoding = pairs.encode_pairs(&encoder, &batch).unwrap();

        assert_eq!(encoding.pair_counts, vec![1, 0]);
        let placeholder = encoding
            .pair_vectors
            .get(1)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(placeholder, 0.0);
    }

    #[test]
    fn test_entity_encoding() {
        let (encoder, pairs) = setup(RepresentationMode::Marker);
        let batch = vec![
            sentence("a", 6, &[(0, 0), (2, 4)]),
            sentence("b", 3, &[]),
        ];
        let encoding = pairs.encode_entities(&encoder, &batch).unwrap();
        assert_eq!(encoding.entity_counts, vec![2, 0]);
        assert_eq!(encoding.entity_vectors.dims(), &[2, 2, 8]);
    }
}
