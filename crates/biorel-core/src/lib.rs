//! # Biorel Core
//!
//! Building blocks for joint biomedical entity typing and relation
//! extraction: typed entity markers, entity-pair encoding on top of a
//! contextual encoder, gold-label alignment, and ensembles of binary
//! classifiers with deterministic fusion.
//!
//! ## Quick Start
//!
//! ```rust
//! use biorel_core::marker::{MarkerVocab, inject_markers};
//! use biorel_core::types::Span;
//!
//! let vocab = MarkerVocab::grow(100, &["Drug"]);
//! let tokens: Vec<u32> = (0..10).collect();
//! let entities = [Span::new(2, 2), Span::new(5, 6)];
//! let types = vec!["Drug".to_string(), "Drug".to_string()];
//!
//! let marked = inject_markers(&tokens, &entities, &types, &vocab).unwrap();
//! assert_eq!(marked.augmented, vec![Span::new(2, 4), Span::new(7, 10)]);
//! assert_eq!(marked.tokens[marked.augmented[1].start], 100);
//! ```
pub mod encoder;
pub mod ensemble;
pub mod error;
pub mod gold;
pub mod marker;
pub mod pairs;
pub mod types;

// Re-export primary API
pub use encoder::{DistilBertEncoder, EncoderInput, LiteEncoder, SequenceEncoder};
pub use ensemble::{
    BinaryClassifier, EnsembleClassifier, EnsembleConfig, EnsembleOutput, LossPolicy,
};
pub use error::{BiorelError, Result};
pub use gold::{GoldAligner, GoldAlignment, IGNORE_INDEX, NO, YES};
pub use marker::{MarkedSentence, MarkerVocab, candidate_pairs, enumerate_pairs, inject_markers};
pub use pairs::{EntityEncoding, EntityPairEncoder, PairEncoding, RepresentationMode};
pub use types::{Record, Sentence, Span, SpanPair, Task, UNTYPED_ENTITY};
