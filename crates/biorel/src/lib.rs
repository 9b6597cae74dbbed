//! # biorel
//!
//! Joint entity-type and relation extraction for biomedical corpora.
//! Re-exports the modelling core and the training loop.

pub use biorel_core as core;
pub use biorel_trainer as trainer;
