pub mod sentence;
pub mod span;
pub mod task;

pub use sentence::{Record, Sentence};
pub use span::{Span, SpanPair};
pub use task::{Task, UNTYPED_ENTITY};
