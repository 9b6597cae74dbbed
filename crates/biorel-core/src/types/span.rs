use std::fmt;

use serde::{Deserialize, Serialize};

/// An inclusive token-index range naming one entity mention.
///
/// Serialized as a two-element array `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(usize, usize)", into = "(usize, usize)")]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    /// Creates a span, swapping the bounds if they were given backwards.
    #[must_use]
    pub fn new(start: usize, end: usize) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// Number of tokens covered by the span.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    /// A span always covers at least one token.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl From<(usize, usize)> for Span {
    fn from((start, end): (usize, usize)) -> Self {
        Self::new(start, end)
    }
}

impl From<Span> for (usize, usize) {
    fn from(span: Span) -> Self {
        (span.start, span.end)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.start, self.end)
    }
}

/// An unordered pair of entity spans in canonical (sorted) form.
///
/// Two pairs compare equal whenever they name the same two spans, whichever
/// order they were annotated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(Span, Span)", into = "(Span, Span)")]
pub struct SpanPair {
    pub first: Span,
    pub second: Span,
}

impl SpanPair {
    #[must_use]
    pub fn new(a: Span, b: Span) -> Self {
        if a <= b {
            Self {
                first: a,
                second: b,
            }
        } else {
            Self {
                first: b,
                second: a,
            }
        }
    }
}

impl From<(Span, Span)> for SpanPair {
    fn from((a, b): (Span, Span)) -> Self {
        Self::new(a, b)
    }
}

impl From<SpanPair> for (Span, Span) {
    fn from(pair: SpanPair) -> Self {
        (pair.first, pair.second)
    }
}

impl fmt::Display for SpanPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.second)
    }
}
