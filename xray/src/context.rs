//! Request-scoped trace context.
//!
//! A [`Context`] is an immutable value carrying the innermost open segment.
//! Beginning a segment or subsegment returns a new context chained from the
//! input; nothing is stored in thread-local state, so concurrent requests
//! can never observe each other's segments.

use std::fmt;
use std::sync::Arc;

use crate::segment::{Segment, SegmentInner};

/// An immutable, request-scoped value linking instrumented code to the
/// segment tree. Cloning is cheap.
#[derive(Clone, Default)]
pub struct Context {
    pub(crate) slot: Slot,
}

#[derive(Clone, Default)]
pub(crate) enum Slot {
    /// No segment has been begun on this call chain.
    #[default]
    Empty,
    /// The SDK is disabled; segment operations are silently no-ops.
    Disabled,
    /// An open segment.
    Segment(Arc<SegmentInner>),
}

impl Context {
    /// Creates a context with no associated segment.
    pub fn new() -> Context {
        Context::default()
    }

    /// Returns a handle to the innermost open segment, if any.
    pub fn segment(&self) -> Option<Segment> {
        match &self.slot {
            Slot::Segment(inner) if !inner.is_closed() => Some(Segment::attached(inner.clone())),
            _ => None,
        }
    }

    pub(crate) fn with_segment(inner: Arc<SegmentInner>) -> Context {
        Context {
            slot: Slot::Segment(inner),
        }
    }

    pub(crate) fn disabled() -> Context {
        Context {
            slot: Slot::Disabled,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Slot::Empty => f.write_str("Context(empty)"),
            Slot::Disabled => f.write_str("Context(disabled)"),
            Slot::Segment(inner) => write!(f, "Context({})", inner.id()),
        }
    }
}
