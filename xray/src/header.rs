//! Codec for the `X-Amzn-Trace-Id` propagation header.
//!
//! The header is a `;`-separated list of `key=value` pairs. `Root`, `Parent`
//! and `Sampled` are interpreted; `Self` is accepted on input and dropped;
//! everything else passes through untouched so intermediate services cannot
//! lose fields they do not understand.

use std::fmt;

use crate::id::{SegmentId, TraceId};

/// Canonical name of the propagation header.
pub const TRACE_ID_HEADER: &str = "X-Amzn-Trace-Id";

const ROOT_KEY: &str = "Root";
const PARENT_KEY: &str = "Parent";
const SAMPLED_KEY: &str = "Sampled";
const SELF_KEY: &str = "Self";

/// The sampling decision carried by a header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SampleDecision {
    /// The upstream service decided to sample (`Sampled=1`).
    Sampled,
    /// The upstream service decided not to sample (`Sampled=0`).
    NotSampled,
    /// The upstream service asks this service to decide (`Sampled=?`).
    Requested,
    /// The header carried no decision.
    #[default]
    Unknown,
}

impl SampleDecision {
    fn as_str(self) -> Option<&'static str> {
        match self {
            SampleDecision::Sampled => Some("1"),
            SampleDecision::NotSampled => Some("0"),
            SampleDecision::Requested => Some("?"),
            SampleDecision::Unknown => None,
        }
    }
}

/// Parsed form of the propagation header.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraceHeader {
    pub root: Option<TraceId>,
    pub parent: Option<SegmentId>,
    pub sampled: SampleDecision,
    /// Unknown keys, preserved verbatim in input order.
    pub extra: Vec<(String, String)>,
}

impl TraceHeader {
    /// Parses a header value. Unparseable `Root`/`Parent` values are dropped
    /// rather than failing: a damaged header never breaks request handling.
    pub fn parse(value: &str) -> TraceHeader {
        let mut header = TraceHeader::default();
        for pair in value.split_terminator(';') {
            let pair = pair.trim();
            let Some(idx) = pair.find('=') else { continue };
            let (key, val) = pair.split_at(idx);
            let val = &val[1..];
            match key {
                ROOT_KEY => header.root = TraceId::parse(val),
                PARENT_KEY => header.parent = SegmentId::parse(val),
                SAMPLED_KEY => {
                    header.sampled = match val {
                        "1" => SampleDecision::Sampled,
                        "0" => SampleDecision::NotSampled,
                        "?" => SampleDecision::Requested,
                        _ => SampleDecision::Unknown,
                    }
                }
                SELF_KEY => {}
                _ => header.extra.push((key.to_string(), val.to_string())),
            }
        }
        header
    }

    /// True when the header carries nothing worth propagating.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
            && self.parent.is_none()
            && self.sampled == SampleDecision::Unknown
            && self.extra.is_empty()
    }
}

impl fmt::Display for TraceHeader {
    /// Formats known keys first, then passthrough keys in insertion order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        if let Some(root) = &self.root {
            write!(f, "{ROOT_KEY}={root}")?;
            sep = ";";
        }
        if let Some(parent) = &self.parent {
            write!(f, "{sep}{PARENT_KEY}={parent}")?;
            sep = ";";
        }
        if let Some(decision) = self.sampled.as_str() {
            write!(f, "{sep}{SAMPLED_KEY}={decision}")?;
            sep = ";";
        }
        for (key, value) in &self.extra {
            write!(f, "{sep}{key}={value}")?;
            sep = ";";
        }
        Ok(())
    }
}
