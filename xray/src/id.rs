//! Trace and segment identifiers.
//!
//! A trace id is rendered as `1-<8 hex epoch seconds>-<24 hex random>`, a
//! segment id as 16 hex characters. Both are immutable once generated.

use std::cell::RefCell;
use std::fmt;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{rngs, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

/// Wall-clock time as float seconds since the Unix epoch.
pub(crate) fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn hex(buf: &[u8]) -> String {
    let mut out = String::with_capacity(buf.len() * 2);
    for b in buf {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// The identity of a whole trace, shared by every segment under one root.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    /// Generates a fresh trace id from the current time and 96 random bits.
    pub fn generate() -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0) as u32;
        let random: [u8; 12] = CURRENT_RNG.with(|rng| rng.borrow_mut().gen());
        TraceId(format!("1-{:08x}-{}", epoch, hex(&random)))
    }

    /// Parses the `1-xxxxxxxx-x{24}` form. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '-');
        let version = parts.next()?;
        let epoch = parts.next()?;
        let random = parts.next()?;
        if version != "1" || epoch.len() != 8 || random.len() != 24 {
            return None;
        }
        if !is_hex(epoch) || !is_hex(random) {
            return None;
        }
        Some(TraceId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.0)
    }
}

/// A single segment's identifier, 64 random bits as 16 hex characters.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn generate() -> Self {
        let id: u64 = CURRENT_RNG.with(|rng| rng.borrow_mut().gen());
        SegmentId(format!("{id:016x}"))
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 16 || !is_hex(s) {
            return None;
        }
        Some(SegmentId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", self.0)
    }
}

/// 96 random bits as 24 hex characters, used for exception ids and the
/// sampling client id.
pub(crate) fn random_hex96() -> String {
    let random: [u8; 12] = CURRENT_RNG.with(|rng| rng.borrow_mut().gen());
    hex(&random)
}

/// 64 random bits as 16 hex characters.
pub(crate) fn random_hex64() -> String {
    let id: u64 = CURRENT_RNG.with(|rng| rng.borrow_mut().gen());
    format!("{id:016x}")
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}
