//! Sampling strategies.
//!
//! A strategy answers one question on the hot path: should this request be
//! traced? [`LocalStrategy`] answers from an in-process rule set;
//! [`CentralizedStrategy`] keeps that rule set synchronized with the service
//! control plane and enforces its reservoir quotas, falling back to the
//! local rules whenever the remote state is missing or stale.

use std::collections::HashMap;
use std::fmt;

pub(crate) mod api;
mod centralized;
mod local;
mod pattern;

pub use centralized::CentralizedStrategy;
pub use local::{LocalStrategy, Manifest, ManifestRule};

/// The request attributes a rule can match on. Unknown fields stay empty;
/// an empty field only matches wildcard patterns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SamplingRequest {
    /// Hostname from the request URL or `Host` header.
    pub host: String,
    /// HTTP method.
    pub method: String,
    /// Path portion of the request URL.
    pub url_path: String,
    /// Name the service uses to identify itself in segments.
    pub service_name: String,
    /// Origin the service reports, e.g. `AWS::EC2::Instance`.
    pub service_type: String,
    /// Free-form attributes matched against rule attribute globs.
    pub attributes: HashMap<String, String>,
}

impl SamplingRequest {
    /// A request that only carries the service name; everything else is
    /// matched by wildcards only.
    pub fn with_service_name(name: impl Into<String>) -> SamplingRequest {
        SamplingRequest {
            service_name: name.into(),
            ..SamplingRequest::default()
        }
    }
}

/// The outcome of a sampling check.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SamplingDecision {
    pub sampled: bool,
    /// Name of the rule that decided, for diagnostics.
    pub rule: Option<String>,
}

impl SamplingDecision {
    pub(crate) fn new(sampled: bool, rule: Option<String>) -> SamplingDecision {
        SamplingDecision { sampled, rule }
    }
}

/// Decides whether a request should be traced.
///
/// Implementations must be cheap and non-blocking: this runs inline with
/// request handling.
pub trait SamplingStrategy: Send + Sync + fmt::Debug {
    fn should_trace(&self, request: &SamplingRequest) -> SamplingDecision;

    /// Stops any background work. The default does nothing.
    fn close(&self) {}
}
