//! The recorder ties the pieces together: it resolves the daemon endpoints,
//! owns the emitter and the sampling strategy, and begins root segments.

use std::sync::Arc;

use crate::config::{self, DaemonEndpoints};
use crate::context::Context;
use crate::emitter::Emitter;
use crate::error::XrayError;
use crate::header::{SampleDecision, TraceHeader};
use crate::id::TraceId;
use crate::sampling::{
    CentralizedStrategy, SamplingRequest, SamplingStrategy,
};
use crate::segment::{Segment, SegmentInner};

const DEFAULT_STREAMING_THRESHOLD: usize = 20;

/// Begins root segments and emits their trees to the daemon.
///
/// One recorder serves the whole process; it is cheap to clone and safe to
/// share.
#[derive(Clone, Debug)]
pub struct Recorder {
    pub(crate) inner: Arc<RecorderInner>,
}

pub(crate) struct RecorderInner {
    pub(crate) endpoints: DaemonEndpoints,
    pub(crate) emitter: Emitter,
    pub(crate) strategy: Box<dyn SamplingStrategy>,
    pub(crate) streaming_threshold: usize,
    pub(crate) enabled: bool,
}

impl std::fmt::Debug for RecorderInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("endpoints", &self.endpoints)
            .field("strategy", &self.strategy)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Configures and builds a [`Recorder`].
#[derive(Default)]
pub struct RecorderBuilder {
    daemon_address: Option<String>,
    strategy: Option<Box<dyn SamplingStrategy>>,
    streaming_threshold: Option<usize>,
}

impl RecorderBuilder {
    /// Overrides the daemon address, taking precedence over
    /// `AWS_XRAY_DAEMON_ADDRESS`. Accepts the same syntax.
    pub fn with_daemon_address(mut self, address: impl Into<String>) -> Self {
        self.daemon_address = Some(address.into());
        self
    }

    /// Replaces the sampling strategy. The default is a
    /// [`CentralizedStrategy`] against the resolved daemon.
    pub fn with_sampling_strategy<S>(mut self, strategy: S) -> Self
    where
        S: SamplingStrategy + 'static,
    {
        self.strategy = Some(Box::new(strategy));
        self
    }

    /// How many closed subtrees may pile up under an open root before they
    /// are emitted independently.
    pub fn with_streaming_threshold(mut self, threshold: usize) -> Self {
        self.streaming_threshold = Some(threshold);
        self
    }

    pub fn build(self) -> Result<Recorder, XrayError> {
        let endpoints = DaemonEndpoints::resolve(self.daemon_address.as_deref())?;
        let strategy: Box<dyn SamplingStrategy> = match self.strategy {
            Some(strategy) => strategy,
            None => Box::new(CentralizedStrategy::new(endpoints.tcp, None)?),
        };
        Ok(Recorder {
            inner: Arc::new(RecorderInner {
                endpoints,
                emitter: Emitter::new(endpoints.udp),
                strategy,
                streaming_threshold: self
                    .streaming_threshold
                    .unwrap_or(DEFAULT_STREAMING_THRESHOLD),
                enabled: config::sdk_enabled(),
            }),
        })
    }
}

impl Recorder {
    pub fn builder() -> RecorderBuilder {
        RecorderBuilder::default()
    }

    /// Builds a recorder with the default configuration.
    pub fn new() -> Result<Recorder, XrayError> {
        Recorder::builder().build()
    }

    /// Begins a root segment with a fresh trace id, sampling on the segment
    /// name alone.
    pub fn begin_segment(&self, cx: &Context, name: &str) -> (Context, Segment) {
        self.begin_segment_with_request(
            cx,
            name,
            None,
            &SamplingRequest::with_service_name(name),
        )
    }

    /// Begins a root segment. A header with a `Root` entry continues the
    /// upstream trace; a header decision of `0` or `1` is final, anything
    /// else asks the sampling strategy.
    pub fn begin_segment_with_request(
        &self,
        _cx: &Context,
        name: &str,
        header: Option<&TraceHeader>,
        request: &SamplingRequest,
    ) -> (Context, Segment) {
        if !self.inner.enabled {
            return (Context::disabled(), Segment::noop());
        }
        let (trace_id, inherited_parent) = match header.and_then(|h| h.root.clone()) {
            Some(root) => (root, header.and_then(|h| h.parent.clone())),
            None => (TraceId::generate(), None),
        };
        let (sampled, rule) = match header.map(|h| h.sampled) {
            Some(SampleDecision::Sampled) => (true, None),
            Some(SampleDecision::NotSampled) => (false, None),
            _ => {
                let decision = self.inner.strategy.should_trace(request);
                (decision.sampled, decision.rule)
            }
        };
        let root = SegmentInner::new_root(
            Arc::clone(&self.inner),
            name,
            trace_id,
            inherited_parent,
            sampled,
            rule,
        );
        (
            Context::with_segment(Arc::clone(&root)),
            Segment::attached(root),
        )
    }

    /// The resolved daemon endpoints.
    pub fn endpoints(&self) -> DaemonEndpoints {
        self.inner.endpoints
    }

    /// Stops the sampling strategy's background work. Pending datagrams are
    /// not flushed; the daemon owns durability.
    pub fn close(&self) {
        self.inner.strategy.close();
    }
}

#[cfg(test)]
pub(crate) fn test_recorder(
    sampled: bool,
    queue_capacity: usize,
    streaming_threshold: usize,
) -> (
    Recorder,
    crossbeam_channel::Receiver<Box<crate::schema::SegmentDocument>>,
) {
    use crate::sampling::{LocalStrategy, Manifest, ManifestRule};

    let manifest = Manifest {
        version: 2,
        default: Some(ManifestRule {
            fixed_target: Some(0),
            rate: if sampled { 1.0 } else { 0.0 },
            ..ManifestRule::default()
        }),
        rules: Vec::new(),
    };
    let strategy = LocalStrategy::new(Some(manifest)).expect("test manifest is valid");
    let (emitter, receiver) = Emitter::detached(queue_capacity);
    let recorder = Recorder {
        inner: Arc::new(RecorderInner {
            endpoints: DaemonEndpoints::default(),
            emitter,
            strategy: Box::new(strategy),
            streaming_threshold,
            enabled: true,
        }),
    };
    (recorder, receiver)
}
