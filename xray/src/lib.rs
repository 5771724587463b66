//! A client library for AWS X-Ray.
//!
//! The crate records units of work as trees of segments and subsegments,
//! decides which traces to keep through the service's centralized sampling
//! rules, and streams completed trees to a local X-Ray daemon as UDP
//! datagrams.
//!
//! # Getting started
//!
//! ```no_run
//! use xray::{Context, Recorder};
//!
//! fn main() -> Result<(), xray::XrayError> {
//!     let recorder = Recorder::new()?;
//!
//!     let (cx, segment) = recorder.begin_segment(&Context::new(), "my-service");
//!     let (_cx, subsegment) = xray::begin_subsegment(&cx, "compute");
//!     // ... do the work ...
//!     subsegment.close();
//!     segment.close();
//!     Ok(())
//! }
//! ```
//!
//! Instrumentation helpers (HTTP middleware, SQL wrappers, AWS clients) sit
//! on top of three operations: begin a segment or subsegment against a
//! [`Context`], annotate the returned [`Segment`] handle, close it. Handles
//! returned without an open parent are inert, so wrappers never need to
//! null-check.
//!
//! # Configuration
//!
//! | variable | effect |
//! |----------|--------|
//! | `AWS_XRAY_DAEMON_ADDRESS` | daemon endpoint(s), `host:port` or `tcp:host:port udp:host:port` |
//! | `AWS_XRAY_CONTEXT_MISSING` | `RUNTIME_ERROR` (default), `LOG_ERROR`, `IGNORE_ERROR` |
//! | `AWS_XRAY_TRACING_NAME` | default segment name for server middleware |
//! | `AWS_XRAY_SDK_ENABLED` | `false` turns every operation into a no-op |

mod config;
mod context;
mod emitter;
mod error;
mod exception;
mod header;
mod id;
pub mod plugin;
mod recorder;
pub mod sampling;
pub mod schema;
mod segment;
mod service;

pub use config::{ContextMissingStrategy, DaemonEndpoints};
pub use config::{tracing_name, ENV_CONTEXT_MISSING, ENV_DAEMON_ADDRESS, ENV_SDK_ENABLED, ENV_TRACING_NAME};
pub use context::Context;
pub use error::{ControlPlaneError, Result, XrayError};
pub use header::{SampleDecision, TraceHeader, TRACE_ID_HEADER};
pub use id::{SegmentId, TraceId};
pub use recorder::{Recorder, RecorderBuilder};
pub use sampling::{
    CentralizedStrategy, LocalStrategy, Manifest, ManifestRule, SamplingDecision, SamplingRequest,
    SamplingStrategy,
};
pub use schema::AnnotationValue;
pub use segment::{begin_subsegment, Segment};
