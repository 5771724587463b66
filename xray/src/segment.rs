//! The segment tree.
//!
//! A root segment owns a tree of subsegments. Parents own children; children
//! keep weak back-references for counter updates, so a tree that the
//! application abandons cannot keep itself alive. Closing is idempotent, and
//! the root is emitted exactly once, when it and every descendant under it
//! have closed.
//!
//! Long-lived roots do not accumulate unbounded state: once enough closed
//! subtrees pile up under an open root, each further one is emitted on its
//! own as a `type:"subsegment"` document and detached from the tree.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{json, Map, Value};
use tracing::{debug, error};

use crate::config::ContextMissingStrategy;
use crate::context::{Context, Slot};
use crate::exception;
use crate::header::{SampleDecision, TraceHeader};
use crate::id::{epoch_seconds, SegmentId, TraceId};
use crate::recorder::RecorderInner;
use crate::schema::{
    AnnotationValue, Http, HttpRequest, HttpResponse, SegmentDocument, Sql,
};
use crate::service::service_record;

/// Names longer than this are cut; the service rejects oversized names.
const MAX_NAME_LEN: usize = 200;

/// Annotation key carrying the count of segments lost to backpressure.
const DROPPED_ANNOTATION: &str = "dropped_segments";

/// A handle to a segment or subsegment.
///
/// Handles may be freely cloned; all clones refer to the same node. A
/// disconnected handle (from a begin without an open parent, or with the SDK
/// disabled) accepts every operation as a no-op, so instrumentation never
/// needs to branch.
#[derive(Clone)]
pub struct Segment {
    inner: Option<Arc<SegmentInner>>,
}

pub(crate) struct SegmentInner {
    recorder: Arc<RecorderInner>,
    id: SegmentId,
    trace_id: TraceId,
    name: String,
    start_time: f64,
    /// Tree parent. `None` marks the root.
    parent: Option<Weak<SegmentInner>>,
    /// The root of this tree; for the root, a weak self-reference.
    root: Weak<SegmentInner>,
    /// The trace decision, fixed at root creation.
    sampled: bool,
    /// Name of the sampling rule that decided, root only.
    rule: Option<String>,
    /// Parent id adopted from the incoming trace header, root only.
    inherited_parent: Option<SegmentId>,
    /// Fully closed subtrees accumulated while the root stays open.
    closed_subtrees: AtomicUsize,
    emitted: AtomicBool,
    state: Mutex<Fields>,
}

#[derive(Default)]
struct Fields {
    end_time: Option<f64>,
    open_children: usize,
    children: Vec<Arc<SegmentInner>>,
    /// Set when close arrives while descendants are still open.
    closed_while_streaming: bool,
    namespace: Option<String>,
    user: Option<String>,
    origin: Option<String>,
    error: bool,
    fault: bool,
    throttle: bool,
    http: Option<Http>,
    aws: Option<Map<String, Value>>,
    sql: Option<Sql>,
    cause: Option<crate::schema::Cause>,
    annotations: BTreeMap<String, AnnotationValue>,
    metadata: BTreeMap<String, BTreeMap<String, Value>>,
}

fn truncate_name(name: &str) -> String {
    if name.chars().count() <= MAX_NAME_LEN {
        name.to_string()
    } else {
        name.chars().take(MAX_NAME_LEN).collect()
    }
}

impl SegmentInner {
    pub(crate) fn new_root(
        recorder: Arc<RecorderInner>,
        name: &str,
        trace_id: TraceId,
        inherited_parent: Option<SegmentId>,
        sampled: bool,
        rule: Option<String>,
    ) -> Arc<SegmentInner> {
        let plugins = crate::plugin::snapshot();
        let fields = Fields {
            origin: plugins.origin,
            aws: if plugins.aws.is_empty() {
                None
            } else {
                Some(plugins.aws)
            },
            ..Fields::default()
        };
        Arc::new_cyclic(|weak| SegmentInner {
            recorder,
            id: SegmentId::generate(),
            trace_id,
            name: truncate_name(name),
            start_time: epoch_seconds(),
            parent: None,
            root: weak.clone(),
            sampled,
            rule,
            inherited_parent,
            closed_subtrees: AtomicUsize::new(0),
            emitted: AtomicBool::new(false),
            state: Mutex::new(fields),
        })
    }

    fn new_child(parent: &Arc<SegmentInner>, name: &str) -> Arc<SegmentInner> {
        Arc::new(SegmentInner {
            recorder: Arc::clone(&parent.recorder),
            id: SegmentId::generate(),
            trace_id: parent.trace_id.clone(),
            name: truncate_name(name),
            start_time: epoch_seconds(),
            parent: Some(Arc::downgrade(parent)),
            root: parent.root.clone(),
            sampled: false,
            rule: None,
            inherited_parent: None,
            closed_subtrees: AtomicUsize::new(0),
            emitted: AtomicBool::new(false),
            state: Mutex::new(Fields::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Fields> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against the mutable fields of an open segment. Returns
    /// `None`, doing nothing, once the segment has closed.
    fn with_fields<T>(&self, f: impl FnOnce(&mut Fields) -> T) -> Option<T> {
        let mut fields = self.lock();
        if fields.end_time.is_some() {
            return None;
        }
        Some(f(&mut fields))
    }

    pub(crate) fn id(&self) -> &SegmentId {
        &self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().end_time.is_some()
    }

    fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    fn root(&self) -> Option<Arc<SegmentInner>> {
        self.root.upgrade()
    }

    fn sampled(&self) -> bool {
        self.root().map(|root| root.sampled).unwrap_or(false)
    }

    fn close(self: &Arc<Self>) {
        let fully_closed = {
            let mut fields = self.lock();
            if fields.end_time.is_some() {
                return;
            }
            fields.end_time = Some(epoch_seconds());
            if fields.open_children > 0 {
                fields.closed_while_streaming = true;
                debug!(id = %self.id, "segment closed before its subsegments, still streaming");
            }
            fields.open_children == 0
        };
        if fully_closed {
            self.on_fully_closed();
        }
    }

    /// Walks up from a segment whose whole subtree just closed, releasing
    /// parents and emitting the root once nothing under it stays open.
    fn on_fully_closed(self: &Arc<Self>) {
        let mut node = Arc::clone(self);
        loop {
            if node.is_root() {
                node.emit_root();
                return;
            }
            node.maybe_stream();
            let Some(parent) = node.parent.as_ref().and_then(Weak::upgrade) else {
                return;
            };
            let parent_fully_closed = {
                let mut fields = parent.lock();
                fields.open_children = fields.open_children.saturating_sub(1);
                let fully = fields.end_time.is_some() && fields.open_children == 0;
                if fully && fields.closed_while_streaming {
                    debug!(id = %parent.id, "streaming subtree completed");
                }
                fully
            };
            if !parent_fully_closed {
                return;
            }
            node = parent;
        }
    }

    /// Emits this closed subtree on its own when the root has been open long
    /// enough to pile up more closed subtrees than the streaming threshold.
    fn maybe_stream(self: &Arc<Self>) {
        let Some(root) = self.root() else { return };
        if !root.sampled || root.is_closed() || root.emitted.load(Ordering::SeqCst) {
            return;
        }
        let count = root.closed_subtrees.fetch_add(1, Ordering::SeqCst) + 1;
        if count <= self.recorder.streaming_threshold {
            return;
        }
        let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        parent.lock().children.retain(|child| !Arc::ptr_eq(child, self));

        let mut doc = self.to_document();
        doc.segment_type = Some("subsegment".to_string());
        doc.trace_id = Some(root.trace_id.to_string());
        doc.parent_id = Some(parent.id.to_string());
        debug!(id = %self.id, "streaming closed subtree");
        self.recorder.emitter.submit(doc);
    }

    fn emit_root(self: &Arc<Self>) {
        if self.emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.sampled {
            return;
        }
        let mut doc = self.to_document();
        doc.trace_id = Some(self.trace_id.to_string());
        doc.parent_id = self.inherited_parent.as_ref().map(|id| id.to_string());
        doc.service = Some(service_record().clone());
        if let Some(rule) = &self.rule {
            doc.aws
                .get_or_insert_with(Map::new)
                .insert("xray".to_string(), json!({ "sampling_rule_name": rule }));
        }
        let carried = self.recorder.emitter.take_dropped();
        if carried > 0 {
            doc.annotations
                .insert(DROPPED_ANNOTATION.to_string(), carried.into());
        }
        if !self.recorder.emitter.submit(doc) {
            self.recorder.emitter.restore_dropped(carried);
        }
    }

    /// Snapshots this node and its current subtree into a wire document.
    pub(crate) fn to_document(&self) -> SegmentDocument {
        let (mut doc, children) = {
            let fields = self.lock();
            let doc = SegmentDocument {
                name: self.name.clone(),
                id: self.id.to_string(),
                start_time: self.start_time,
                end_time: fields.end_time,
                in_progress: fields.end_time.is_none(),
                namespace: fields.namespace.clone(),
                user: fields.user.clone(),
                origin: fields.origin.clone(),
                error: fields.error,
                fault: fields.fault,
                throttle: fields.throttle,
                http: fields.http.clone(),
                aws: fields.aws.clone(),
                sql: fields.sql.clone(),
                cause: fields.cause.clone(),
                annotations: fields.annotations.clone(),
                metadata: fields.metadata.clone(),
                ..SegmentDocument::default()
            };
            (doc, fields.children.clone())
        };
        doc.subsegments = children.iter().map(|child| child.to_document()).collect();
        doc
    }
}

/// Begins a subsegment under the innermost open segment of `cx`.
///
/// Without an open parent the behavior follows `AWS_XRAY_CONTEXT_MISSING`,
/// and the returned handle is a disconnected no-op either way.
pub fn begin_subsegment(cx: &Context, name: &str) -> (Context, Segment) {
    begin_subsegment_with_strategy(cx, name, ContextMissingStrategy::from_env())
}

pub(crate) fn begin_subsegment_with_strategy(
    cx: &Context,
    name: &str,
    missing: ContextMissingStrategy,
) -> (Context, Segment) {
    let parent = match &cx.slot {
        Slot::Segment(parent) => parent,
        Slot::Disabled => return (cx.clone(), Segment::noop()),
        Slot::Empty => {
            handle_context_missing(missing, name);
            return (cx.clone(), Segment::noop());
        }
    };

    let child = parent.with_fields(|fields| {
        let child = SegmentInner::new_child(parent, name);
        fields.children.push(Arc::clone(&child));
        fields.open_children += 1;
        child
    });
    match child {
        Some(child) => (
            Context::with_segment(Arc::clone(&child)),
            Segment::attached(child),
        ),
        None => {
            debug!(name, "parent segment already closed, subsegment is a no-op");
            (cx.clone(), Segment::noop())
        }
    }
}

fn handle_context_missing(strategy: ContextMissingStrategy, name: &str) {
    match strategy {
        ContextMissingStrategy::RuntimeError => {
            panic!("cannot begin subsegment {name:?}: no segment found in context")
        }
        ContextMissingStrategy::LogError => {
            error!(name, "cannot begin subsegment: no segment found in context")
        }
        ContextMissingStrategy::IgnoreError => {}
    }
}

impl Segment {
    pub(crate) fn attached(inner: Arc<SegmentInner>) -> Segment {
        Segment { inner: Some(inner) }
    }

    /// A disconnected handle. Every operation is a no-op.
    pub fn noop() -> Segment {
        Segment { inner: None }
    }

    /// True for handles not connected to a trace.
    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Closes the segment. The first call fixes the end time; later calls do
    /// nothing. Closing the last open node of a sampled tree emits the root.
    pub fn close(&self) {
        if let Some(inner) = &self.inner {
            inner.close();
        }
    }

    /// The trace id shared by the whole tree.
    pub fn trace_id(&self) -> Option<TraceId> {
        self.inner.as_ref().map(|inner| inner.trace_id.clone())
    }

    pub fn id(&self) -> Option<SegmentId> {
        self.inner.as_ref().map(|inner| inner.id.clone())
    }

    /// The root's sampling decision; subsegments inherit it.
    pub fn sampled(&self) -> bool {
        self.inner.as_ref().map(|inner| inner.sampled()).unwrap_or(false)
    }

    pub fn in_progress(&self) -> bool {
        self.inner.as_ref().map(|inner| !inner.is_closed()).unwrap_or(false)
    }

    /// A context carrying this segment, for handing to downstream helpers.
    pub fn context(&self) -> Context {
        match &self.inner {
            Some(inner) => Context::with_segment(Arc::clone(inner)),
            None => Context::new(),
        }
    }

    /// The header value to send downstream from this segment.
    pub fn downstream_header(&self) -> TraceHeader {
        let Some(inner) = &self.inner else {
            return TraceHeader::default();
        };
        TraceHeader {
            root: Some(inner.trace_id.clone()),
            parent: Some(inner.id.clone()),
            sampled: if inner.sampled() {
                SampleDecision::Sampled
            } else {
                SampleDecision::NotSampled
            },
            extra: Vec::new(),
        }
    }

    fn with_fields(&self, f: impl FnOnce(&mut Fields)) {
        if let Some(inner) = &self.inner {
            if inner.with_fields(f).is_none() {
                debug!(id = %inner.id, "mutation on closed segment ignored");
            }
        }
    }

    pub fn set_error(&self) {
        self.with_fields(|fields| fields.error = true);
    }

    pub fn set_fault(&self) {
        self.with_fields(|fields| fields.fault = true);
    }

    pub fn set_throttle(&self) {
        self.with_fields(|fields| fields.throttle = true);
    }

    /// Captures an error chain as this segment's cause and marks the fault
    /// flag.
    pub fn add_error<E>(&self, err: &E)
    where
        E: std::error::Error + ?Sized,
    {
        let cause = exception::capture(err, false);
        self.with_fields(|fields| {
            fields.fault = true;
            fields.cause = Some(cause);
        });
    }

    /// Like [`Segment::add_error`], for failures reported by a downstream
    /// service.
    pub fn add_remote_error<E>(&self, err: &E)
    where
        E: std::error::Error + ?Sized,
    {
        let cause = exception::capture(err, true);
        self.with_fields(|fields| {
            fields.fault = true;
            fields.cause = Some(cause);
        });
    }

    /// Records a scalar annotation. The value type admits only what the
    /// service can index: strings, booleans and numbers.
    pub fn add_annotation(&self, key: impl Into<String>, value: impl Into<AnnotationValue>) {
        let key = key.into();
        let value = value.into();
        self.with_fields(|fields| {
            fields.annotations.insert(key, value);
        });
    }

    /// Records metadata under the `default` namespace.
    pub fn add_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.add_metadata_to_namespace("default", key, value);
    }

    pub fn add_metadata_to_namespace(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) {
        let namespace = namespace.into();
        let key = key.into();
        let value = value.into();
        self.with_fields(|fields| {
            fields.metadata.entry(namespace).or_default().insert(key, value);
        });
    }

    pub fn set_http_request(&self, request: HttpRequest) {
        self.with_fields(|fields| {
            fields.http.get_or_insert_with(Http::default).request = Some(request);
        });
    }

    /// Records the response and derives the status flags: 4xx raises
    /// `error`, 429 also raises `throttle`, 5xx raises `fault`.
    pub fn set_http_response(&self, status: u16, content_length: Option<u64>) {
        self.with_fields(|fields| {
            fields.http.get_or_insert_with(Http::default).response = Some(HttpResponse {
                status: Some(status),
                content_length,
            });
            match status {
                429 => {
                    fields.error = true;
                    fields.throttle = true;
                }
                400..=499 => fields.error = true,
                500..=599 => fields.fault = true,
                _ => {}
            }
        });
    }

    pub fn set_sql(&self, sql: Sql) {
        self.with_fields(|fields| fields.sql = Some(sql));
    }

    /// Merges entries into the segment's `aws` map.
    pub fn set_aws(&self, entries: Map<String, Value>) {
        self.with_fields(|fields| {
            fields.aws.get_or_insert_with(Map::new).extend(entries);
        });
    }

    pub fn set_namespace(&self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        self.with_fields(|fields| fields.namespace = Some(namespace));
    }

    pub fn set_user(&self, user: impl Into<String>) {
        let user = user.into();
        self.with_fields(|fields| fields.user = Some(user));
    }

    /// Sets the origin. Only meaningful on roots; ignored elsewhere.
    pub fn set_origin(&self, origin: impl Into<String>) {
        let Some(inner) = &self.inner else { return };
        if !inner.is_root() {
            debug!(id = %inner.id, "origin is a root attribute, ignored on subsegment");
            return;
        }
        let origin = origin.into();
        self.with_fields(|fields| fields.origin = Some(origin));
    }

    #[cfg(test)]
    pub(crate) fn document(&self) -> Option<SegmentDocument> {
        self.inner.as_ref().map(|inner| inner.to_document())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("Segment")
                .field("id", &inner.id)
                .field("trace_id", &inner.trace_id)
                .field("name", &inner.name)
                .finish(),
            None => f.write_str("Segment(noop)"),
        }
    }
}
