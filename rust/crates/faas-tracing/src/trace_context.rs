//! The per-invocation record of every intercepted request.
//!
//! Interceptors never hold on to records; they hand them to the active
//! [`TraceContext`], which owns all event state until the invocation ends.
//! Requests and responses are correlated by position: the most recently
//! opened event receives the next response or body. A write that cannot be
//! parsed extends that event's request body while it still awaits a
//! response from the same host.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry::Context;
use opentelemetry_aws::trace::XrayPropagator;
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};

use crate::error::TraceError;
use crate::lifecycle::InvocationMeta;
use crate::record::{HttpRequestRecord, HttpResponseRecord, Outcome};
use crate::report::Reporter;

/// The environment variable the serverless runtime sets to the upstream
/// trace header.
pub const TRACE_HEADER_VAR: &str = "_X_AMZN_TRACE_ID";

/// The trace-recording collaborator fed by the interceptors.
pub trait TraceContext: Send {
    /// Marks the start of the invocation.
    fn start(&mut self);

    /// Marks the end of the invocation with its outcome.
    fn end(&mut self, outcome: Outcome);

    /// Opens a new event for a request whose header block was parsed.
    fn add_request_event(&mut self, request: HttpRequestRecord) -> EventHandle;

    /// Records a write we could not parse. A write to the same host as the
    /// open event, before any response arrived, continues that request's
    /// body; anything else opens a new event.
    fn add_unparsed_request(&mut self, request: HttpRequestRecord) -> EventHandle;

    /// Marks the end of the request phase of the open event.
    fn update_event_end_time(&mut self);

    /// Attaches a response to the open event. An empty body leaves the event
    /// open; a non-empty body closes it. Does nothing if no event is open.
    fn update_event_response(
        &mut self,
        host: Option<&str>,
        status: u16,
        headers: &HeaderMap,
        body: &Bytes,
    );

    fn add_exception_event(&mut self, error: &dyn fmt::Display);

    /// The trace header value to propagate to downstream services.
    fn get_patched_root(&self) -> String;
}

/// Creates a trace context at the start of each invocation.
pub trait TraceFactory: Send + Sync {
    fn create(&self, meta: &InvocationMeta) -> Result<Box<dyn TraceContext>, TraceError>;
}

impl<F> TraceFactory for F
where
    F: Fn(&InvocationMeta) -> Result<Box<dyn TraceContext>, TraceError> + Send + Sync,
{
    fn create(&self, meta: &InvocationMeta) -> Result<Box<dyn TraceContext>, TraceError> {
        self(meta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EventState {
    #[display(fmt = "open")]
    Open,
    #[display(fmt = "response attached")]
    ResponseAttached,
    #[display(fmt = "closed")]
    Closed,
}

/// Identifies an event within its invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle(usize);

impl EventHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One outbound request and, once available, its response.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub request: HttpRequestRecord,
    /// `false` for continuation writes and anything we could not parse.
    pub parsed: bool,
    pub response: Option<HttpResponseRecord>,
    pub state: EventState,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
}

/// The lower-cased name of the X-Ray tracing header.
const XRAY_HEADER: &str = "x-amzn-trace-id";

/// The X-Ray trace an invocation belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRoot {
    context: SpanContext,
}

impl TraceRoot {
    /// Extracts the upstream trace from a `Root=...;Parent=...;Sampled=...`
    /// header. The parent is kept only as the remote context: every
    /// invocation propagates its own span id.
    pub fn from_header(value: &str) -> Result<Self, TraceError> {
        let carrier = HashMap::from([(XRAY_HEADER.to_owned(), value.to_owned())]);
        let cx = XrayPropagator::new().extract(&carrier);
        let context = cx.span().span_context().clone();
        if context.trace_id() == TraceId::INVALID {
            return Err(TraceError::MalformedTraceHeader {
                value: value.to_owned(),
                reason: "no valid X-Ray Root",
            });
        }
        Ok(Self { context })
    }

    /// Generates a fresh, sampled root for an invocation with no upstream
    /// trace. The first four bytes of the trace id carry the epoch seconds.
    pub fn generate(generator: &impl IdGenerator) -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        let mut bytes = generator.new_trace_id().to_bytes();
        bytes[..4].copy_from_slice(&u32::try_from(epoch).unwrap_or(u32::MAX).to_be_bytes());
        Self {
            context: SpanContext::new(
                TraceId::from_bytes(bytes),
                SpanId::INVALID,
                TraceFlags::SAMPLED,
                false,
                TraceState::default(),
            ),
        }
    }

    /// The root in X-Ray form, `1-<8 hex digit epoch>-<24 hex digits>`.
    pub fn root(&self) -> String {
        let hex = format!("{:032x}", self.context.trace_id());
        format!("1-{}-{}", &hex[..8], &hex[8..])
    }

    pub fn is_sampled(&self) -> bool {
        self.context.is_sampled()
    }

    pub fn span_context(&self) -> &SpanContext {
        &self.context
    }

    /// The header value that makes `span_id` the parent of downstream calls.
    pub fn header_for(&self, span_id: SpanId) -> String {
        let context = SpanContext::new(
            self.context.trace_id(),
            span_id,
            self.context.trace_flags(),
            false,
            self.context.trace_state().clone(),
        );
        let mut carrier: HashMap<String, String> = HashMap::new();
        XrayPropagator::new().inject_context(
            &Context::new().with_remote_span_context(context),
            &mut carrier,
        );
        carrier.remove(XRAY_HEADER).unwrap_or_default()
    }
}

/// The default trace context: keeps everything in memory and hands the
/// finished invocation to a [`Reporter`].
#[derive(Debug, Clone)]
pub struct InvocationTrace {
    request_id: Option<String>,
    root: TraceRoot,
    span_id: SpanId,
    started_at: Option<SystemTime>,
    ended_at: Option<SystemTime>,
    outcome: Option<Outcome>,
    events: Vec<Event>,
    exceptions: Vec<String>,
    reporter: Option<Arc<dyn Reporter>>,
}

impl InvocationTrace {
    pub fn new(meta: &InvocationMeta, root: TraceRoot, span_id: SpanId) -> Self {
        Self {
            request_id: meta.request_id.clone(),
            root,
            span_id,
            started_at: None,
            ended_at: None,
            outcome: None,
            events: Vec::new(),
            exceptions: Vec::new(),
            reporter: None,
        }
    }

    pub fn with_reporter(self, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            reporter: Some(reporter),
            ..self
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn root(&self) -> &TraceRoot {
        &self.root
    }

    /// The span id this invocation propagates as the parent.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<SystemTime> {
        self.ended_at
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn exceptions(&self) -> &[String] {
        &self.exceptions
    }

    fn open_event(&mut self, request: HttpRequestRecord, parsed: bool) -> EventHandle {
        self.events.push(Event {
            request,
            parsed,
            response: None,
            state: EventState::Open,
            started_at: SystemTime::now(),
            ended_at: None,
        });
        EventHandle(self.events.len() - 1)
    }

    /// The most recently opened event, unless it is already closed.
    fn current_event(&mut self) -> Option<&mut Event> {
        self.events
            .last_mut()
            .filter(|event| event.state != EventState::Closed)
    }
}

impl TraceContext for InvocationTrace {
    fn start(&mut self) {
        self.started_at = Some(SystemTime::now());
    }

    fn end(&mut self, outcome: Outcome) {
        self.ended_at = Some(SystemTime::now());
        self.outcome = Some(outcome);
        if let Some(reporter) = &self.reporter {
            reporter.report(self);
        }
    }

    fn add_request_event(&mut self, request: HttpRequestRecord) -> EventHandle {
        self.open_event(request, true)
    }

    fn add_unparsed_request(&mut self, request: HttpRequestRecord) -> EventHandle {
        let continues_request = self.current_event().is_some_and(|event| {
            event.response.is_none() && event.request.host == request.host
        });
        if !continues_request {
            return self.open_event(request, false);
        }

        let index = self.events.len() - 1;
        let event = &mut self.events[index];
        let mut body = BytesMut::from(&event.request.body[..]);
        body.extend_from_slice(&request.body);
        event.request.body = body.freeze();
        EventHandle(index)
    }

    fn update_event_end_time(&mut self) {
        if let Some(event) = self.current_event() {
            event.ended_at = Some(SystemTime::now());
        }
    }

    fn update_event_response(
        &mut self,
        host: Option<&str>,
        status: u16,
        headers: &HeaderMap,
        body: &Bytes,
    ) {
        let Some(event) = self.current_event() else {
            tracing::debug!(status, "no open event for response");
            return;
        };
        if let Some(host) = host.filter(|_| event.request.host.is_empty()) {
            host.clone_into(&mut event.request.host);
        }
        event.response = Some(HttpResponseRecord {
            status,
            headers: headers.clone(),
            body: body.clone(),
        });
        if body.is_empty() {
            event.state = EventState::ResponseAttached;
        } else {
            event.state = EventState::Closed;
            event.ended_at = Some(SystemTime::now());
        }
    }

    fn add_exception_event(&mut self, error: &dyn fmt::Display) {
        self.exceptions.push(error.to_string());
    }

    fn get_patched_root(&self) -> String {
        self.root.header_for(self.span_id)
    }
}

/// Builds an [`InvocationTrace`] per invocation, continuing the upstream
/// trace from [`TRACE_HEADER_VAR`] when it is set.
#[derive(Debug, Clone, Default)]
pub struct InvocationTraceFactory {
    reporter: Option<Arc<dyn Reporter>>,
}

impl InvocationTraceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter(reporter: impl Reporter + 'static) -> Self {
        Self {
            reporter: Some(Arc::new(reporter)),
        }
    }
}

impl TraceFactory for InvocationTraceFactory {
    fn create(&self, meta: &InvocationMeta) -> Result<Box<dyn TraceContext>, TraceError> {
        let generator = RandomIdGenerator::default();
        let root = match env::var(TRACE_HEADER_VAR) {
            Ok(header) if !header.is_empty() => TraceRoot::from_header(&header)?,
            _ => TraceRoot::generate(&generator),
        };
        let trace = InvocationTrace::new(meta, root, generator.new_span_id());
        Ok(Box::new(match &self.reporter {
            Some(reporter) => trace.with_reporter(Arc::clone(reporter)),
            None => trace,
        }))
    }
}
