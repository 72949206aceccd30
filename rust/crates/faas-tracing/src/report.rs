//! Exports finished invocations as OpenTelemetry spans.

use std::fmt;
use std::time::SystemTime;

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{Span, SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_semantic_conventions as semcov;

use crate::record::Outcome;
use crate::trace_context::{Event, InvocationTrace};

/// Receives each invocation once it has ended.
pub trait Reporter: fmt::Debug + Send + Sync {
    fn report(&self, trace: &InvocationTrace);
}

/// Reports an invocation as a server span with one client span per
/// intercepted request.
pub struct OtelReporter<T> {
    tracer: T,
}

impl OtelReporter<BoxedTracer> {
    /// Reports through the global tracer provider, as installed by
    /// [`crate::setup::init_tracing`].
    pub fn global() -> Self {
        Self::new(global::tracer(env!("CARGO_PKG_NAME")))
    }
}

impl<T> OtelReporter<T> {
    pub fn new(tracer: T) -> Self {
        Self { tracer }
    }
}

impl<T> fmt::Debug for OtelReporter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelReporter").finish_non_exhaustive()
    }
}

impl<T> Reporter for OtelReporter<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    fn report(&self, trace: &InvocationTrace) {
        let end = trace.ended_at().unwrap_or_else(SystemTime::now);

        let mut attributes = vec![KeyValue::new(
            "aws.xray.trace_root",
            trace.root().root(),
        )];
        if let Some(request_id) = trace.request_id() {
            attributes.push(KeyValue::new(
                semcov::trace::FAAS_INVOCATION_ID,
                request_id.to_owned(),
            ));
        }

        let mut span = self
            .tracer
            .span_builder("invocation")
            .with_kind(SpanKind::Server)
            .with_start_time(trace.started_at().unwrap_or(end))
            .with_attributes(attributes)
            .start(&self.tracer);
        for message in trace.exceptions() {
            span.add_event(
                "exception",
                vec![KeyValue::new(
                    semcov::trace::EXCEPTION_MESSAGE,
                    message.clone(),
                )],
            );
        }
        if let Some(Outcome::Raised(message)) = trace.outcome() {
            span.set_status(Status::error(message.clone()));
        }

        let cx = Context::current_with_span(span);
        for event in trace.events() {
            self.report_event(&cx, event, end);
        }
        cx.span().end_with_timestamp(end);
    }
}

impl<T> OtelReporter<T>
where
    T: Tracer,
{
    fn report_event(&self, cx: &Context, event: &Event, invocation_end: SystemTime) {
        let request = &event.request;
        let mut attributes = vec![
            KeyValue::new(semcov::trace::HTTP_REQUEST_METHOD, request.method.clone()),
            KeyValue::new(semcov::trace::SERVER_ADDRESS, request.host.clone()),
            KeyValue::new("faas_tracing.request.parsed", event.parsed),
            KeyValue::new("faas_tracing.event.state", event.state.to_string()),
        ];
        if !request.uri.is_empty() {
            attributes.push(KeyValue::new(semcov::trace::URL_FULL, request.uri.clone()));
        }
        if let Some(response) = &event.response {
            attributes.push(KeyValue::new(
                semcov::trace::HTTP_RESPONSE_STATUS_CODE,
                i64::from(response.status),
            ));
        }

        let name = if request.host.is_empty() {
            request.method.clone()
        } else {
            format!("{} {}", request.method, request.host)
        };
        let mut span = self
            .tracer
            .span_builder(name)
            .with_kind(SpanKind::Client)
            .with_start_time(event.started_at)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, cx);
        if let Some(response) = event.response.as_ref().filter(|r| r.status >= 400) {
            span.set_status(Status::error(response.status.to_string()));
        }
        span.end_with_timestamp(event.ended_at.unwrap_or(invocation_end));
    }
}
