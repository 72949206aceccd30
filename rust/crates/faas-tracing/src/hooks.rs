//! The observation steps run at each interception point.
//!
//! Each step reads what the real call is about to send or has just returned
//! and forwards a record to the active trace. None of them changes what the
//! real call sees; the request-construction step only adds one header.

use bytes::Bytes;
use http::{HeaderMap, HeaderName};
use opentelemetry::propagation::Injector;
use opentelemetry_http::HeaderInjector;

use crate::config::TracerConfig;
use crate::error::{HookError, InstallError};
use crate::trace_context::TraceContext;
use crate::transport::{Payload, ResponseHandle};
use crate::wire::{self, RequestTarget, WireRequest};

/// The configured observation steps, created once at installation.
#[derive(Debug, Clone)]
pub struct Interceptors {
    propagation_header: HeaderName,
}

impl Interceptors {
    pub fn new(config: &TracerConfig) -> Result<Self, InstallError> {
        let propagation_header = HeaderName::from_bytes(config.propagation_header.as_bytes())
            .map_err(|_| InstallError::InvalidPropagationHeader(config.propagation_header.clone()))?;
        Ok(Self { propagation_header })
    }

    pub fn propagation_header(&self) -> &HeaderName {
        &self.propagation_header
    }

    /// Sets the trace-propagation header on a request that is being built.
    pub fn inject_trace_header(
        &self,
        trace: &dyn TraceContext,
        headers: Option<&mut HeaderMap>,
    ) -> Result<(), HookError> {
        let headers = headers.ok_or(HookError::MissingHeaders)?;
        let value = trace.get_patched_root();
        HeaderInjector(&mut *headers).set(self.propagation_header.as_str(), value.clone());
        match headers.get(&self.propagation_header) {
            Some(injected) if injected == value.as_str() => Ok(()),
            _ => Err(HookError::RejectedPropagationValue(value)),
        }
    }

    /// Opens an event for an outbound write. Anything that goes wrong degrades
    /// to an unparsed record; the error is returned for logging.
    pub fn record_request(
        &self,
        trace: &mut dyn TraceContext,
        target: &RequestTarget,
        payload: &mut Payload<'_>,
    ) -> Result<(), HookError> {
        let data = match payload.peek() {
            Ok(data) => data,
            Err(error) => {
                trace.add_unparsed_request(wire::unparsed_request(&[], target));
                return Err(error.into());
            }
        };
        match wire::capture_request(&data, target) {
            WireRequest::Parsed(record) => trace.add_request_event(record),
            WireRequest::Unparsed(record) => trace.add_unparsed_request(record),
        };
        Ok(())
    }

    /// Attaches the response head to the open event. Never touches the body.
    pub fn record_response(
        &self,
        trace: &mut dyn TraceContext,
        host: Option<&str>,
        response: &impl ResponseHandle,
    ) {
        trace.update_event_response(host, response.status(), response.headers(), &Bytes::new());
    }

    /// Closes the open event with a body the caller has just read.
    pub fn record_body(
        &self,
        trace: &mut dyn TraceContext,
        response: &impl ResponseHandle,
        body: &Bytes,
    ) {
        if body.is_empty() {
            return;
        }
        trace.update_event_response(None, response.status(), response.headers(), body);
    }
}
