//! Instrumented wrappers for the host HTTP client.
//!
//! Each wrapper implements the same capability trait as the value it wraps
//! and always calls through with the original arguments, returning the
//! original result. Observation happens before or after the real call and
//! only while the instrumentation is installed and an invocation is running.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;

use crate::install::Instrumentation;
use crate::transport::{HttpConnection, Payload, RequestFactory, RequestParts, ResponseHandle};
use crate::wire::RequestTarget;

/// A connection whose writes and responses are recorded.
#[derive(Debug)]
pub struct InstrumentedConnection<C> {
    inner: C,
    instrumentation: Arc<Instrumentation>,
}

impl<C> InstrumentedConnection<C> {
    pub fn new(inner: C, instrumentation: Arc<Instrumentation>) -> Self {
        Self {
            inner,
            instrumentation,
        }
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: HttpConnection> InstrumentedConnection<C> {
    fn target(&self) -> RequestTarget {
        RequestTarget {
            host: self.inner.host().map(str::to_owned),
            method: self.inner.method().map(str::to_owned),
            http_version: self.inner.http_version().to_owned(),
        }
    }
}

impl<C: HttpConnection> HttpConnection for InstrumentedConnection<C> {
    type Response = InstrumentedResponse<C::Response>;

    fn host(&self) -> Option<&str> {
        self.inner.host()
    }

    fn method(&self) -> Option<&str> {
        self.inner.method()
    }

    fn http_version(&self) -> &str {
        self.inner.http_version()
    }

    fn send(&mut self, mut payload: Payload<'_>) -> io::Result<()> {
        let Some(interceptors) = self.instrumentation.interceptors() else {
            return self.inner.send(payload);
        };

        let target = self.target();
        let recorded = self
            .instrumentation
            .active()
            .with(|trace| interceptors.record_request(trace, &target, &mut payload));
        if let Some(Err(error)) = recorded {
            tracing::debug!(%error, "recorded outbound request as unparsed");
        }

        let sent = self.inner.send(payload);
        self.instrumentation
            .active()
            .with(|trace| trace.update_event_end_time());
        sent
    }

    fn get_response(&mut self) -> io::Result<Self::Response> {
        let response = self.inner.get_response()?;
        if let Some(interceptors) = self.instrumentation.interceptors() {
            let host = self.inner.host();
            self.instrumentation
                .active()
                .with(|trace| interceptors.record_response(trace, host, &response));
        }
        Ok(InstrumentedResponse {
            inner: response,
            instrumentation: Arc::clone(&self.instrumentation),
        })
    }
}

/// A response whose body is recorded as the caller reads it.
#[derive(Debug)]
pub struct InstrumentedResponse<R> {
    inner: R,
    instrumentation: Arc<Instrumentation>,
}

impl<R> InstrumentedResponse<R> {
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: ResponseHandle> ResponseHandle for InstrumentedResponse<R> {
    fn status(&self) -> u16 {
        self.inner.status()
    }

    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn read(&mut self, limit: Option<usize>) -> io::Result<Bytes> {
        let body = self.inner.read(limit)?;
        if let Some(interceptors) = self.instrumentation.interceptors() {
            let inner = &self.inner;
            self.instrumentation
                .active()
                .with(|trace| interceptors.record_body(trace, inner, &body));
        }
        Ok(body)
    }
}

/// A request factory that adds the trace-propagation header.
#[derive(Debug)]
pub struct InstrumentedRequestFactory<F> {
    inner: F,
    instrumentation: Arc<Instrumentation>,
}

impl<F> InstrumentedRequestFactory<F> {
    pub fn new(inner: F, instrumentation: Arc<Instrumentation>) -> Self {
        Self {
            inner,
            instrumentation,
        }
    }
}

impl<F: RequestFactory> RequestFactory for InstrumentedRequestFactory<F> {
    type Request = F::Request;

    fn build(&self, mut parts: RequestParts) -> Self::Request {
        if let Some(interceptors) = self.instrumentation.interceptors() {
            let injected = self
                .instrumentation
                .active()
                .with(|trace| interceptors.inject_trace_header(trace, parts.headers.as_mut()));
            if let Some(Err(error)) = injected {
                tracing::debug!(%error, "skipped trace header injection");
            }
        }
        self.inner.build(parts)
    }
}
