//! An in-memory HTTP client and a reporter that keeps every finished trace.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::HeaderMap;

use faas_tracing::report::Reporter;
use faas_tracing::trace_context::{InvocationTrace, InvocationTraceFactory};
use faas_tracing::transport::{
    HttpConnection, Payload, RequestFactory, RequestParts, ResponseHandle,
};
use faas_tracing::{Instrumentation, Tracer, TracerConfig};

/// A tracer with its own instrumentation, reporting into the returned
/// recorder.
pub fn tracer(config: TracerConfig) -> (Tracer, Arc<Instrumentation>, RecordingReporter) {
    let instrumentation = Arc::new(Instrumentation::new());
    let reporter = RecordingReporter::default();
    let tracer = Tracer::new(config)
        .with_instrumentation(Arc::clone(&instrumentation))
        .with_trace_factory(InvocationTraceFactory::with_reporter(reporter.clone()));
    (tracer, instrumentation, reporter)
}

#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    traces: Arc<Mutex<Vec<InvocationTrace>>>,
}

impl RecordingReporter {
    pub fn traces(&self) -> Vec<InvocationTrace> {
        self.traces.lock().unwrap().clone()
    }

    /// The only trace reported so far.
    pub fn single(&self) -> anyhow::Result<InvocationTrace> {
        match &self.traces()[..] {
            [trace] => Ok(trace.clone()),
            traces => anyhow::bail!("expected exactly one trace, got {}", traces.len()),
        }
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, trace: &InvocationTrace) {
        self.traces.lock().unwrap().push(trace.clone());
    }
}

/// A connection that keeps everything written to it and answers with a
/// canned response.
#[derive(Debug, Default)]
pub struct FakeConnection {
    host: Option<String>,
    method: Option<String>,
    pub sent: Vec<Vec<u8>>,
    response: Option<FakeResponse>,
}

impl FakeConnection {
    pub fn new(host: &str, method: &str) -> Self {
        Self {
            host: Some(host.to_owned()),
            method: Some(method.to_owned()),
            ..Self::default()
        }
    }

    pub fn with_response(self, response: FakeResponse) -> Self {
        Self {
            response: Some(response),
            ..self
        }
    }
}

impl HttpConnection for FakeConnection {
    type Response = FakeResponse;

    fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    fn send(&mut self, payload: Payload<'_>) -> io::Result<()> {
        let data = match payload {
            Payload::Bytes(bytes) => bytes.to_vec(),
            Payload::Stream(stream) => {
                let mut data = Vec::new();
                stream.read_to_end(&mut data)?;
                data
            }
        };
        self.sent.push(data);
        Ok(())
    }

    fn get_response(&mut self) -> io::Result<FakeResponse> {
        self.response
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no response"))
    }
}

/// A response whose body is handed out in chunks.
#[derive(Debug, Default)]
pub struct FakeResponse {
    status: u16,
    headers: HeaderMap,
    chunks: VecDeque<Bytes>,
}

impl FakeResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers
            .append(name, http::HeaderValue::from_static(value));
        self
    }

    pub fn with_chunk(mut self, chunk: &'static [u8]) -> Self {
        self.chunks.push_back(Bytes::from_static(chunk));
        self
    }
}

impl ResponseHandle for FakeResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn read(&mut self, _limit: Option<usize>) -> io::Result<Bytes> {
        Ok(self.chunks.pop_front().unwrap_or_default())
    }
}

/// Builds requests as their parts, so tests can look at the headers.
#[derive(Debug, Default)]
pub struct PartsFactory;

impl RequestFactory for PartsFactory {
    type Request = RequestParts;

    fn build(&self, parts: RequestParts) -> RequestParts {
        parts
    }
}
