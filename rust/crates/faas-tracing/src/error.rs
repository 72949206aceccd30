//! Error types for every step that can fail to produce tracing data.
//!
//! None of these ever reach the traced function's caller; they are logged
//! where they occur and tracing degrades instead.

use std::io;

/// A raw outbound buffer could not be turned into a structured request.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("request line is not ASCII")]
    NonAsciiRequestLine,
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("invalid header name: {0:?}")]
    InvalidHeaderName(String),
    #[error("invalid value for header {name:?}")]
    InvalidHeaderValue { name: String },
}

/// One observation step (peek, parse, inject, record) failed.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("could not peek the outbound stream: {0}")]
    Peek(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("request has no header mapping to inject into")]
    MissingHeaders,
    #[error("propagation value {0:?} is not a valid header value")]
    RejectedPropagationValue(String),
}

/// The interception points could not be installed.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("invalid propagation header name {0:?}")]
    InvalidPropagationHeader(String),
}

/// A trace context could not be created for an invocation.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("malformed trace header {value:?}: {reason}")]
    MalformedTraceHeader { value: String, reason: &'static str },
}

/// Tracing could not be prepared before the handler ran.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to create the trace context: {0}")]
    Init(#[from] TraceError),
    #[error("panicked while preparing the invocation: {0}")]
    Panicked(String),
}
