//! Structured records reconstructed from intercepted traffic.

use bytes::Bytes;
use http::HeaderMap;

/// An outbound request, as far as it could be reconstructed from the wire.
///
/// Any field may be empty: a continuation write only carries the body, and
/// the connection may not know its host or method yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpRequestRecord {
    pub host: String,
    pub method: String,
    pub uri: String,
    /// `None` when the header block could not be located or parsed.
    pub headers: Option<HeaderMap>,
    pub body: Bytes,
}

/// The response to the most recent request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponseRecord {
    pub status: u16,
    pub headers: HeaderMap,
    /// Empty until the caller reads the body itself.
    pub body: Bytes,
}

/// How an invocation terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The handler returned; holds the debug rendering of the value.
    Returned(String),
    /// The handler failed or panicked; holds the error message.
    Raised(String),
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Raised(_))
    }
}
