//! The capabilities of the host HTTP client that we instrument.
//!
//! A client exposes four entry points: building a request (where headers are
//! still mutable), sending raw bytes over a connection, receiving the
//! response head, and reading the response body. The instrumented wrappers in
//! [`crate::client`] implement the same traits, so callers construct them in
//! place of the raw client and nothing else changes.

use std::borrow::Cow;
use std::io::{self, Read, Seek};

use bytes::Bytes;
use http::{HeaderMap, Method};

/// A readable stream whose position can be saved and restored.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// The data handed to [`HttpConnection::send`].
pub enum Payload<'a> {
    Bytes(&'a [u8]),
    /// A stream the transport will read from its current position.
    Stream(&'a mut dyn ReadSeek),
}

impl Payload<'_> {
    /// Looks at the data about to be sent without consuming it.
    ///
    /// Streams are read up to [`crate::wire::MAX_READ_SIZE`] bytes and
    /// rewound to where they were.
    pub fn peek(&mut self) -> io::Result<Cow<'_, [u8]>> {
        match self {
            Self::Bytes(bytes) => Ok(Cow::Borrowed(*bytes)),
            Self::Stream(stream) => crate::wire::peek_stream(&mut **stream).map(Cow::Owned),
        }
    }
}

/// A connection to a single host that writes raw request bytes.
pub trait HttpConnection {
    type Response: ResponseHandle;

    fn host(&self) -> Option<&str>;

    /// The method of the request currently being written, if one was started.
    fn method(&self) -> Option<&str>;

    fn http_version(&self) -> &str {
        "HTTP/1.1"
    }

    /// Writes (part of) a request. May be called several times per request.
    fn send(&mut self, payload: Payload<'_>) -> io::Result<()>;

    /// Reads the response head. The body is left for the caller to read.
    fn get_response(&mut self) -> io::Result<Self::Response>;
}

/// A response whose head has been received.
pub trait ResponseHandle {
    fn status(&self) -> u16;

    fn headers(&self) -> &HeaderMap;

    /// Reads up to `limit` bytes of the body, or all of it. An empty result
    /// means the body is exhausted.
    fn read(&mut self, limit: Option<usize>) -> io::Result<Bytes>;
}

/// The pieces a request is built from.
#[derive(Debug, Clone, Default)]
pub struct RequestParts {
    pub method: Method,
    pub url: String,
    /// `None` when the caller supplied no header mapping.
    pub headers: Option<HeaderMap>,
    pub body: Bytes,
}

/// Builds requests from their parts, before they are serialized.
pub trait RequestFactory {
    type Request;

    fn build(&self, parts: RequestParts) -> Self::Request;
}
