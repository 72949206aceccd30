//! Reconstructs outbound requests from the raw bytes handed to the transport.
//!
//! Parsing is best effort. A buffer without a header/body boundary is a
//! continuation of a request written by an earlier call, and anything we
//! cannot make sense of degrades to an "unparsed" record that only carries
//! what the connection already knew.

use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::error::ParseError;
use crate::record::HttpRequestRecord;

/// The most we ever read from an outbound stream.
pub const MAX_READ_SIZE: usize = 1024;

const BODY_HEADER_SPLITTER: &[u8] = b"\r\n\r\n";
const LINE_SPLITTER: &[u8] = b"\r\n";

/// What the connection knows about the request it is writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub host: Option<String>,
    pub method: Option<String>,
    pub http_version: String,
}

impl Default for RequestTarget {
    fn default() -> Self {
        Self {
            host: None,
            method: None,
            http_version: "HTTP/1.1".to_owned(),
        }
    }
}

/// The result of looking at one outbound write.
#[derive(Debug, Clone, PartialEq)]
pub enum WireRequest {
    /// A request line and header block were found.
    Parsed(HttpRequestRecord),
    /// Body-only or unreadable data; headers are absent.
    Unparsed(HttpRequestRecord),
}

impl WireRequest {
    pub fn record(&self) -> &HttpRequestRecord {
        match self {
            Self::Parsed(record) | Self::Unparsed(record) => record,
        }
    }
}

/// Reads at most [`MAX_READ_SIZE`] bytes from the stream's current position
/// and puts the position back where it was, whether or not the read worked.
pub fn peek_stream<R: Read + Seek + ?Sized>(stream: &mut R) -> io::Result<Vec<u8>> {
    let mut rewind = Rewind::new(stream)?;
    let mut prefix = Vec::with_capacity(MAX_READ_SIZE);
    (&mut *rewind.stream)
        .take(MAX_READ_SIZE as u64)
        .read_to_end(&mut prefix)?;
    Ok(prefix)
}

/// Restores a stream position on drop.
struct Rewind<'a, R: Seek + ?Sized> {
    stream: &'a mut R,
    position: u64,
}

impl<'a, R: Seek + ?Sized> Rewind<'a, R> {
    fn new(stream: &'a mut R) -> io::Result<Self> {
        let position = stream.stream_position()?;
        Ok(Self { stream, position })
    }
}

impl<R: Seek + ?Sized> Drop for Rewind<'_, R> {
    fn drop(&mut self) {
        if let Err(error) = self.stream.seek(SeekFrom::Start(self.position)) {
            tracing::warn!(%error, position = self.position, "failed to rewind outbound stream");
        }
    }
}

/// Turns an outbound buffer into a request record, falling back to an
/// unparsed record when the buffer cannot be parsed.
pub fn capture_request(data: &[u8], target: &RequestTarget) -> WireRequest {
    match parse_request(data, target) {
        Ok(Some(record)) => WireRequest::Parsed(record),
        Ok(None) => WireRequest::Unparsed(unparsed_request(data, target)),
        Err(error) => {
            tracing::debug!(%error, "could not parse outbound request");
            WireRequest::Unparsed(unparsed_request(data, target))
        }
    }
}

/// Builds the fallback record: only what the connection knows, plus the raw
/// bytes as the body.
pub fn unparsed_request(data: &[u8], target: &RequestTarget) -> HttpRequestRecord {
    HttpRequestRecord {
        host: target.host.clone().unwrap_or_default(),
        method: target.method.clone().unwrap_or_default(),
        uri: String::new(),
        headers: None,
        body: Bytes::copy_from_slice(data),
    }
}

/// Parses a request line and header block.
///
/// Returns `Ok(None)` when there is no header block to parse: no boundary,
/// no header lines after the request line, or no headers at all.
pub fn parse_request(
    data: &[u8],
    target: &RequestTarget,
) -> Result<Option<HttpRequestRecord>, ParseError> {
    let Some((head, body)) = split_once(data, BODY_HEADER_SPLITTER) else {
        return Ok(None);
    };
    let Some((request_line, header_block)) = split_once(head, LINE_SPLITTER) else {
        return Ok(None);
    };

    let headers = parse_headers(header_block)?;
    if headers.is_empty() {
        return Ok(None);
    }

    let request_line = std::str::from_utf8(request_line)
        .ok()
        .filter(|line| line.is_ascii())
        .ok_or(ParseError::NonAsciiRequestLine)?;
    let method = target
        .method
        .clone()
        .filter(|method| !method.is_empty())
        .or_else(|| request_line.split_whitespace().next().map(str::to_owned))
        .unwrap_or_default();
    let path = request_path(request_line, &method, &target.http_version);

    let host = target
        .host
        .clone()
        .filter(|host| !host.is_empty())
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        })
        .unwrap_or_default();

    Ok(Some(HttpRequestRecord {
        uri: format!("{host}{path}"),
        host,
        method,
        headers: Some(headers),
        body: Bytes::copy_from_slice(body),
    }))
}

/// Strips the method and protocol version from a request line.
fn request_path<'a>(request_line: &'a str, method: &str, http_version: &str) -> &'a str {
    let line = request_line.trim();
    let line = line.strip_prefix(method).unwrap_or(line).trim_end();
    let line = line
        .strip_suffix(http_version)
        .or_else(|| {
            line.rsplit_once(char::is_whitespace)
                .filter(|(_, version)| version.starts_with("HTTP/"))
                .map(|(rest, _)| rest)
        })
        .unwrap_or(line);
    line.trim()
}

/// Parses `Name: value` lines. Folded continuation lines are joined onto the
/// previous value. Names keep their case-insensitive semantics through
/// [`HeaderName`].
fn parse_headers(block: &[u8]) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::new();
    let mut pending: Option<(HeaderName, Vec<u8>)> = None;

    for line in block.split(|byte| *byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if matches!(line[0], b' ' | b'\t') {
            let (_, value) = pending
                .as_mut()
                .ok_or_else(|| ParseError::MalformedHeader(lossy(line)))?;
            value.push(b' ');
            value.extend_from_slice(line.trim_ascii());
            continue;
        }

        if let Some((name, value)) = pending.take() {
            append_header(&mut headers, name, &value)?;
        }
        let colon = line
            .iter()
            .position(|byte| *byte == b':')
            .ok_or_else(|| ParseError::MalformedHeader(lossy(line)))?;
        let raw_name = line[..colon].trim_ascii();
        let name = HeaderName::from_bytes(raw_name)
            .map_err(|_| ParseError::InvalidHeaderName(lossy(raw_name)))?;
        pending = Some((name, line[colon + 1..].trim_ascii().to_vec()));
    }
    if let Some((name, value)) = pending {
        append_header(&mut headers, name, &value)?;
    }

    Ok(headers)
}

fn append_header(headers: &mut HeaderMap, name: HeaderName, value: &[u8]) -> Result<(), ParseError> {
    let value = HeaderValue::from_bytes(value).map_err(|_| ParseError::InvalidHeaderValue {
        name: name.to_string(),
    })?;
    headers.append(name, value);
    Ok(())
}

fn split_once<'a>(data: &'a [u8], marker: &[u8]) -> Option<(&'a [u8], &'a [u8])> {
    data.windows(marker.len())
        .position(|window| window == marker)
        .map(|index| (&data[..index], &data[index + marker.len()..]))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn target(host: &str, method: &str) -> RequestTarget {
        RequestTarget {
            host: Some(host.to_owned()),
            method: Some(method.to_owned()),
            ..RequestTarget::default()
        }
    }

    #[test]
    fn parses_request_line_and_headers() {
        let data = b"GET /foo?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let record = parse_request(data, &target("example.com", "GET"))
            .unwrap()
            .unwrap();

        assert_eq!(record.host, "example.com");
        assert_eq!(record.method, "GET");
        assert_eq!(record.uri, "example.com/foo?x=1");
        let headers = record.headers.unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["Host"], "example.com");
        assert!(record.body.is_empty());
    }

    #[test]
    fn header_lookup_ignores_case() {
        let data = b"POST /items HTTP/1.1\r\nX-Request-ID: abc\r\ncontent-TYPE: text/plain\r\n\r\nhello";

        let record = parse_request(data, &target("api.internal", "POST"))
            .unwrap()
            .unwrap();

        let headers = record.headers.unwrap();
        for name in ["x-request-id", "X-REQUEST-ID", "X-Request-Id"] {
            assert_eq!(headers.get(name).unwrap(), "abc");
        }
        assert_eq!(headers.get("Content-Type").unwrap(), "text/plain");
        assert_eq!(record.body, Bytes::from_static(b"hello"));
    }

    #[test]
    fn body_only_write_is_unparsed() {
        let data = b"{\"continuation\": true}";

        let captured = capture_request(data, &target("example.com", "PUT"));

        let WireRequest::Unparsed(record) = captured else {
            panic!("expected an unparsed record, got {captured:?}");
        };
        assert_eq!(record.host, "example.com");
        assert_eq!(record.method, "PUT");
        assert_eq!(record.headers, None);
        assert_eq!(record.body, Bytes::from_static(data));
    }

    #[test]
    fn unknown_host_falls_back_to_host_header() {
        let data = b"GET /status HTTP/1.1\r\nHost: backend:8080\r\n\r\n";
        let target = RequestTarget {
            method: Some("GET".to_owned()),
            ..RequestTarget::default()
        };

        let record = parse_request(data, &target).unwrap().unwrap();

        assert_eq!(record.host, "backend:8080");
        assert_eq!(record.uri, "backend:8080/status");
    }

    #[test]
    fn unknown_method_is_taken_from_the_request_line() {
        let data = b"DELETE /users/7 HTTP/1.0\r\nHost: users\r\n\r\n";
        let target = RequestTarget {
            host: Some("users".to_owned()),
            ..RequestTarget::default()
        };

        let record = parse_request(data, &target).unwrap().unwrap();

        assert_eq!(record.method, "DELETE");
        assert_eq!(record.uri, "users/users/7");
    }

    #[test]
    fn empty_connection_method_counts_as_unknown() {
        let data = b"PUT /items/1 HTTP/1.1\r\nHost: store\r\n\r\n";

        let record = parse_request(data, &target("store", "")).unwrap().unwrap();

        assert_eq!(record.method, "PUT");
        assert_eq!(record.uri, "store/items/1");
    }

    #[test]
    fn folded_header_lines_are_joined() {
        let data = b"GET / HTTP/1.1\r\nX-Long: first\r\n  second\r\n\r\n";

        let record = parse_request(data, &target("h", "GET")).unwrap().unwrap();

        assert_eq!(record.headers.unwrap()["x-long"], "first second");
    }

    #[test]
    fn malformed_header_falls_back_to_unparsed() {
        let data = b"GET / HTTP/1.1\r\nnot a header line\r\n\r\n";

        assert!(matches!(
            parse_request(data, &target("h", "GET")),
            Err(ParseError::MalformedHeader(_))
        ));
        let captured = capture_request(data, &target("h", "GET"));
        assert_eq!(
            captured,
            WireRequest::Unparsed(unparsed_request(data, &target("h", "GET")))
        );
    }

    #[test]
    fn request_line_without_headers_is_unparsed() {
        let data = b"GET / HTTP/1.1\r\n\r\n";

        assert_eq!(parse_request(data, &target("h", "GET")).unwrap(), None);
    }

    #[test]
    fn peeking_a_stream_restores_its_position() {
        let mut stream = Cursor::new(b"skip-GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        stream.set_position(5);

        let prefix = peek_stream(&mut stream).unwrap();

        assert_eq!(stream.position(), 5);
        assert!(prefix.starts_with(b"GET / HTTP/1.1"));
    }

    #[test]
    fn peeking_reads_a_bounded_prefix() {
        let mut stream = Cursor::new(vec![b'a'; MAX_READ_SIZE * 3]);

        let prefix = peek_stream(&mut stream).unwrap();

        assert_eq!(prefix.len(), MAX_READ_SIZE);
        assert_eq!(stream.position(), 0);
    }
}
