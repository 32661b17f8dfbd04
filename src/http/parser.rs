use bytes::{Buf, Bytes, BytesMut};

use crate::http::request::Method;
use crate::http::response::StatusCode;

/// Upper bound on the size of a request head (request line plus headers).
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidVersion,
    InvalidHeader,
    InvalidContentLength,
    HeadTooLarge,
    UnsupportedTransferEncoding,
}

impl ParseError {
    /// Status code used when this error is reported back to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::HeadTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            ParseError::InvalidMethod | ParseError::UnsupportedTransferEncoding => {
                StatusCode::NOT_IMPLEMENTED
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ParseError::InvalidRequest => "malformed request line",
            ParseError::InvalidMethod => "unsupported request method",
            ParseError::InvalidVersion => "unsupported protocol version",
            ParseError::InvalidHeader => "malformed header",
            ParseError::InvalidContentLength => "invalid content-length",
            ParseError::HeadTooLarge => "request head too large",
            ParseError::UnsupportedTransferEncoding => "transfer-encoding is not supported",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ParseError {}

/// The first line of a request, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub target: String,
    pub major: u8,
    pub minor: u8,
}

/// One step of an incoming request, in wire order.
#[derive(Debug)]
pub enum ParseEvent {
    /// Request line and raw headers, as sent.
    Headers {
        line: RequestLine,
        headers: Vec<(String, String)>,
    },
    /// A slice of the request body.
    Body(Bytes),
    /// The request has been fully read.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    /// `scanned` bytes of the buffer are known not to start the head terminator.
    Head {
        scanned: usize,
    },
    Body {
        remaining: usize,
    },
    Done,
}

impl Default for ParserState {
    fn default() -> Self {
        ParserState::Head { scanned: 0 }
    }
}

/// Incremental request tokenizer. Bytes are accumulated by the caller and
/// handed in on every call; consumed bytes are split off the front.
#[derive(Debug, Default)]
pub struct RequestParser {
    state: ParserState,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pulls the next event out of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_event(&mut self, buf: &mut BytesMut) -> Result<Option<ParseEvent>, ParseError> {
        match self.state {
            ParserState::Head { mut scanned } => {
                // Tolerate stray CRLFs between pipelined requests
                while buf.starts_with(b"\r\n") {
                    buf.advance(2);
                    scanned = 0;
                }

                let Some(headers_end) = find_headers_end(buf, scanned) else {
                    if buf.len() > MAX_HEAD_SIZE {
                        return Err(ParseError::HeadTooLarge);
                    }
                    // A terminator may straddle this read and the next
                    self.state = ParserState::Head {
                        scanned: buf.len().saturating_sub(3),
                    };
                    return Ok(None);
                };
                if headers_end > MAX_HEAD_SIZE {
                    return Err(ParseError::HeadTooLarge);
                }

                let head = buf.split_to(headers_end + 4);
                let (line, headers) = parse_head(&head[..headers_end])?;
                let length = body_length(&headers)?;

                self.state = if length == 0 {
                    ParserState::Done
                } else {
                    ParserState::Body { remaining: length }
                };
                Ok(Some(ParseEvent::Headers { line, headers }))
            }

            ParserState::Body { remaining } => {
                if buf.is_empty() {
                    return Ok(None);
                }

                let take = remaining.min(buf.len());
                let chunk = buf.split_to(take).freeze();
                let remaining = remaining - take;

                self.state = if remaining == 0 {
                    ParserState::Done
                } else {
                    ParserState::Body { remaining }
                };
                Ok(Some(ParseEvent::Body(chunk)))
            }

            ParserState::Done => {
                self.state = ParserState::default();
                Ok(Some(ParseEvent::Complete))
            }
        }
    }

    /// True while the parser sits between two requests.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ParserState::Head { .. })
    }
}

fn parse_head(bytes: &[u8]) -> Result<(RequestLine, Vec<(String, String)>), ParseError> {
    let head = std::str::from_utf8(bytes).map_err(|_| ParseError::InvalidRequest)?;
    let mut lines = head.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;
    let (major, minor) = parse_version(version)?;

    // Headers
    let mut headers = Vec::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ParseError::InvalidHeader);
        }

        headers.push((key.to_string(), value.trim().to_string()));
    }

    let line = RequestLine {
        method,
        target: target.to_string(),
        major,
        minor,
    };
    Ok((line, headers))
}

fn parse_version(version: &str) -> Result<(u8, u8), ParseError> {
    let digits = version
        .strip_prefix("HTTP/")
        .ok_or(ParseError::InvalidVersion)?;
    let (major, minor) = digits.split_once('.').ok_or(ParseError::InvalidVersion)?;
    let major: u8 = major.parse().map_err(|_| ParseError::InvalidVersion)?;
    let minor: u8 = minor.parse().map_err(|_| ParseError::InvalidVersion)?;

    if major != 1 {
        return Err(ParseError::InvalidVersion);
    }
    Ok((major, minor))
}

fn body_length(headers: &[(String, String)]) -> Result<usize, ParseError> {
    if headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("Transfer-Encoding"))
    {
        return Err(ParseError::UnsupportedTransferEncoding);
    }

    let mut length = None;
    for (_, value) in headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
    {
        let parsed = value
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)?;
        // Repeated lengths must agree
        if length.is_some_and(|l| l != parsed) {
            return Err(ParseError::InvalidContentLength);
        }
        length = Some(parsed);
    }

    Ok(length.unwrap_or(0))
}

/// Offset of the blank line ending the head, searching from `from`.
fn find_headers_end(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| from + pos)
}
