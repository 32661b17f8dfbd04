use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::Read;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::http::parser::RequestLine;

/// Prefix applied to every header name during normalization.
pub const HEADER_PREFIX: &str = "HTTP_";

/// Headers that live under their bare name instead of the prefixed form.
const PROMOTED_HEADERS: [&str; 2] = ["CONTENT_TYPE", "CONTENT_LENGTH"];

pub const SERVER_NAME: &str = "SERVER_NAME";
pub const SERVER_PORT: &str = "SERVER_PORT";

/// HTTP request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// CONNECT - Establish a tunnel
    CONNECT,
    /// TRACE - Loop-back test
    TRACE,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// Method names are case-sensitive.
    ///
    /// # Example
    ///
    /// ```
    /// # use orderly::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "CONNECT" => Some(Method::CONNECT),
            "TRACE" => Some(Method::TRACE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a request is in its intake. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestState {
    /// Waiting for the request head.
    Parsing,
    /// Head seen, body still arriving.
    Processing,
    /// Fully read, or answered early by the failure path.
    Finished,
}

/// Growable request body that can be rewound and read again.
#[derive(Debug, Default)]
pub struct BodyBuffer {
    buf: BytesMut,
    pos: usize,
}

impl BodyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Moves the read cursor back to the first byte.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// The whole body, regardless of the read cursor.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The unread part of the body.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Copies the whole body out as a cheap-to-clone buffer.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }
}

impl Read for BodyBuffer {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let rest = self.remaining();
        let n = rest.len().min(out.len());
        out[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// A request as seen by the application.
///
/// Header keys are normalized: `User-Agent` is stored as `HTTP_USER_AGENT`,
/// except `CONTENT_TYPE` and `CONTENT_LENGTH` which carry no prefix. The
/// `Host` header is additionally split into `SERVER_NAME` and `SERVER_PORT`.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub fragment: Option<String>,
    /// Protocol version as `"<major>.<minor>"`, e.g. `"1.1"`.
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: BodyBuffer,
    /// Forces the connection to close after this response.
    pub terminate: bool,
    state: RequestState,
    started_at: Instant,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: Method::GET,
            path: "/".to_string(),
            query: None,
            fragment: None,
            version: "1.1".to_string(),
            headers: HashMap::new(),
            body: BodyBuffer::new(),
            terminate: false,
            state: RequestState::Parsing,
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Moves the state forward. Attempts to move backwards are ignored.
    pub fn advance(&mut self, next: RequestState) {
        if next > self.state {
            self.state = next;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == RequestState::Finished
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Looks up a normalized header key, e.g. `"HTTP_ACCEPT"` or `"CONTENT_TYPE"`.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }

    /// Parsed `CONTENT_LENGTH`, 0 when missing or not a number.
    pub fn content_length(&self) -> usize {
        self.header("CONTENT_LENGTH")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// `"HTTP/<version>"`.
    pub fn protocol(&self) -> String {
        format!("HTTP/{}", self.version)
    }

    /// Stores raw headers under their normalized keys.
    ///
    /// Repeated headers are joined with `", "`.
    pub fn apply_headers(&mut self, headers: Vec<(String, String)>) {
        for (name, value) in headers {
            match self.headers.entry(normalize_header_name(&name)) {
                Entry::Occupied(mut existing) => {
                    let joined = existing.get_mut();
                    joined.push_str(", ");
                    joined.push_str(&value);
                }
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
            }
        }

        for canonical in PROMOTED_HEADERS {
            if let Some(value) = self.headers.remove(&format!("{HEADER_PREFIX}{canonical}")) {
                self.headers.insert(canonical.to_string(), value);
            }
        }

        if let Some(host) = self.headers.get("HTTP_HOST").cloned() {
            self.apply_host(&host);
        }
    }

    /// Takes method, version and URI parts from the request line.
    pub fn apply_request_line(&mut self, line: &RequestLine) {
        self.method = line.method;
        self.version = format!("{}.{}", line.major, line.minor);

        let target = split_target(&line.target);
        self.path = target.path;
        self.query = target.query;
        self.fragment = target.fragment;

        // Absolute-form targets carry their own authority
        if let Some(host) = target.authority {
            self.apply_host(&host);
        }
    }

    fn apply_host(&mut self, host: &str) {
        let (name, port) = split_host(host);
        if let Some(name) = name {
            self.headers.insert(SERVER_NAME.to_string(), name.to_string());
        }
        if let Some(port) = port {
            self.headers.insert(SERVER_PORT.to_string(), port.to_string());
        }
    }

    /// Whether the client asked for the connection to stay open.
    ///
    /// HTTP/1.1 stays open unless `Connection: close` is sent; HTTP/1.0 closes
    /// unless `Connection: keep-alive` is sent.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("HTTP_CONNECTION");

        if self.version == "1.0" {
            connection.is_some_and(|v| has_token(v, "keep-alive"))
        } else {
            !connection.is_some_and(|v| has_token(v, "close"))
        }
    }

    /// Keep-alive decision gated by the termination flag.
    pub fn keep_open(&self) -> bool {
        !self.terminate && self.keep_alive()
    }
}

/// `Accept-Encoding` becomes `HTTP_ACCEPT_ENCODING`.
pub fn normalize_header_name(name: &str) -> String {
    let name = name.trim();
    let mut key = String::with_capacity(HEADER_PREFIX.len() + name.len());
    key.push_str(HEADER_PREFIX);
    key.extend(name.chars().map(|c| match c {
        '-' | '.' | ' ' => '_',
        c => c.to_ascii_uppercase(),
    }));
    key
}

/// Splits `host[:port]`. Bracketed IPv6 literals are kept whole.
pub fn split_host(host: &str) -> (Option<&str>, Option<&str>) {
    let (name, port) = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => (&host[..=end], host[end + 1..].strip_prefix(':')),
            None => (host, None),
        }
    } else {
        match host.split_once(':') {
            Some((name, port)) => (name, Some(port)),
            None => (host, None),
        }
    };

    (
        Some(name).filter(|n| !n.is_empty()),
        port.filter(|p| !p.is_empty()),
    )
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

struct Target {
    path: String,
    query: Option<String>,
    fragment: Option<String>,
    authority: Option<String>,
}

fn split_target(target: &str) -> Target {
    if target.starts_with("http://") || target.starts_with("https://") {
        if let Ok(url) = url::Url::parse(target) {
            let authority = url.host_str().map(|host| match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            });
            return Target {
                path: url.path().to_string(),
                query: url.query().map(str::to_string),
                fragment: url.fragment().map(str::to_string),
                authority,
            };
        }
    }

    let (rest, fragment) = match target.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment.to_string())),
        None => (target, None),
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (rest, None),
    };

    Target {
        path: path.to_string(),
        query,
        fragment,
        authority: None,
    }
}
