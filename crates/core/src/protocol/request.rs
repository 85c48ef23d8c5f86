use std::fmt::Write as _;

use crate::error::{CastError, ParseErrorKind};

/// RTSP protocol version written on every request and response line.
pub const RTSP_VERSION: &str = "RTSP/1.0";

/// A parsed or outgoing RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. The same type is
/// parsed by the server and built by the client, which chains
/// [`add_header`](Self::add_header) and [`with_body`](Self::with_body)
/// before calling [`serialize`](Self::serialize).
#[derive(Debug, Clone)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, etc.).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/stream/trackID=0`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Body text, present when `Content-Length` was non-zero.
    pub body: Option<String>,
}

impl RtspRequest {
    pub fn new(method: &str, uri: &str) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            version: RTSP_VERSION.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, content_type: &str, body: String) -> Self {
        self.headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        self.body = Some(body);
        self
    }

    /// Parse an RTSP request from its text representation.
    ///
    /// Expects the request line, headers, a blank line and, if announced by
    /// `Content-Length`, the body. Returns [`CastError::Parse`] on malformed
    /// input.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let (head, body) = split_head(raw);
        let mut lines = head.lines();

        let request_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or(CastError::Parse {
                kind: ParseErrorKind::EmptyRequest,
            })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(CastError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0].to_ascii_uppercase();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        if version != RTSP_VERSION {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        let headers = parse_header_lines(lines)?;
        let body = body_for(&headers, body);

        Ok(RtspRequest {
            method,
            uri,
            version,
            headers,
            body,
        })
    }

    /// Serialize to the RTSP text wire format, appending `Content-Length`
    /// when a body is present.
    pub fn serialize(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        write_headers_and_body(&mut out, &self.headers, self.body.as_deref());
        out
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    ///
    /// Every RTSP request must include a CSeq, and the response must echo it.
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Session identifier with any `;timeout=` suffix removed.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session").and_then(session_id_of)
    }
}

/// Split a message at the blank line that ends the header block.
pub(crate) fn split_head(raw: &str) -> (&str, &str) {
    if let Some(pos) = raw.find("\r\n\r\n") {
        (&raw[..pos], &raw[pos + 4..])
    } else if let Some(pos) = raw.find("\n\n") {
        (&raw[..pos], &raw[pos + 2..])
    } else {
        (raw, "")
    }
}

pub(crate) fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> crate::error::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let colon_pos = line.find(':').ok_or(CastError::Parse {
            kind: ParseErrorKind::InvalidHeader,
        })?;
        let name = line[..colon_pos].trim().to_string();
        let value = line[colon_pos + 1..].trim().to_string();
        headers.push((name, value));
    }
    Ok(headers)
}

pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Declared `Content-Length`, or 0 when absent or malformed.
pub(crate) fn content_length(headers: &[(String, String)]) -> usize {
    find_header(headers, "Content-Length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn body_for(headers: &[(String, String)], rest: &str) -> Option<String> {
    let len = content_length(headers).min(rest.len());
    (len > 0).then(|| rest.get(..len).unwrap_or(rest).to_string())
}

/// `"ABC;timeout=60"` -> `"ABC"`.
pub(crate) fn session_id_of(value: &str) -> Option<&str> {
    let id = value.split(';').next().unwrap_or(value).trim();
    (!id.is_empty()).then_some(id)
}

pub(crate) fn write_headers_and_body(
    out: &mut String,
    headers: &[(String, String)],
    body: Option<&str>,
) {
    for (name, value) in headers {
        let _ = write!(out, "{}: {}\r\n", name, value);
    }
    match body {
        Some(body) => {
            let _ = write!(out, "Content-Length: {}\r\n\r\n{}", body.len(), body);
        }
        None => out.push_str("\r\n"),
    }
}
