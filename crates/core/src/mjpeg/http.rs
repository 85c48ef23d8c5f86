//! Minimal HTTP/1.1 request and response handling for the MJPEG server.
//!
//! Only `GET` is served. Request heads share the header parsing used for
//! RTSP since both protocols use the same line format.

use bytes::Bytes;

use crate::error::{CastError, ParseErrorKind, Result};
use crate::protocol::request::{find_header, parse_header_lines, split_head};
use crate::transport::TcpSocket;

/// Upper bound for a request head, request line included.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn parse(raw: &str) -> Result<Self> {
        let (head, _) = split_head(raw);
        let mut lines = head.lines();

        let request_line = lines.next().ok_or(CastError::Parse {
            kind: ParseErrorKind::EmptyRequest,
        })?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CastError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        };
        if !version.starts_with("HTTP/") {
            return Err(CastError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (target, None),
        };

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            query,
            version: version.to_string(),
            headers: parse_header_lines(lines)?,
        })
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// First value of query parameter `name`. `+` and `%XX` are not
    /// decoded; PINs are plain digits.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .as_deref()?
            .split('&')
            .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

/// Read one request head line by line. `None` when the peer closed the
/// connection before sending anything.
pub async fn read_request_head(socket: &TcpSocket) -> Result<Option<String>> {
    let mut head = String::new();
    loop {
        let Some(line) = socket.read_line().await? else {
            return if head.is_empty() {
                Ok(None)
            } else {
                Err(CastError::Parse {
                    kind: ParseErrorKind::Incomplete,
                })
            };
        };
        if line.is_empty() {
            if head.is_empty() {
                // stray CRLF between keep-alive requests
                continue;
            }
            head.push_str("\r\n");
            return Ok(Some(head));
        }
        head.push_str(&line);
        head.push_str("\r\n");
        if head.len() > MAX_HEAD_BYTES {
            return Err(CastError::Parse {
                kind: ParseErrorKind::HeaderTooLarge,
            });
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        Self {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Cache-Control".to_string(), "no-cache".to_string())],
            body: Bytes::new(),
        }
    }

    pub fn html(body: &str) -> Self {
        Self::new(200, "OK")
            .with_body("text/html; charset=utf-8", Bytes::copy_from_slice(body.as_bytes()))
    }

    pub fn forbidden(body: &str) -> Self {
        Self::new(403, "Forbidden")
            .with_body("text/html; charset=utf-8", Bytes::copy_from_slice(body.as_bytes()))
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    pub fn method_not_allowed() -> Self {
        Self::new(405, "Method Not Allowed").add_header("Allow", "GET")
    }

    pub fn moved_permanently(location: &str) -> Self {
        Self::new(301, "Moved Permanently").add_header("Location", location)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: Bytes) -> Self {
        self.headers.push(("Content-Type".to_string(), content_type.to_string()));
        self.body = body;
        self
    }

    /// Status line and headers, ending with the blank line. A
    /// `Content-Length` is always written, so the head is complete for any
    /// non-streaming response.
    pub fn head(&self) -> String {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status_code, self.status_text);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out
    }

    pub async fn write_to(&self, socket: &TcpSocket) -> Result<()> {
        socket.write_and_flush(&[self.head().as_bytes(), &self.body]).await
    }
}
