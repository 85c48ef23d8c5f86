use crate::error::{CastError, ParseErrorKind};
use crate::protocol::request::{
    RTSP_VERSION, content_length, find_header, parse_header_lines, session_id_of, split_head,
    write_headers_and_body,
};

/// An RTSP response (RFC 2326 §7).
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// The server chains [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then calls [`serialize`](Self::serialize).
/// The client side reads responses back with [`parse`](Self::parse).
#[must_use]
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Server identification string included in every RTSP response
/// per RFC 2326 §12.36.
pub const SERVER_AGENT: &str = concat!("ScreenStream/", env!("CARGO_PKG_VERSION"));

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    /// 200 OK: success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 404 Not Found: the requested resource does not exist.
    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    /// 400 Bad Request: malformed or missing required header.
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 454 Session Not Found (RFC 2326 §11.3.5).
    pub fn session_not_found() -> Self {
        Self::new(454, "Session Not Found")
    }

    /// 461 Unsupported Transport (RFC 2326 §11.3.10).
    pub fn unsupported_transport() -> Self {
        Self::new(461, "Unsupported Transport")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut response =
            format!("{} {} {}\r\n", RTSP_VERSION, self.status_code, self.status_text);
        write_headers_and_body(&mut response, &self.headers, self.body.as_deref());
        response
    }

    /// Parse a response received by the client.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let (head, rest) = split_head(raw);
        let mut lines = head.lines();
        let status_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or(CastError::Parse {
                kind: ParseErrorKind::EmptyRequest,
            })?;

        let mut parts = status_line.splitn(3, ' ');
        let invalid = || CastError::Parse {
            kind: ParseErrorKind::InvalidStatusLine,
        };
        let version = parts.next().ok_or_else(invalid)?;
        if !version.starts_with("RTSP/") {
            return Err(invalid());
        }
        let status_code: u16 = parts
            .next()
            .and_then(|code| code.trim().parse().ok())
            .ok_or_else(invalid)?;
        let status_text = parts.next().unwrap_or("").trim().to_string();

        let headers = parse_header_lines(lines)?;
        let len = content_length(&headers).min(rest.len());
        let body = (len > 0).then(|| rest.get(..len).unwrap_or(rest).to_string());

        Ok(Self {
            status_code,
            status_text,
            headers,
            body,
        })
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Every value of a repeatable header such as `WWW-Authenticate`.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.get_header("CSeq").and_then(|v| v.trim().parse().ok())
    }

    /// Session identifier with the `;timeout=` suffix removed.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session").and_then(session_id_of)
    }

    /// `timeout=` parameter of the Session header, in seconds.
    pub fn session_timeout(&self) -> Option<u64> {
        self.get_header("Session")?
            .split(';')
            .skip(1)
            .filter_map(|param| param.trim().split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("timeout"))
            .and_then(|(_, value)| value.trim().parse().ok())
            .filter(|&t| t > 0)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_no_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "1")
            .add_header("Public", "OPTIONS");
        let s = resp.serialize();
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains(&format!("Server: {SERVER_AGENT}\r\n")));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.contains("Public: OPTIONS\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn serialize_with_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "2")
            .with_body("v=0\r\n".to_string());
        let s = resp.serialize();
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn parse_status_and_session() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 4\r\nSession: 12345678;timeout=30\r\n\r\n";
        let resp = RtspResponse::parse(raw).unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.status_text, "OK");
        assert_eq!(resp.cseq(), Some(4));
        assert_eq!(resp.session_id(), Some("12345678"));
        assert_eq!(resp.session_timeout(), Some(30));
        assert!(resp.is_success());
    }

    #[test]
    fn parse_unauthorized_with_body() {
        let raw = "RTSP/1.0 401 Unauthorized\r\nCSeq: 2\r\nContent-Length: 3\r\n\r\nabc";
        let resp = RtspResponse::parse(raw).unwrap();
        assert_eq!(resp.status_code, 401);
        assert_eq!(resp.body.as_deref(), Some("abc"));
        assert_eq!(resp.session_timeout(), None);
    }

    #[test]
    fn parse_rejects_bad_status_line() {
        assert!(RtspResponse::parse("HTTP/1.1 200 OK\r\n\r\n").is_err());
        assert!(RtspResponse::parse("RTSP/1.0 abc OK\r\n\r\n").is_err());
        assert!(RtspResponse::parse("").is_err());
    }
}
