use std::fmt;

use crate::error::{CastError, Result};
use crate::protocol::auth::Credentials;

/// Default RTSP port (RFC 2326 §3.2).
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// A parsed `rtsp://` or `rtsps://` endpoint the client publishes to.
///
/// `path` always starts with `/` and carries the query string, if any.
#[derive(Clone, PartialEq, Eq)]
pub struct RtspUrl {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl RtspUrl {
    /// Parse an endpoint of the form
    /// `rtsp[s]://[user[:password]@]host[:port][/path][?query]`.
    ///
    /// ```
    /// use screencast::protocol::RtspUrl;
    ///
    /// let url = RtspUrl::parse("rtsps://bob:secret@[::1]:8322/live?x=1").unwrap();
    /// assert!(url.tls);
    /// assert_eq!(url.host, "::1");
    /// assert_eq!(url.base_uri(), "rtsp://[::1]:8322/live?x=1");
    /// assert!(url.has_auth());
    /// ```
    pub fn parse(endpoint: &str) -> Result<Self> {
        let err = |reason: &str| CastError::Url {
            url: redact(endpoint),
            reason: reason.to_string(),
        };

        let endpoint = endpoint.trim();
        let (scheme, rest) = endpoint.split_once("://").ok_or_else(|| err("scheme is missing"))?;
        let tls = match scheme.to_ascii_lowercase().as_str() {
            "rtsp" => false,
            "rtsps" => true,
            other => return Err(err(&format!("invalid protocol: {other}"))),
        };

        let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);
        let tail = tail.split('#').next().unwrap_or_default();

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((info, hp)) => (Some(info), hp),
            None => (None, authority),
        };

        let (host, port) = split_host_port(hostport).ok_or_else(|| err("invalid port"))?;
        if host.is_empty() {
            return Err(err("invalid/missing host"));
        }

        let (raw_path, query) = match tail.split_once('?') {
            Some((p, q)) => (p, Some(q).filter(|q| !q.is_empty())),
            None => (tail, None),
        };
        let raw_path = raw_path.trim().trim_start_matches('/');
        let path = match (raw_path.is_empty(), query) {
            (true, Some(q)) => format!("/?{q}"),
            (true, None) => "/".to_string(),
            (false, Some(q)) => format!("/{raw_path}?{q}"),
            (false, None) => format!("/{raw_path}"),
        };

        let (user, password) = match userinfo.filter(|info| !info.is_empty()) {
            Some(info) => {
                let (u, p) = info.split_once(':').unwrap_or((info, ""));
                (Some(percent_decode(u)), Some(percent_decode(p)))
            }
            None => (None, None),
        };

        Ok(Self {
            tls,
            host: host.to_string(),
            port: port.unwrap_or(DEFAULT_RTSP_PORT),
            path,
            user,
            password,
        })
    }

    pub fn has_auth(&self) -> bool {
        self.user.as_deref().is_some_and(|u| !u.is_empty())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.has_auth().then(|| Credentials {
            user: self.user.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
        })
    }

    /// Request URI for session-level methods. Always uses the `rtsp`
    /// scheme, also over TLS.
    pub fn base_uri(&self) -> String {
        format!("rtsp://{}:{}{}", self.host_for_uri(), self.port, self.path)
    }

    /// Request URI for a per-track SETUP.
    pub fn track_uri(&self, track_id: u8) -> String {
        format!("{}/trackID={track_id}", self.base_uri())
    }

    fn host_for_uri(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Debug for RtspUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtspUrl")
            .field("tls", &self.tls)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

fn split_host_port(hostport: &str) -> Option<(&str, Option<u16>)> {
    if let Some(bracketed) = hostport.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']')?;
        return match after {
            "" | ":" => Some((host, None)),
            _ => Some((host, Some(after.strip_prefix(':')?.parse().ok()?))),
        };
    }
    match hostport.rsplit_once(':') {
        Some((host, "")) => Some((host, None)),
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((hostport, None)),
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Endpoint text safe for logs and error messages.
fn redact(endpoint: &str) -> String {
    match (endpoint.find("://"), endpoint.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &endpoint[..scheme_end], &endpoint[at + 1..])
        }
        _ => endpoint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_port_and_path() {
        let url = RtspUrl::parse("rtsp://example.com").unwrap();
        assert!(!url.tls);
        assert_eq!(url.port, 554);
        assert_eq!(url.path, "/");
        assert!(!url.has_auth());
        assert_eq!(url.base_uri(), "rtsp://example.com:554/");
    }

    #[test]
    fn path_query_normalization() {
        assert_eq!(RtspUrl::parse("rtsp://h/live/cam").unwrap().path, "/live/cam");
        assert_eq!(RtspUrl::parse("rtsp://h?token=1").unwrap().path, "/?token=1");
        assert_eq!(RtspUrl::parse("rtsp://h:8554/a?b=c").unwrap().path, "/a?b=c");
    }

    #[test]
    fn userinfo_split_at_first_colon() {
        let url = RtspUrl::parse("rtsp://user:pa:ss@h/s").unwrap();
        assert_eq!(url.user.as_deref(), Some("user"));
        assert_eq!(url.password.as_deref(), Some("pa:ss"));

        let url = RtspUrl::parse("rtsp://user@h/s").unwrap();
        assert_eq!(url.password.as_deref(), Some(""));
        assert!(url.has_auth());

        let url = RtspUrl::parse("rtsp://us%40er:p%3Aw@h/s").unwrap();
        assert_eq!(url.user.as_deref(), Some("us@er"));
        assert_eq!(url.password.as_deref(), Some("p:w"));
    }

    #[test]
    fn track_uri_appends_track_id() {
        let url = RtspUrl::parse("rtsps://h:322/live").unwrap();
        assert!(url.tls);
        assert_eq!(url.track_uri(1), "rtsp://h:322/live/trackID=1");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(RtspUrl::parse("http://h/s"), Err(CastError::Url { .. })));
        assert!(RtspUrl::parse("h/s").is_err());
        assert!(RtspUrl::parse("rtsp:///s").is_err());
        assert!(RtspUrl::parse("rtsp://h:99999/s").is_err());
    }

    #[test]
    fn error_hides_password() {
        let Err(CastError::Url { url, .. }) = RtspUrl::parse("ftp://u:secret@h/s") else {
            panic!("expected URL error");
        };
        assert!(!url.contains("secret"));
    }
}
