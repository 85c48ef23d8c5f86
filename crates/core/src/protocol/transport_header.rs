use std::fmt;

/// The RTSP `Transport` header (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// Client → Server (UDP):
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///
/// Client → Server (TCP interleaved):
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001
/// ```
///
/// Only the first comma-separated alternative is considered. Unknown
/// parameters are kept verbatim in `extensions` and written back out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    /// Transport profile, e.g. `RTP/AVP` or `RTP/AVP/TCP`.
    pub profile: String,
    pub unicast: bool,
    /// Interleaved channel pair for RTP-over-TCP.
    pub interleaved: Option<(u8, u8)>,
    /// Client's (RTP, RTCP) ports.
    pub client_ports: Option<(u16, u16)>,
    /// Server's (RTP, RTCP) ports.
    pub server_ports: Option<(u16, u16)>,
    pub mode: Option<String>,
    pub mode_quoted: bool,
    pub extensions: Vec<String>,
}

impl TransportHeader {
    pub fn new(profile: &str) -> Self {
        Self {
            profile: profile.to_string(),
            unicast: true,
            interleaved: None,
            client_ports: None,
            server_ports: None,
            mode: None,
            mode_quoted: false,
            extensions: Vec::new(),
        }
    }

    /// Parse the `Transport` header value.
    ///
    /// A port spec with one number `a` means the pair `(a, a+1)`.
    ///
    /// ## Examples
    ///
    /// ```
    /// use screencast::protocol::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th.client_ports, Some((8000, 8001)));
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;interleaved=2-3").unwrap();
    /// assert!(th.is_tcp());
    /// assert_eq!(th.interleaved, Some((2, 3)));
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let first = header.split(',').next()?.trim();
        let mut tokens = first.split(';').map(str::trim).filter(|t| !t.is_empty());
        let mut th = Self::new(tokens.next()?);

        for token in tokens {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (token, None),
            };
            match (key.to_ascii_lowercase().as_str(), value) {
                ("unicast", None) => th.unicast = true,
                ("multicast", None) => th.unicast = false,
                ("interleaved", Some(v)) => {
                    if let Some((a, b)) = v.split_once('-') {
                        if let (Ok(a), Ok(b)) = (a.trim().parse(), b.trim().parse()) {
                            th.interleaved = Some((a, b));
                        }
                    }
                }
                ("client_port", Some(v)) => th.client_ports = parse_port_pair(v),
                ("server_port", Some(v)) => th.server_ports = parse_port_pair(v),
                ("mode", Some(v)) => {
                    th.mode_quoted = v.len() >= 2 && v.starts_with('"') && v.ends_with('"');
                    th.mode = Some(v.trim_matches('"').to_string());
                }
                _ => th.extensions.push(token.to_string()),
            }
        }
        Some(th)
    }

    /// Whether RTP is carried interleaved on the RTSP connection.
    pub fn is_tcp(&self) -> bool {
        self.profile.eq_ignore_ascii_case("RTP/AVP/TCP") || self.interleaved.is_some()
    }

    #[must_use]
    pub fn with_server_ports(mut self, rtp: u16, rtcp: u16) -> Self {
        self.server_ports = Some((rtp, rtcp));
        self
    }
}

fn parse_port_pair(value: &str) -> Option<(u16, u16)> {
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: u16 = value.trim().parse().ok()?;
            Some((a, a.checked_add(1)?))
        }
    }
}

impl fmt::Display for TransportHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.profile)?;
        write!(f, ";{}", if self.unicast { "unicast" } else { "multicast" })?;
        if let Some((a, b)) = self.interleaved {
            write!(f, ";interleaved={a}-{b}")?;
        }
        if let Some((a, b)) = self.client_ports {
            write!(f, ";client_port={a}-{b}")?;
        }
        if let Some((a, b)) = self.server_ports {
            write!(f, ";server_port={a}-{b}")?;
        }
        if let Some(mode) = &self.mode {
            if self.mode_quoted {
                write!(f, ";mode=\"{mode}\"")?;
            } else {
                write!(f, ";mode={mode}")?;
            }
        }
        for ext in &self.extensions {
            write!(f, ";{ext}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_transport() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(th.profile, "RTP/AVP");
        assert!(th.unicast);
        assert_eq!(th.client_ports, Some((5000, 5001)));
        assert!(!th.is_tcp());
    }

    #[test]
    fn single_port_implies_pair() {
        let th = TransportHeader::parse("RTP/AVP;client_port=6000").unwrap();
        assert_eq!(th.client_ports, Some((6000, 6001)));
    }

    #[test]
    fn parse_interleaved_and_quoted_mode() {
        let th =
            TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1;mode=\"record\";ssrc=1234")
                .unwrap();
        assert!(th.is_tcp());
        assert_eq!(th.interleaved, Some((0, 1)));
        assert_eq!(th.mode.as_deref(), Some("record"));
        assert!(th.mode_quoted);
        assert_eq!(th.extensions, vec!["ssrc=1234".to_string()]);
        assert_eq!(
            th.to_string(),
            "RTP/AVP/TCP;unicast;interleaved=0-1;mode=\"record\";ssrc=1234"
        );
    }

    #[test]
    fn only_first_alternative_counts() {
        let th = TransportHeader::parse("RTP/AVP;multicast, RTP/AVP/TCP;interleaved=0-1").unwrap();
        assert!(!th.unicast);
        assert!(th.interleaved.is_none());
    }

    #[test]
    fn server_ports_in_reply() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001")
            .unwrap()
            .with_server_ports(5000, 5001);
        assert_eq!(
            th.to_string(),
            "RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001"
        );
    }

    #[test]
    fn parse_empty() {
        assert!(TransportHeader::parse("").is_none());
        assert!(TransportHeader::parse(" ; ").is_none());
    }
}
