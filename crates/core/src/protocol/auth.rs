//! RTSP client authentication: HTTP Basic and Digest (RFC 2617 / RFC 7616).
//!
//! After a `401 Unauthorized`, the client inspects the `WWW-Authenticate`
//! challenges. A Digest challenge with `realm` and `nonce` selects Digest;
//! anything else falls back to Basic.
//!
//! Digest computation (MD5):
//!
//! ```text
//! HA1      = MD5(user:realm:pass)              ; MD5-sess: MD5(HA1:nonce:cnonce)
//! HA2      = MD5(method:uri)
//! response = MD5(HA1:nonce:nc:cnonce:qop:HA2)  ; no qop: MD5(HA1:nonce:HA2)
//! ```

use std::fmt::Write as _;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use md5::{Digest, Md5};
use rand::RngExt;

/// User name and password taken from the endpoint URL.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Parameters of a `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
}

impl DigestChallenge {
    /// Parse one `WWW-Authenticate` header value. Returns `None` unless
    /// it is a Digest challenge carrying both `realm` and `nonce`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let scheme_end = value.find(char::is_whitespace).unwrap_or(value.len());
        if !value[..scheme_end].eq_ignore_ascii_case("Digest") {
            return None;
        }

        let mut realm = None;
        let mut nonce = None;
        let mut qop = None;
        let mut opaque = None;
        let mut algorithm = None;
        for (key, val) in auth_params(&value[scheme_end..]) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(val),
                "nonce" => nonce = Some(val),
                "qop" => qop = Some(val),
                "opaque" => opaque = Some(val),
                "algorithm" => algorithm = Some(val),
                _ => {}
            }
        }
        Some(Self {
            realm: realm?,
            nonce: nonce?,
            qop,
            opaque,
            algorithm,
        })
    }

    /// `auth` if offered, else the first offered qop token.
    fn selected_qop(&self) -> Option<String> {
        let tokens: Vec<&str> = self
            .qop
            .as_deref()?
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        tokens
            .iter()
            .find(|t| t.eq_ignore_ascii_case("auth"))
            .or_else(|| tokens.first())
            .map(|t| t.to_ascii_lowercase())
    }

    fn is_session_variant(&self) -> bool {
        self.algorithm
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case("MD5-sess"))
    }
}

/// Split `key=value, key="quoted, value"` into pairs.
fn auth_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim_start_matches([' ', ',']);
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().to_string();
        let after = rest[eq + 1..].trim_start();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            let mut end = quoted.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        end = i + 1;
                        break;
                    }
                    c => value.push(c),
                }
            }
            (value, &quoted[end..])
        } else {
            let end = after.find(',').unwrap_or(after.len());
            (after[..end].trim().to_string(), &after[end..])
        };
        params.push((key, value));
        rest = remaining.trim_start_matches([' ', ',']);
    }
    params
}

fn md5_hex(input: &str) -> String {
    Md5::digest(input.as_bytes())
        .iter()
        .fold(String::with_capacity(32), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Produces `Authorization` header values and tracks the Digest nonce count.
#[derive(Debug)]
pub struct Authenticator {
    credentials: Credentials,
    nonce_count: u32,
    last_nonce: Option<String>,
}

impl Authenticator {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            nonce_count: 0,
            last_nonce: None,
        }
    }

    /// Basic credentials: `Basic base64(user:pass)`.
    pub fn basic(&self) -> String {
        let raw = format!("{}:{}", self.credentials.user, self.credentials.password);
        format!("Basic {}", BASE64_STANDARD.encode(raw))
    }

    /// Answer a 401 given all of its `WWW-Authenticate` values.
    pub fn respond<'a>(
        &mut self,
        challenges: impl IntoIterator<Item = &'a str>,
        method: &str,
        uri: &str,
    ) -> String {
        match challenges.into_iter().find_map(DigestChallenge::parse) {
            Some(challenge) => {
                let cnonce = {
                    let bytes: [u8; 8] = rand::rng().random();
                    bytes.iter().fold(String::with_capacity(16), |mut out, b| {
                        let _ = write!(out, "{b:02x}");
                        out
                    })
                };
                self.digest(&challenge, method, uri, &cnonce)
            }
            None => {
                tracing::debug!("no Digest challenge, using Basic authentication");
                self.basic()
            }
        }
    }

    /// Digest `Authorization` value with a caller-supplied client nonce.
    pub fn digest(
        &mut self,
        challenge: &DigestChallenge,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> String {
        if self.last_nonce.as_deref() != Some(challenge.nonce.as_str()) {
            self.nonce_count = 0;
            self.last_nonce = Some(challenge.nonce.clone());
        }

        let Credentials { user, password } = &self.credentials;
        let base_ha1 = md5_hex(&format!("{user}:{}:{password}", challenge.realm));
        let ha1 = if challenge.is_session_variant() {
            md5_hex(&format!("{base_ha1}:{}:{cnonce}", challenge.nonce))
        } else {
            base_ha1
        };
        let ha2 = md5_hex(&format!("{method}:{uri}"));

        let qop = challenge.selected_qop();
        let nc = qop.as_ref().map(|_| {
            self.nonce_count += 1;
            format!("{:08x}", self.nonce_count)
        });
        let response = match (&qop, &nc) {
            (Some(qop), Some(nc)) => {
                md5_hex(&format!("{ha1}:{}:{nc}:{cnonce}:{qop}:{ha2}", challenge.nonce))
            }
            _ => md5_hex(&format!("{ha1}:{}:{ha2}", challenge.nonce)),
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            quote(user),
            quote(&challenge.realm),
            quote(&challenge.nonce),
            quote(uri),
            response
        );
        if let Some(qop) = &qop {
            let _ = write!(header, ", qop={qop}");
        }
        if let Some(opaque) = &challenge.opaque {
            let _ = write!(header, ", opaque=\"{}\"", quote(opaque));
        }
        if let Some(algorithm) = &challenge.algorithm {
            let _ = write!(header, ", algorithm=\"{algorithm}\"");
        }
        if let Some(nc) = &nc {
            let _ = write!(header, ", nc={nc}, cnonce=\"{cnonce}\"");
        }
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> Authenticator {
        Authenticator::new(Credentials {
            user: "Mufasa".into(),
            password: "Circle Of Life".into(),
        })
    }

    #[test]
    fn parses_quoted_params() {
        let c = DigestChallenge::parse(
            r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b", opaque="5ccc""#,
        )
        .unwrap();
        assert_eq!(c.realm, "testrealm@host.com");
        assert_eq!(c.nonce, "dcd98b");
        assert_eq!(c.qop.as_deref(), Some("auth,auth-int"));
        assert_eq!(c.selected_qop().as_deref(), Some("auth"));
        assert_eq!(c.opaque.as_deref(), Some("5ccc"));
        assert!(c.algorithm.is_none());
    }

    #[test]
    fn rejects_basic_and_incomplete() {
        assert!(DigestChallenge::parse(r#"Basic realm="x""#).is_none());
        assert!(DigestChallenge::parse(r#"Digest realm="x""#).is_none());
    }

    #[test]
    fn basic_falls_back_without_digest() {
        let mut a = auth();
        let value = a.respond([r#"Basic realm="cam""#], "ANNOUNCE", "rtsp://h:554/s");
        assert_eq!(value, "Basic TXVmYXNhOkNpcmNsZSBPZiBMaWZl");
    }

    #[test]
    fn rfc2617_reference_response() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="testrealm@host.com", qop="auth", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#,
        )
        .unwrap();
        let value = auth().digest(&challenge, "GET", "/dir/index.html", "0a4f113b");
        assert!(value.contains(r#"response="6629fae49393a05397450978507c4ef1""#));
        assert!(value.contains("qop=auth"));
        assert!(value.contains(r#"nc=00000001, cnonce="0a4f113b""#));
        assert!(value.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
    }

    #[test]
    fn nonce_count_resets_on_new_nonce() {
        let mut a = auth();
        let c1 = DigestChallenge::parse(r#"Digest realm="r", nonce="n1", qop="auth""#).unwrap();
        a.digest(&c1, "OPTIONS", "rtsp://h/s", "c");
        assert!(a.digest(&c1, "OPTIONS", "rtsp://h/s", "c").contains("nc=00000002"));
        let c2 = DigestChallenge::parse(r#"Digest realm="r", nonce="n2", qop="auth""#).unwrap();
        assert!(a.digest(&c2, "OPTIONS", "rtsp://h/s", "c").contains("nc=00000001"));
    }

    #[test]
    fn without_qop_omits_nc() {
        let c = DigestChallenge::parse(r#"Digest realm="r", nonce="n", algorithm=MD5"#).unwrap();
        let value = auth().digest(&c, "SETUP", "rtsp://h/s/trackID=0", "c");
        assert!(!value.contains("nc="));
        assert!(value.contains(r#"algorithm="MD5""#));
    }

    #[test]
    fn md5_sess_changes_response() {
        let plain = DigestChallenge::parse(r#"Digest realm="r", nonce="n", qop="auth""#).unwrap();
        let sess = DigestChallenge::parse(
            r#"Digest realm="r", nonce="n", qop="auth", algorithm="MD5-sess""#,
        )
        .unwrap();
        let a = auth().digest(&plain, "RECORD", "rtsp://h/s", "c");
        let b = auth().digest(&sess, "RECORD", "rtsp://h/s", "c");
        assert_ne!(a, b);
    }
}
