//! HTTP Digest access authentication for RTSP (RFC 2617, MD5 algorithm only).
//!
//! RTSP reuses HTTP's `WWW-Authenticate`/`Authorization` header mechanics
//! (RFC 2326 §18, via RFC 2617). This covers the `qop`-less MD5 variant, which
//! is what RTSP servers and IP cameras use in practice; `qop="auth"` and the
//! SHA-256 algorithm from RFC 7616 are not implemented.

use std::collections::HashMap;

use crate::error::{Result, RtspError};

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// A `WWW-Authenticate: Digest ...` challenge issued by a server (RFC 2617 §3.2.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
}

impl DigestChallenge {
    /// Builds a fresh challenge with a random 16-byte hex nonce.
    pub fn new(realm: impl Into<String>) -> Self {
        let nonce = (0..16).map(|_| format!("{:02x}", rand::random::<u8>())).collect();
        Self { realm: realm.into(), nonce }
    }

    /// Formats the `WWW-Authenticate` header value.
    pub fn header_value(&self) -> String {
        format!("Digest realm=\"{}\", nonce=\"{}\"", self.realm, self.nonce)
    }

    /// Parses a `WWW-Authenticate` header value received from a server.
    pub fn parse(header: &str) -> Result<Self> {
        let params = parse_digest_params(header)?;
        let realm = params
            .get("realm")
            .cloned()
            .ok_or_else(|| RtspError::Codec("Digest challenge missing realm".into()))?;
        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or_else(|| RtspError::Codec("Digest challenge missing nonce".into()))?;
        Ok(Self { realm, nonce })
    }
}

/// Parsed `Authorization: Digest ...` credentials attached to a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
}

impl DigestCredentials {
    /// Builds the `Authorization` header value a client sends in response to a
    /// challenge, for the given request method and URI.
    ///
    /// `HA1 = MD5(username:realm:password)`, `HA2 = MD5(method:uri)`,
    /// `response = MD5(HA1:nonce:HA2)` (RFC 2617 §3.2.2.1, no `qop`).
    pub fn generate_header(challenge: &DigestChallenge, username: &str, password: &str, method: &str, uri: &str) -> String {
        let response = compute_response(&challenge.realm, &challenge.nonce, username, password, method, uri);
        format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\"",
            challenge.realm, challenge.nonce
        )
    }

    /// Parses an `Authorization` header value sent by a client.
    pub fn parse(header: &str) -> Result<Self> {
        let params = parse_digest_params(header)?;
        let get = |k: &'static str| {
            params.get(k).cloned().ok_or_else(|| RtspError::Codec(format!("Digest credentials missing {k}")))
        };
        Ok(Self {
            username: get("username")?,
            realm: get("realm")?,
            nonce: get("nonce")?,
            uri: get("uri")?,
            response: get("response")?,
        })
    }

    /// Whether these credentials produce the expected response for `password`.
    pub fn verify(&self, password: &str, method: &str) -> bool {
        let expected = compute_response(&self.realm, &self.nonce, &self.username, password, method, &self.uri);
        // Not constant-time: nonces are single-use and server-generated, so
        // timing leakage here does not expose the password itself.
        expected == self.response
    }
}

fn compute_response(realm: &str, nonce: &str, username: &str, password: &str, method: &str, uri: &str) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

fn parse_digest_params(header: &str) -> Result<HashMap<String, String>> {
    let rest = header
        .trim()
        .strip_prefix("Digest ")
        .ok_or_else(|| RtspError::Codec("expected a Digest auth header".into()))?;
    let mut params = HashMap::new();
    for part in rest.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else { continue };
        params.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_challenge_response_verifies() {
        let challenge = DigestChallenge { realm: "streaming-server".into(), nonce: "abc123".into() };
        let header = DigestCredentials::generate_header(&challenge, "admin", "hunter2", "DESCRIBE", "rtsp://cam/live");
        let creds = DigestCredentials::parse(&header).unwrap();
        assert_eq!(creds.username, "admin");
        assert_eq!(creds.uri, "rtsp://cam/live");
        assert!(creds.verify("hunter2", "DESCRIBE"));
        assert!(!creds.verify("wrong-password", "DESCRIBE"));
        assert!(!creds.verify("hunter2", "SETUP"));
    }

    #[test]
    fn challenge_header_round_trips() {
        let challenge = DigestChallenge::new("streaming-server");
        let parsed = DigestChallenge::parse(&challenge.header_value()).unwrap();
        assert_eq!(parsed, challenge);
    }

    #[test]
    fn missing_nonce_is_rejected() {
        assert!(DigestChallenge::parse("Digest realm=\"x\"").is_err());
    }

    #[test]
    fn non_digest_scheme_is_rejected() {
        assert!(DigestChallenge::parse("Basic realm=\"x\"").is_err());
    }

    /// RFC 2617 §3.5 worked example.
    #[test]
    fn rfc2617_worked_example_response() {
        let response = compute_response(
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
        );
        assert_eq!(response, "1949323746fe6a43ef61f9606e7febea");
    }
}
