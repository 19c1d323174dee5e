use crate::error::{ParseErrorKind, Result, RtspError};
use crate::protocol::headers::Headers;

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
/// Uses a builder pattern — chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present.
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

/// Server/client identification string included in every message we emit
/// (RFC 2326 §12.36, §12.37).
pub const SERVER_AGENT: &str = "rtsp-rs/0.1";

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        let mut headers = Headers::new();
        headers.insert("Server", SERVER_AGENT);
        RtspResponse { status_code, status_text: status_text.to_string(), headers, body: None }
    }

    /// 200 OK — success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 400 Bad Request — malformed or missing required header.
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 401 Unauthorized — missing or invalid Digest credentials (RFC 2617 §3.2.1).
    pub fn unauthorized() -> Self {
        Self::new(401, "Unauthorized")
    }

    /// 404 Not Found — the requested resource does not exist.
    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    /// 454 Session Not Found — the Session header names an unknown session.
    pub fn session_not_found() -> Self {
        Self::new(454, "Session Not Found")
    }

    /// 455 Method Not Valid In This State — rejected state transition (RFC 2326 §11).
    pub fn method_not_valid_in_state() -> Self {
        Self::new(455, "Method Not Valid In This State")
    }

    /// 461 Unsupported Transport — none of the offered transports are usable.
    pub fn unsupported_transport() -> Self {
        Self::new(461, "Unsupported Transport")
    }

    /// 501 Not Implemented — method is not one this server supports.
    pub fn not_implemented() -> Self {
        Self::new(501, "Not Implemented")
    }

    /// Whether this is a successful (2xx) response.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attaches a textual body (e.g. SDP), setting `Content-Length` to match.
    pub fn with_body(self, body: String) -> Self {
        self.with_body_bytes(body.into_bytes())
    }

    /// Attaches an opaque body, setting `Content-Length` to match.
    pub fn with_body_bytes(mut self, body: Vec<u8>) -> Self {
        self.headers.set("Content-Length", body.len().to_string());
        self.body = Some(body);
        self
    }

    /// Serializes to the RTSP wire format: status line, headers (CSeq first,
    /// then alphabetical), blank line, body.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text).into_bytes();
        for (name, value) in self.headers.ordered_for_write() {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }

    /// Parses a complete RTSP response: status line, headers, blank line, and
    /// (if `Content-Length` says so) exactly that many body bytes.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let sep = find_header_terminator(raw).ok_or(RtspError::Parse { kind: ParseErrorKind::EmptyRequest })?;
        let head = std::str::from_utf8(&raw[..sep.0])
            .map_err(|_| RtspError::Parse { kind: ParseErrorKind::InvalidEncoding })?;
        let body_bytes = &raw[sep.1..];

        let mut lines = head.lines();
        let status_line = lines.next().ok_or(RtspError::Parse { kind: ParseErrorKind::EmptyRequest })?;
        let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
        if parts.len() != 3 {
            return Err(RtspError::Parse { kind: ParseErrorKind::InvalidStatusLine });
        }
        let status_code: u16 = parts[1]
            .parse()
            .map_err(|_| RtspError::Parse { kind: ParseErrorKind::InvalidStatusLine })?;
        let status_text = parts[2].to_string();

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let colon_pos = line.find(':').ok_or(RtspError::Parse { kind: ParseErrorKind::InvalidHeader })?;
            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();
            headers.insert(name, value);
        }

        let declared_len = headers.content_length()?;
        let body = if declared_len == 0 {
            None
        } else {
            if body_bytes.len() != declared_len {
                return Err(RtspError::Parse { kind: ParseErrorKind::BodyLengthMismatch });
            }
            Some(body_bytes.to_vec())
        };

        Ok(RtspResponse { status_code, status_text, headers, body })
    }

    /// Look up a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn cseq(&self) -> Option<&str> {
        self.headers.cseq()
    }
}

fn find_header_terminator(raw: &[u8]) -> Option<(usize, usize)> {
    if raw.is_empty() {
        return None;
    }
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos + 2, pos + 4));
    }
    raw.windows(2).position(|w| w == b"\n\n").map(|pos| (pos + 1, pos + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_no_body() {
        let resp = RtspResponse::ok().add_header("CSeq", "1").add_header("Public", "OPTIONS");
        let s = String::from_utf8(resp.serialize()).unwrap();
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains("Server: rtsp-rs/0.1\r\n"));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.contains("Public: OPTIONS\r\n"));
        assert!(s.ends_with("\r\n"));
    }

    #[test]
    fn serialize_with_body() {
        let resp = RtspResponse::ok().add_header("CSeq", "2").with_body("v=0\r\n".to_string());
        let s = String::from_utf8(resp.serialize()).unwrap();
        assert!(s.contains("Server: rtsp-rs/0.1\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("v=0\r\n"));
    }

    #[test]
    fn not_found_response() {
        let resp = RtspResponse::not_found().add_header("CSeq", "5");
        assert_eq!(resp.status_code, 404);
        let s = String::from_utf8(resp.serialize()).unwrap();
        assert!(s.starts_with("RTSP/1.0 404 Not Found\r\n"));
        assert!(s.contains("Server: rtsp-rs/0.1\r\n"));
    }

    #[test]
    fn parse_round_trip_with_body() {
        let resp = RtspResponse::ok().add_header("CSeq", "9").with_body("v=0\r\n".to_string());
        let bytes = resp.serialize();
        let parsed = RtspResponse::parse(&bytes).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn parse_unauthorized_with_www_authenticate() {
        let raw = b"RTSP/1.0 401 Unauthorized\r\nCSeq: 2\r\nWWW-Authenticate: Digest realm=\"x\", nonce=\"y\"\r\n\r\n";
        let resp = RtspResponse::parse(raw).unwrap();
        assert_eq!(resp.status_code, 401);
        assert!(!resp.is_success());
        assert_eq!(resp.get_header("WWW-Authenticate"), Some("Digest realm=\"x\", nonce=\"y\""));
    }
}
