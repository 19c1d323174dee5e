use crate::error::{ParseErrorKind, Result, RtspError};
use crate::protocol::headers::Headers;
use crate::protocol::method::Method;

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1-style syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// `body` is `Some` only when `Content-Length` is present and non-zero; the two
/// are always consistent with each other, enforced at construction and parse time.
#[derive(Debug, Clone, PartialEq)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, ...).
    pub method: Method,
    /// Request-URI (e.g. `rtsp://host:port/stream/track1`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers, case-insensitive on lookup (RFC 2326 §4.2).
    pub headers: Headers,
    /// Message body, present only alongside a non-zero `Content-Length`.
    pub body: Option<Vec<u8>>,
}

impl RtspRequest {
    /// Builds a request with no headers and no body.
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: "RTSP/1.0".to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// Attaches a body, setting `Content-Length` to match.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.headers.set("Content-Length", body.len().to_string());
        self.body = Some(body);
        self
    }

    /// Parses a complete RTSP request: request line, headers, blank line, and
    /// (if `Content-Length` says so) exactly that many body bytes.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let sep = find_header_terminator(raw).ok_or(RtspError::Parse { kind: ParseErrorKind::EmptyRequest })?;
        let head = std::str::from_utf8(&raw[..sep.0])
            .map_err(|_| RtspError::Parse { kind: ParseErrorKind::InvalidEncoding })?;
        let body_bytes = &raw[sep.1..];

        let mut lines = head.lines();
        let request_line = lines.next().ok_or(RtspError::Parse { kind: ParseErrorKind::EmptyRequest })?;
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(RtspError::Parse { kind: ParseErrorKind::InvalidRequestLine });
        }

        let method = Method::parse(parts[0]).ok_or(RtspError::Parse { kind: ParseErrorKind::InvalidRequestLine })?;
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        if version != "RTSP/1.0" {
            tracing::warn!(version, "peer sent non-RTSP/1.0 version");
        }

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

        Ok(RtspRequest { method, uri, version, headers, body })
    }

    /// Serializes back to wire bytes: request line, headers (CSeq first, then
    /// alphabetical), blank line, body.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version).into_bytes();
        for (name, value) in self.headers.ordered_for_write() {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }

    /// Look up a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Returns the CSeq header value (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.headers.cseq()
    }
}

/// Finds the `\r\n\r\n` (or bare `\n\n`) header/body boundary.
///
/// Returns `(header_end, body_start)` so callers can slice around whichever
/// terminator was actually used.
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
    fn parse_options_request() {
        let raw = b"OPTIONS rtsp://localhost:8554/test RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, Method::Options);
        assert_eq!(req.uri, "rtsp://localhost:8554/test");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), Some("1"));
        assert!(req.body.is_none());
    }

    #[test]
    fn parse_setup_with_transport() {
        let raw = b"SETUP rtsp://localhost:8554/test/track1 RTSP/1.0\r\n\
                   CSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=8000-8001\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, Method::Setup);
        assert_eq!(req.cseq(), Some("3"));
        assert_eq!(req.get_header("Transport"), Some("RTP/AVP;unicast;client_port=8000-8001"));
    }

    #[test]
    fn parse_announce_with_sdp_body() {
        let sdp = b"v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n";
        let mut raw = format!(
            "ANNOUNCE rtsp://localhost/test RTSP/1.0\r\nCSeq: 4\r\nContent-Length: {}\r\n\r\n",
            sdp.len()
        )
        .into_bytes();
        raw.extend_from_slice(sdp);
        let req = RtspRequest::parse(&raw).unwrap();
        assert_eq!(req.method, Method::Announce);
        assert_eq!(req.body.as_deref(), Some(sdp.as_slice()));
    }

    #[test]
    fn body_length_mismatch_is_rejected() {
        let raw = b"ANNOUNCE rtsp://localhost/test RTSP/1.0\r\nCSeq: 4\r\nContent-Length: 10\r\n\r\nshort";
        assert!(matches!(RtspRequest::parse(raw), Err(RtspError::Parse { kind: ParseErrorKind::BodyLengthMismatch })));
    }

    #[test]
    fn parse_empty_request() {
        assert!(RtspRequest::parse(b"").is_err());
    }

    #[test]
    fn parse_invalid_request_line() {
        assert!(RtspRequest::parse(b"JUST_A_METHOD\r\n\r\n").is_err());
    }

    #[test]
    fn parse_unknown_method_is_rejected() {
        assert!(RtspRequest::parse(b"FROB rtsp://localhost/test RTSP/1.0\r\n\r\n").is_err());
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let raw = b"OPTIONS rtsp://localhost RTSP/1.0\r\ncseq: 42\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.get_header("CSeq"), Some("42"));
        assert_eq!(req.get_header("cseq"), Some("42"));
        assert_eq!(req.get_header("CSEQ"), Some("42"));
    }

    #[test]
    fn round_trip_preserves_semantic_content() {
        let mut req = RtspRequest::new(Method::Options, "rtsp://localhost:8554/test");
        req.headers.insert("CSeq", "1");
        let bytes = req.serialize();
        let parsed = RtspRequest::parse(&bytes).unwrap();
        assert_eq!(parsed, req);
    }
}
