//! Minimal RTSP URL handling.
//!
//! Full RFC 3986 URI parsing (percent-decoding, userinfo, query strings) is
//! out of scope here — this only implements the two operations the session
//! and mount layers actually need: splitting an RTSP URL into its connection
//! parts, and deriving per-track control URLs from a base URL (RFC 2326 §C.1.1).

use crate::error::{ParseErrorKind, Result, RtspError};

/// A parsed `rtsp://` (or `rtsps://`) URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspUrl {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl RtspUrl {
    /// Parses `rtsp://host[:port]/path`. Defaults to port 554 (RFC 2326 §3.2).
    pub fn parse(raw: &str) -> Result<Self> {
        let (secure, rest) = if let Some(r) = raw.strip_prefix("rtsps://") {
            (true, r)
        } else if let Some(r) = raw.strip_prefix("rtsp://") {
            (false, r)
        } else {
            return Err(invalid());
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(invalid());
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().map_err(|_| invalid())?),
            None => (authority.to_string(), if secure { 322 } else { 554 }),
        };

        Ok(Self { secure, host, port, path: path.to_string() })
    }

    /// Splits the path into its base path and trailing control attribute —
    /// the path segments up to but excluding a trailing `trackID=N` or
    /// similar control attribute, and that final segment itself (RFC 2326
    /// §C.1.1). Neither element carries a leading or trailing slash, e.g.
    /// `BasePath("rtsp://h/a/b/trackID=3") == ("a/b", "trackID=3")`.
    pub fn base_path(&self) -> (String, String) {
        let trimmed = self.path.trim_start_matches('/');
        match trimmed.rfind('/') {
            Some(pos) => (trimmed[..pos].to_string(), trimmed[pos + 1..].to_string()),
            None => (String::new(), trimmed.to_string()),
        }
    }

    /// Resolves a per-track `a=control:` attribute against this URL.
    ///
    /// An absolute control attribute (starting with `rtsp://`) is returned
    /// unchanged; a relative one is appended to the *full* path (query
    /// string included), not the base path — a DESCRIBE URL has no control
    /// attribute on it yet, so there is nothing to strip. This preserves
    /// query placement: `…/p?q=1` + `trackID=1` -> `…/p?q=1/trackID=1`.
    pub fn add_control_attribute(&self, control: &str) -> String {
        if control.starts_with("rtsp://") || control.starts_with("rtsps://") {
            return control.to_string();
        }
        let scheme = if self.secure { "rtsps" } else { "rtsp" };
        if control == "*" {
            return format!("{scheme}://{}:{}{}", self.host, self.port, self.path);
        }
        let sep = if self.path.ends_with('/') { "" } else { "/" };
        format!("{scheme}://{}:{}{}{}{}", self.host, self.port, self.path, sep, control)
    }
}

fn invalid() -> RtspError {
    RtspError::Parse { kind: ParseErrorKind::InvalidHeaderValue("URL") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_and_path() {
        let url = RtspUrl::parse("rtsp://10.0.0.1:8554/stream/track1").unwrap();
        assert_eq!(url.host, "10.0.0.1");
        assert_eq!(url.port, 8554);
        assert_eq!(url.path, "/stream/track1");
        assert!(!url.secure);
    }

    #[test]
    fn defaults_to_port_554() {
        let url = RtspUrl::parse("rtsp://camera.local/live").unwrap();
        assert_eq!(url.port, 554);
    }

    #[test]
    fn base_path_strips_final_segment() {
        let url = RtspUrl::parse("rtsp://host/stream/track1").unwrap();
        assert_eq!(url.base_path(), ("stream".to_string(), "track1".to_string()));
    }

    #[test]
    fn relative_control_attribute_is_resolved() {
        let url = RtspUrl::parse("rtsp://host:554/stream").unwrap();
        assert_eq!(url.add_control_attribute("trackID=0"), "rtsp://host:554/stream/trackID=0");
    }

    #[test]
    fn absolute_control_attribute_is_returned_verbatim() {
        let url = RtspUrl::parse("rtsp://host:554/stream").unwrap();
        assert_eq!(url.add_control_attribute("rtsp://other/track"), "rtsp://other/track");
    }

    #[test]
    fn control_attribute_preserves_query_placement() {
        let url = RtspUrl::parse("rtsp://host:554/p?q=1").unwrap();
        assert_eq!(url.add_control_attribute("trackID=1"), "rtsp://host:554/p?q=1/trackID=1");
    }

    #[test]
    fn base_path_and_control_attribute_round_trip_trackid() {
        let url = RtspUrl::parse("rtsp://h/a/b/trackID=3").unwrap();
        assert_eq!(url.base_path(), ("a/b".to_string(), "trackID=3".to_string()));
    }

    #[test]
    fn rejects_non_rtsp_scheme() {
        assert!(RtspUrl::parse("http://host/stream").is_err());
    }
}
