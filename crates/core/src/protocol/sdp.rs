//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses. The format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! a=tool:rtsp-rs                                ← server software (§6)
//! a=sendonly                                    ← direction (§6)
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1                ← codec parameters
//! a=control:track1                              ← track control URL
//! ```
//!
//! All session/origin fields come from [`ServerConfig`](crate::ServerConfig)
//! so nothing is hardcoded.

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::mount::Mount;

/// Generate an SDP session description for the given mount.
///
/// When multi-track (audio+video) support is added, this will iterate
/// over the mount's tracks to produce multiple `m=` lines.
pub fn generate_sdp(
    mount: &Mount,
    ip: &str,
    session_id: &str,
    session_version: &str,
    username: &str,
    session_name: &str,
) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        username, session_id, session_version, ip
    ));
    sdp.push(format!("s={}", session_name));
    sdp.push(format!("c=IN IP4 {}", ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:rtsp-rs".to_string());
    sdp.push("a=sendonly".to_string());
    sdp.push(format!("m=video 0 RTP/AVP {}", mount.payload_type()));
    sdp.extend_from_slice(&mount.sdp_attributes()[0..]);

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

/// One `m=` media section of a parsed SDP description, with the `a=`
/// attributes a client actually needs to set up the track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    /// `video` / `audio` / ... (the first token of the `m=` line).
    pub media_type: String,
    /// RTP payload type from the `m=` line (e.g. `96`).
    pub payload_type: u8,
    /// `a=control:` value, absolute or relative to the session's base URL.
    pub control: Option<String>,
    /// `a=rtpmap:<pt> <encoding>/<clock-rate>[/<channels>]` split out.
    pub encoding_name: Option<String>,
    pub clock_rate: Option<u32>,
    /// Raw `a=fmtp:<pt> <params>` parameter string, unsplit.
    pub fmtp: Option<String>,
}

/// A parsed SDP session description (RFC 8866), as received in a DESCRIBE
/// response body or sent in an ANNOUNCE request body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdpSessionDescription {
    /// `a=control:` at the session level (before the first `m=` line).
    pub session_control: Option<String>,
    pub media: Vec<SdpMedia>,
}

fn sdp_parse_error() -> RtspError {
    RtspError::Parse { kind: ParseErrorKind::InvalidEncoding }
}

impl SdpSessionDescription {
    /// Parses an SDP body into its session- and media-level attributes.
    ///
    /// Only the fields this crate actually needs are extracted; unknown
    /// line types (`v=`, `o=`, `t=`, ...) are skipped.
    pub fn parse(body: &str) -> Result<Self> {
        let mut session = SdpSessionDescription::default();
        let mut in_media = false;

        for raw_line in body.split(['\n']) {
            let line = raw_line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (kind, value) = line.split_once('=').ok_or_else(sdp_parse_error)?;

            if kind == "m" {
                let mut parts = value.split_whitespace();
                let media_type = parts.next().ok_or_else(sdp_parse_error)?.to_string();
                let _port = parts.next().ok_or_else(sdp_parse_error)?;
                let _proto = parts.next().ok_or_else(sdp_parse_error)?;
                let payload_type: u8 = parts
                    .next()
                    .ok_or_else(sdp_parse_error)?
                    .parse()
                    .map_err(|_| sdp_parse_error())?;
                session.media.push(SdpMedia {
                    media_type,
                    payload_type,
                    control: None,
                    encoding_name: None,
                    clock_rate: None,
                    fmtp: None,
                });
                in_media = true;
                continue;
            }

            if kind != "a" {
                continue;
            }

            let (attr, attr_value) = match value.split_once(':') {
                Some((a, v)) => (a, Some(v)),
                None => (value, None),
            };

            match attr {
                "control" => {
                    let control = attr_value.ok_or_else(sdp_parse_error)?.to_string();
                    if in_media {
                        session.media.last_mut().unwrap().control = Some(control);
                    } else {
                        session.session_control = Some(control);
                    }
                }
                "rtpmap" if in_media => {
                    let rest = attr_value.ok_or_else(sdp_parse_error)?;
                    let (_pt, desc) = rest.split_once(' ').ok_or_else(sdp_parse_error)?;
                    let mut desc_parts = desc.split('/');
                    let encoding = desc_parts.next().ok_or_else(sdp_parse_error)?;
                    let clock_rate: u32 = desc_parts
                        .next()
                        .ok_or_else(sdp_parse_error)?
                        .parse()
                        .map_err(|_| sdp_parse_error())?;
                    let media = session.media.last_mut().unwrap();
                    media.encoding_name = Some(encoding.to_string());
                    media.clock_rate = Some(clock_rate);
                }
                "fmtp" if in_media => {
                    let rest = attr_value.ok_or_else(sdp_parse_error)?;
                    let (_pt, params) = rest.split_once(' ').ok_or_else(sdp_parse_error)?;
                    session.media.last_mut().unwrap().fmtp = Some(params.to_string());
                }
                _ => {}
            }
        }

        if session.media.is_empty() {
            return Err(sdp_parse_error());
        }

        Ok(session)
    }
}

/// Generates the SDP body a client sends in an ANNOUNCE request to publish
/// a stream, mirroring [`generate_sdp`] but with a `sendonly`-free, generic
/// direction (the publisher is the media source, so no direction attribute
/// is required — RFC 8866 §6.7 defaults to `sendrecv`).
pub fn generate_announce_sdp(
    mount: &Mount,
    ip: &str,
    session_id: &str,
    username: &str,
    session_name: &str,
) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!("o={} {} 1 IN IP4 {}", username, session_id, ip));
    sdp.push(format!("s={}", session_name));
    sdp.push(format!("c=IN IP4 {}", ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:rtsp-rs".to_string());
    sdp.push(format!("m=video 0 RTP/AVP {}", mount.payload_type()));
    sdp.extend_from_slice(&mount.sdp_attributes()[0..]);

    format!("{}\r\n", sdp.join("\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::H264Packetizer;

    #[test]
    fn generates_h264_sdp() {
        let mount = Mount::new("/stream", Box::new(H264Packetizer::new(96, 0x12345678)));
        let sdp = generate_sdp(
            &mount,
            "192.168.1.100",
            "1234567890",
            "1",
            "server",
            "Test Session",
        );
        assert!(sdp.contains("v=0\r\n"));
        assert!(sdp.contains("o=server 1234567890 1 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("s=Test Session\r\n"));
        assert!(
            sdp.contains("c=IN IP4 192.168.1.100\r\n"),
            "c= must use configured IP, not 0.0.0.0"
        );
        assert!(
            sdp.contains("a=tool:rtsp-rs\r\n"),
            "SDP must include tool attribute"
        );
        assert!(
            sdp.contains("a=sendonly\r\n"),
            "SDP must include sendonly direction"
        );
        assert!(
            sdp.contains("a=rtpmap:96 H264/90000\r\n"),
            "SDP must include valid rtpmap"
        );
        assert!(sdp.contains("a=fmtp:96 packetization-mode=1\r\n"));
        assert!(sdp.contains("a=control:track1\r\n"));

        // Verify ordering: rtpmap must come before fmtp (RFC 6184 §8.2.1)
        let rtpmap_idx = sdp.find("a=rtpmap").expect("SDP must include rtpmap");
        let fmtp_idx = sdp.find("a=fmtp").expect("SDP must include fmtp");
        assert!(
            rtpmap_idx < fmtp_idx,
            "a=rtpmap must precede a=fmtp per RFC 6184"
        );

        // Session-level attrs must come before media section
        let sendonly_idx = sdp.find("a=sendonly").expect("SDP must include sendonly");
        let m_idx = sdp.find("m=video").expect("SDP must include media section");
        assert!(
            sendonly_idx < m_idx,
            "session-level attrs must precede m= line"
        );

        assert!(fmtp_idx > m_idx, "media attributes must follow m=video");
        assert!(sdp.ends_with("\r\n"), "SDP must end with CRLF");
    }
}
