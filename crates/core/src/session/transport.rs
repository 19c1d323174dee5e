//! Negotiated RTP/RTCP transport parameters (RFC 2326 §12.39).
//!
//! A session's media can flow two ways:
//!
//! - **UDP unicast**: RTP/RTCP on a pair of UDP ports (`client_port=a-b`,
//!   `server_port=c-d`).
//! - **Interleaved** (TCP): RTP/RTCP multiplexed onto the signaling
//!   connection itself, framed with the `$` magic byte (RFC 2326 §10.12).
//!
//! Clients try UDP first and fall back to interleaved if the server replies
//! `461 Unsupported Transport`.

use std::net::SocketAddr;

/// Parsed `Transport` header value, before a server has picked ports or a
/// client has learned the server's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportHeader {
    Udp {
        unicast: bool,
        client_port: Option<(u16, u16)>,
        server_port: Option<(u16, u16)>,
    },
    Interleaved {
        channels: (u8, u8),
    },
}

impl TransportHeader {
    /// Parses a single `Transport` header value, e.g.
    /// `RTP/AVP;unicast;client_port=8000-8001` or
    /// `RTP/AVP/TCP;unicast;interleaved=0-1`.
    ///
    /// Only the first transport specification in a comma-separated list is
    /// parsed; a client offering both UDP and interleaved retries SETUP with
    /// a second request rather than listing alternatives, matching what real
    /// RTSP clients do.
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.split(',').next()?.trim();
        let mut parts = spec.split(';');
        let proto = parts.next()?.trim();

        if proto.eq_ignore_ascii_case("RTP/AVP/TCP") {
            for part in parts {
                if let Some(range) = part.trim().strip_prefix("interleaved=") {
                    return Some(Self::Interleaved { channels: parse_u8_pair(range)? });
                }
            }
            return None;
        }

        let mut unicast = true;
        let mut client_port = None;
        let mut server_port = None;
        for part in parts {
            let part = part.trim();
            if part.eq_ignore_ascii_case("multicast") {
                unicast = false;
            } else if part.eq_ignore_ascii_case("unicast") {
                unicast = true;
            } else if let Some(range) = part.strip_prefix("client_port=") {
                client_port = Some(parse_u16_pair(range)?);
            } else if let Some(range) = part.strip_prefix("server_port=") {
                server_port = Some(parse_u16_pair(range)?);
            }
        }
        Some(Self::Udp { unicast, client_port, server_port })
    }

    /// Formats back to a `Transport` header value.
    pub fn format(&self) -> String {
        match self {
            Self::Udp { unicast, client_port, server_port } => {
                let mut s = "RTP/AVP;".to_string();
                s.push_str(if *unicast { "unicast" } else { "multicast" });
                if let Some((a, b)) = client_port {
                    s.push_str(&format!(";client_port={a}-{b}"));
                }
                if let Some((a, b)) = server_port {
                    s.push_str(&format!(";server_port={a}-{b}"));
                }
                s
            }
            Self::Interleaved { channels: (a, b) } => format!("RTP/AVP/TCP;unicast;interleaved={a}-{b}"),
        }
    }
}

fn parse_u16_pair(range: &str) -> Option<(u16, u16)> {
    let (a, b) = range.split_once('-')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

fn parse_u8_pair(range: &str) -> Option<(u8, u8)> {
    let (a, b) = range.split_once('-')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

/// Fully negotiated transport for one session, ready to send/receive media.
#[derive(Debug, Clone)]
pub enum Transport {
    Udp {
        /// Address media is sent to (`client_addr : client_rtp_port`), learned
        /// either from the SETUP request's source address or from the first
        /// inbound packet when the client is itself behind NAT.
        client_addr: SocketAddr,
        client_rtp_port: u16,
        client_rtcp_port: u16,
        server_rtp_port: u16,
        server_rtcp_port: u16,
    },
    Interleaved {
        /// RTP channel id; RTCP uses `rtp_channel + 1` (RFC 2326 §10.12).
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

impl Transport {
    /// The address media is exchanged with, when this transport is UDP.
    /// Interleaved transport has no address of its own — it rides the
    /// existing TCP connection — so this returns `None`.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Udp { client_addr, .. } => Some(*client_addr),
            Self::Interleaved { .. } => None,
        }
    }

    /// Formats the `Transport` header this negotiation resulted in.
    pub fn header(&self) -> TransportHeader {
        match self {
            Self::Udp { client_rtp_port, client_rtcp_port, server_rtp_port, server_rtcp_port, .. } => {
                TransportHeader::Udp {
                    unicast: true,
                    client_port: Some((*client_rtp_port, *client_rtcp_port)),
                    server_port: Some((*server_rtp_port, *server_rtcp_port)),
                }
            }
            Self::Interleaved { rtp_channel, rtcp_channel } => {
                TransportHeader::Interleaved { channels: (*rtp_channel, *rtcp_channel) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_udp_transport() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(th, TransportHeader::Udp { unicast: true, client_port: Some((5000, 5001)), server_port: None });
    }

    #[test]
    fn parse_interleaved_transport() {
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        assert_eq!(th, TransportHeader::Interleaved { channels: (0, 1) });
    }

    #[test]
    fn parse_without_client_port_still_parses_udp_shape() {
        let th = TransportHeader::parse("RTP/AVP;unicast").unwrap();
        assert_eq!(th, TransportHeader::Udp { unicast: true, client_port: None, server_port: None });
    }

    #[test]
    fn format_round_trips() {
        let th = TransportHeader::Udp { unicast: true, client_port: Some((8000, 8001)), server_port: Some((5000, 5001)) };
        assert_eq!(TransportHeader::parse(&th.format()).unwrap(), th);
    }
}
