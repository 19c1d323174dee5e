use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, RtspError};

/// A bound RTP/RTCP UDP socket pair for one session's media flow.
///
/// Per RFC 3550 §11, RTP should use an even port and RTCP the next odd one.
/// The server allocates such a pair up front via
/// [`SessionManager::allocate_server_ports`](crate::session::SessionManager::allocate_server_ports);
/// a client asks the OS for an ephemeral pair with the same even/odd
/// relationship, retrying a few times since nothing guarantees the OS hands
/// out consecutive ports.
///
/// This layer is deliberately address-only — it does not know about
/// sessions or mounts. The caller resolves session state to socket
/// addresses before calling [`send_rtp`](Self::send_rtp).
pub struct UdpPair {
    rtp: Arc<UdpSocket>,
    rtcp: Arc<UdpSocket>,
}

const EPHEMERAL_BIND_ATTEMPTS: usize = 20;

impl UdpPair {
    /// Binds to a specific, already-allocated RTP/RTCP port pair (server side).
    pub fn bind(rtp_port: u16, rtcp_port: u16) -> Result<Self> {
        let rtp = UdpSocket::bind(("0.0.0.0", rtp_port))?;
        let rtcp = UdpSocket::bind(("0.0.0.0", rtcp_port))?;
        Ok(Self { rtp: Arc::new(rtp), rtcp: Arc::new(rtcp) })
    }

    /// Binds an ephemeral even/odd port pair (client side).
    pub fn bind_ephemeral() -> Result<Self> {
        for _ in 0..EPHEMERAL_BIND_ATTEMPTS {
            let rtp = UdpSocket::bind("0.0.0.0:0")?;
            let rtp_port = rtp.local_addr()?.port();
            if rtp_port % 2 != 0 {
                continue;
            }
            if let Ok(rtcp) = UdpSocket::bind(("0.0.0.0", rtp_port + 1)) {
                return Ok(Self { rtp: Arc::new(rtp), rtcp: Arc::new(rtcp) });
            }
        }
        Err(RtspError::PortRangeExhausted)
    }

    /// Binds the first free even/odd pair within `[base, base + range)`
    /// (spec §4.4: client UDP ports are scanned from a configurable base,
    /// defaulting to 8000-8999), falling back to an OS-assigned ephemeral
    /// pair if the whole range is exhausted.
    pub fn bind_in_range(base: u16, range: u16) -> Result<Self> {
        let mut port = base;
        while port < base.saturating_add(range) {
            if port % 2 != 0 {
                port += 1;
                continue;
            }
            if let (Ok(rtp), Ok(rtcp)) = (UdpSocket::bind(("0.0.0.0", port)), UdpSocket::bind(("0.0.0.0", port + 1)))
            {
                return Ok(Self { rtp: Arc::new(rtp), rtcp: Arc::new(rtcp) });
            }
            port += 2;
        }
        Self::bind_ephemeral()
    }

    /// The locally bound `(rtp_port, rtcp_port)`.
    pub fn local_ports(&self) -> Result<(u16, u16)> {
        Ok((self.rtp.local_addr()?.port(), self.rtcp.local_addr()?.port()))
    }

    /// Connects both sockets to the peer's `(rtp_port, rtcp_port)`, so
    /// `send`/`recv` can be used without re-specifying the address and
    /// datagrams from anyone else are dropped by the kernel.
    pub fn connect_peer(&self, ip: IpAddr, rtp_port: u16, rtcp_port: u16) -> Result<()> {
        self.rtp.connect(SocketAddr::new(ip, rtp_port))?;
        self.rtcp.connect(SocketAddr::new(ip, rtcp_port))?;
        Ok(())
    }

    pub fn send_rtp_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.rtp.send_to(payload, addr)?)
    }

    pub fn send_rtcp_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.rtcp.send_to(payload, addr)?)
    }

    pub fn send_rtp(&self, payload: &[u8]) -> Result<usize> {
        Ok(self.rtp.send(payload)?)
    }

    pub fn send_rtcp(&self, payload: &[u8]) -> Result<usize> {
        Ok(self.rtcp.send(payload)?)
    }

    /// Receives one RTP datagram, learning the sender's address.
    pub fn recv_rtp(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.rtp.recv_from(buf)?)
    }

    /// Receives one RTCP datagram, learning the sender's address.
    pub fn recv_rtcp(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.rtcp.recv_from(buf)?)
    }

    /// Bounds how long `recv_rtp`/`recv_rtcp` block, so reader threads can
    /// periodically check a shutdown flag.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.rtp.set_read_timeout(timeout)?;
        self.rtcp.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn rtcp_socket(&self) -> Arc<UdpSocket> {
        self.rtcp.clone()
    }

    pub fn rtp_socket(&self) -> Arc<UdpSocket> {
        self.rtp.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_pair_is_even_odd_and_reachable() {
        let server = UdpPair::bind_ephemeral().unwrap();
        let client = UdpPair::bind_ephemeral().unwrap();
        let (srtp, srtcp) = server.local_ports().unwrap();
        assert_eq!(srtcp, srtp + 1);

        let (crtp, crtcp) = client.local_ports().unwrap();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        server.connect_peer(loopback, crtp, crtcp).unwrap();
        client.connect_peer(loopback, srtp, srtcp).unwrap();

        server.send_rtp(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = client.recv_rtp(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
