//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! RTSP uses a split transport model:
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling. One TCP
//!   connection per client, with a thread per connection.
//!
//! - **UDP** ([`udp`]): carries RTP media packets. Each session owns a pair
//!   of ephemeral sockets, learning the peer's address from the first
//!   packet received when the peer itself is unreachable until then.
//!
//! - **Interleaved** ([`interleaved`]): RTP/RTCP multiplexed onto the RTSP
//!   TCP connection using `$` framing (RFC 2326 §10.12), for peers behind
//!   NAT or firewalls that block separate UDP flows.

pub mod interleaved;
pub mod tcp;
pub mod udp;

pub use interleaved::InterleavedFrame;
pub use udp::UdpPair;
