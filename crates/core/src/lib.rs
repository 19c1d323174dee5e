//! # rtsp — RTSP server library for live media streaming
//!
//! A Rust library for publishing and recording live media streams (H.264
//! video, AAC audio) over the Real-Time Streaming Protocol (RTSP), with
//! both a server and a client.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Request/response parsing, session lifecycle, transport negotiation |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP | Packet header format, SSRC generation, sequence/timestamp semantics |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | Session description generation for DESCRIBE responses |
//! | [RFC 6184](https://tools.ietf.org/html/rfc6184) | H.264 RTP payload | NAL unit packetization, FU-A fragmentation, SDP fmtp attributes |
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Adapters (CLI: rtsp-server / rtsp-client)│
//! ├──────────────────────────────────────────┤
//! │  Server / Client — public API, state     │
//! │  MountRegistry   — named stream endpoints│
//! ├──────────────────────────────────────────┤
//! │  Protocol      — RTSP parsing, SDP, auth │
//! │  Session       — state machine, transport│
//! ├──────────────────────────────────────────┤
//! │  Transport     — TCP signaling, UDP data,│
//! │                  interleaved TCP framing │
//! │  Media         — RTP/RTCP, codecs        │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use rtsp::Server;
//!
//! let mut server = Server::new("0.0.0.0:8554");
//! server.start().unwrap();
//!
//! // Push H.264 Annex B frames — the server packetizes and delivers via RTP.
//! // server.publish_frame("/stream", &h264_data, 3000).unwrap();
//! ```
//!
//! ## Crate layout
//!
//! - [`server`] — High-level [`Server`] orchestrator and [`ServerConfig`].
//! - [`client`] — [`client::Client`], the RTSP client counterpart to [`Server`].
//! - [`mount`] — [`Mount`] (stream endpoint) and [`MountRegistry`].
//! - [`protocol`] — RTSP request/response parsing, method handling, SDP generation.
//! - [`session`] — RTSP session state machine and transport negotiation.
//! - [`transport`] — TCP listener for RTSP signaling, UDP and interleaved-TCP media delivery.
//! - [`media`] — [`Packetizer`]/[`media::Depacketizer`] traits, RTP header codec, H.264/AAC.
//! - [`rtcp`] — RTCP Sender/Receiver Report encode and parse.
//! - [`auth`] — HTTP Digest authentication (RFC 2617).
//! - [`error`] — [`RtspError`] enum and [`Result`] alias.

pub mod auth;
pub mod client;
pub mod error;
pub mod media;
pub mod mount;
pub mod protocol;
pub mod rtcp;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{Client, ClientConfig, TransportMode};
pub use error::{Result, RtspError};
pub use media::{AccessUnit, Packetizer};
pub use mount::{DEFAULT_MOUNT_PATH, Mount, MountRegistry};
pub use server::{Server, ServerConfig, Viewer};
