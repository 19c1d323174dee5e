//! Error types shared by the client, server, and media codecs.

use std::fmt;

/// Errors that can occur anywhere in the RTSP client/server library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse), [`UnsupportedTransport`](Self::UnsupportedTransport),
///   [`AuthenticationFailed`](Self::AuthenticationFailed), [`AuthenticationRequired`](Self::AuthenticationRequired).
/// - **Transport**: [`Io`](Self::Io) — socket/network failures.
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`SessionNotPlaying`](Self::SessionNotPlaying),
///   [`TransportNotConfigured`](Self::TransportNotConfigured),
///   [`InvalidStateTransition`](Self::InvalidStateTransition).
/// - **Server**: [`NotStarted`](Self::NotStarted), [`AlreadyRunning`](Self::AlreadyRunning).
/// - **Mount**: [`MountNotFound`](Self::MountNotFound).
/// - **Media**: [`Codec`](Self::Codec) — H.264/AAC payloading errors.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No session with the given ID exists in the [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// SETUP has not been completed for this session (no transport negotiated).
    #[error("transport not configured for session: {0}")]
    TransportNotConfigured(String),

    /// Attempted to send or receive media on a session that is not Playing/Recording.
    #[error("session not in playing state: {0}")]
    SessionNotPlaying(String),

    /// The session state machine rejected a requested transition (RFC 2326 §11, 455 response).
    #[error("invalid session state transition: {0}")]
    InvalidStateTransition(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP message (RFC 2326 §6) or a header value.
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Server-side UDP port allocation exhausted the configured range.
    #[error("port range exhausted (tried to allocate beyond u16 range)")]
    PortRangeExhausted,

    /// No mount registered at the requested path.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// Neither party offered a transport the other side supports.
    #[error("no common transport could be negotiated")]
    UnsupportedTransport,

    /// Server challenged with Digest but the client has no credentials configured.
    #[error("server requires authentication and no credentials are configured")]
    AuthenticationRequired,

    /// A Digest-authenticated retry was rejected a second time.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Keepalive was not acknowledged within the negotiated timeout.
    #[error("keepalive timed out")]
    KeepaliveTimeout,

    /// Request or response exceeded size limits (e.g. body over 131072 bytes).
    #[error("message too large: {0}")]
    MessageTooLarge(String),

    /// A media codec (H.264 Annex B, RTP depacketizer, AAC AU framer, ...) rejected its input.
    #[error("codec error: {0}")]
    Codec(String),

    /// The peer returned a non-2xx RTSP status for a request that required success.
    #[error("RTSP request failed: {status} {reason}")]
    RequestFailed { status: u16, reason: String },

    /// A client request timed out waiting for a response (no RTSP status involved).
    #[error("request timed out")]
    Timeout,

    /// The peer closed the connection (or a write failed because it already had).
    #[error("connection closed")]
    ConnectionClosed,

    /// A bounded resource (channel table, interleaved channel ids, ...) is full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request/status line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the expected `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// Body length did not match the declared `Content-Length`.
    BodyLengthMismatch,
    /// A structured header value (Transport, Range, Session, ...) could not be parsed.
    InvalidHeaderValue(&'static str),
    /// The message was not valid UTF-8 where UTF-8 was required.
    InvalidEncoding,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::BodyLengthMismatch => write!(f, "body length does not match Content-Length"),
            Self::InvalidHeaderValue(name) => write!(f, "invalid {name} header value"),
            Self::InvalidEncoding => write!(f, "message is not valid UTF-8"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
