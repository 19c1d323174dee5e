use std::collections::HashMap;
use std::io::Write;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, RtspError};
use crate::media::Packetizer;
use crate::media::h264::H264Packetizer;
use crate::media::AccessUnit;
use crate::mount::{DEFAULT_MOUNT_PATH, Mount, MountRegistry};
use crate::rtcp::SenderReport;
use crate::session::SessionManager;
use crate::transport::InterleavedFrame;
use crate::transport::tcp;
use crate::transport::udp::UdpPair;

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch.
const NTP_UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// Public RTSP port for future URL-based headers (e.g. RTP-Info).
    pub public_port: Option<u16>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// When set, every method but OPTIONS requires Digest authentication
    /// (RFC 2617, via RFC 2326 §18) with these `(username, password)` credentials.
    pub credentials: Option<(String, String)>,
    /// Digest realm advertised in the `WWW-Authenticate` challenge.
    pub realm: String,
    /// How often the server sends an unsolicited RTCP Sender Report to each
    /// Playing session (RFC 3550 §6.4.1).
    pub sender_report_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            public_port: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            credentials: None,
            realm: "rtsp-rs".to_string(),
            sender_report_interval: Duration::from_secs(5),
        }
    }
}

/// An RTP/RTCP sink negotiated over the RTSP TCP connection itself
/// (interleaved transport, RFC 2326 §10.12), rather than separate UDP sockets.
#[derive(Clone)]
pub struct InterleavedSink {
    pub writer: Arc<Mutex<TcpStream>>,
    pub rtp_channel: u8,
    pub rtcp_channel: u8,
}

impl InterleavedSink {
    pub fn send_rtp(&self, payload: &[u8]) -> Result<()> {
        let frame = InterleavedFrame::new(self.rtp_channel, payload.to_vec());
        self.writer.lock().write_all(&frame.encode())?;
        Ok(())
    }

    pub fn send_rtcp(&self, payload: &[u8]) -> Result<()> {
        let frame = InterleavedFrame::new(self.rtcp_channel, payload.to_vec());
        self.writer.lock().write_all(&frame.encode())?;
        Ok(())
    }
}

/// Shared per-session media transport state.
///
/// [`crate::protocol::handler::MethodHandler`] populates this during SETUP
/// (binding a [`UdpPair`] or registering an [`InterleavedSink`]); [`Server`]
/// reads it to deliver RTP/RTCP and background threads (sender reports,
/// RTCP ingestion) read it to find each session's transport.
#[derive(Clone)]
pub struct MediaRuntime {
    pub(crate) udp_pairs: Arc<RwLock<HashMap<String, Arc<UdpPair>>>>,
    pub(crate) interleaved_sinks: Arc<RwLock<HashMap<String, InterleavedSink>>>,
    /// Callback invoked with each access unit reassembled from a RECORDing
    /// session's inbound media, set via [`Server::on_recorded_access_unit`].
    pub(crate) record_sink: Arc<RwLock<Option<RecordCallback>>>,
}

/// Receives `(session_id, access_unit)` for every access unit a RECORDing
/// client publishes, however its media arrived (UDP or interleaved TCP).
pub type RecordCallback = Arc<dyn Fn(&str, AccessUnit) + Send + Sync>;

impl MediaRuntime {
    fn new() -> Self {
        Self {
            udp_pairs: Arc::new(RwLock::new(HashMap::new())),
            interleaved_sinks: Arc::new(RwLock::new(HashMap::new())),
            record_sink: Arc::new(RwLock::new(None)),
        }
    }

    /// Drops all transport state for a session (TEARDOWN or disconnect cleanup).
    pub(crate) fn forget_session(&self, session_id: &str) {
        self.udp_pairs.write().remove(session_id);
        self.interleaved_sinks.write().remove(session_id);
    }

    pub(crate) fn deliver(&self, session_id: &str, payload: &[u8], is_rtp: bool) -> Result<()> {
        if let Some(pair) = self.udp_pairs.read().get(session_id) {
            if is_rtp { pair.send_rtp(payload)?; } else { pair.send_rtcp(payload)?; }
            return Ok(());
        }
        if let Some(sink) = self.interleaved_sinks.read().get(session_id) {
            if is_rtp { sink.send_rtp(payload)?; } else { sink.send_rtcp(payload)?; }
            return Ok(());
        }
        Err(RtspError::TransportNotConfigured(session_id.to_string()))
    }
}

/// High-level RTSP server orchestrator.
///
/// Owns the session manager, mount registry, and transport runtime.
/// Delegates TCP connection handling to [`transport::tcp`](crate::transport::tcp)
/// and RTP/RTCP delivery to [`MediaRuntime`].
pub struct Server {
    session_manager: SessionManager,
    mounts: MountRegistry,
    running: Arc<AtomicBool>,
    bind_addr: String,
    config: Arc<ServerConfig>,
    runtime: MediaRuntime,
}

impl Server {
    /// Creates a server with a single default H.264 mount at [`DEFAULT_MOUNT_PATH`].
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(bind_addr, ServerConfig::default())
    }

    /// Create a server with custom protocol/SDP configuration.
    pub fn with_config(bind_addr: &str, config: ServerConfig) -> Self {
        Self::with_packetizer_and_config(
            bind_addr,
            Box::new(H264Packetizer::with_random_ssrc(96)),
            config,
        )
    }

    /// Create a server with a custom packetizer for its default mount (for H.265, AAC, etc).
    pub fn with_packetizer(bind_addr: &str, packetizer: Box<dyn Packetizer>) -> Self {
        Self::with_packetizer_and_config(bind_addr, packetizer, ServerConfig::default())
    }

    /// Create a server with a custom packetizer and protocol/SDP configuration.
    pub fn with_packetizer_and_config(
        bind_addr: &str,
        packetizer: Box<dyn Packetizer>,
        config: ServerConfig,
    ) -> Self {
        let mounts = MountRegistry::new();
        let default_mount = mounts.add(DEFAULT_MOUNT_PATH, packetizer);
        mounts.set_default(default_mount.path());

        Self {
            session_manager: SessionManager::new(),
            mounts,
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            config: Arc::new(config),
            runtime: MediaRuntime::new(),
        }
    }

    /// Registers an additional mount point (e.g. a second camera or an audio
    /// track). Must be called before [`start`](Self::start).
    pub fn add_mount(&self, path: &str, packetizer: Box<dyn Packetizer>) -> Arc<Mount> {
        self.mounts.add(path, packetizer)
    }

    /// Registers a callback invoked with every access unit reassembled from
    /// a RECORDing client's published media (ANNOUNCE + SETUP + RECORD),
    /// regardless of which transport it arrived on.
    pub fn on_recorded_access_unit(&self, callback: impl Fn(&str, AccessUnit) + Send + Sync + 'static) {
        *self.runtime.record_sink.write() = Some(Arc::new(callback));
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let session_manager = self.session_manager.clone();
        let mounts = self.mounts.clone();
        let config = self.config.clone();
        let runtime = self.runtime.clone();

        tracing::info!(addr = %self.bind_addr, "RTSP server listening");

        {
            let running = running.clone();
            let session_manager = session_manager.clone();
            let mounts = mounts.clone();
            let runtime = runtime.clone();
            let interval = config.sender_report_interval;
            thread::spawn(move || sender_report_loop(session_manager, mounts, runtime, interval, running));
        }

        thread::spawn(move || {
            tcp::accept_loop(listener, session_manager, mounts, config, runtime, running);
        });

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Packetizes `data` through `mount_path`'s codec and delivers it to every
    /// session currently Playing that mount, over whichever transport (UDP or
    /// interleaved TCP) each one negotiated during SETUP.
    pub fn publish_frame(&self, mount_path: &str, data: &[u8], timestamp_increment: u32) -> Result<usize> {
        let mount = self
            .mounts
            .get(mount_path)
            .ok_or_else(|| RtspError::MountNotFound(mount_path.to_string()))?;
        let packets = mount.packetize(data, timestamp_increment);

        let mut delivered = 0;
        for session_id in mount.subscribed_session_ids() {
            let Some(session) = self.session_manager.get_session(&session_id) else { continue };
            if !session.is_playing() {
                continue;
            }
            let mut ok = true;
            for packet in &packets {
                if self.runtime.deliver(&session_id, packet, true).is_err() {
                    ok = false;
                }
            }
            if ok {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Sends a raw, already-packetized RTP payload to one specific session.
    pub fn send_rtp_packet(&self, session_id: &str, payload: &[u8]) -> Result<()> {
        self.runtime.deliver(session_id, payload, true)
    }

    /// Sends a raw, already-packetized RTP payload to every Playing session.
    pub fn broadcast_rtp_packet(&self, payload: &[u8]) -> Result<usize> {
        let mut delivered = 0;
        for session in self.session_manager.get_playing_sessions() {
            if self.runtime.deliver(&session.id, payload, true).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    pub fn get_viewers(&self) -> Vec<Viewer> {
        self.session_manager
            .get_playing_sessions()
            .iter()
            .filter_map(|session| {
                session.get_transport().map(|transport| Viewer {
                    session_id: session.id.clone(),
                    uri: session.uri.clone(),
                    transport: transport.header().format(),
                })
            })
            .collect()
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    pub fn mounts(&self) -> &MountRegistry {
        &self.mounts
    }

    /// Returns the server's protocol configuration.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

/// Periodically sends an RTCP Sender Report to every Playing session,
/// reporting the current RTP timestamp and cumulative packet/octet counts
/// for its mount's stream (RFC 3550 §6.4.1). Runs for the server's lifetime.
fn sender_report_loop(
    session_manager: SessionManager,
    mounts: MountRegistry,
    runtime: MediaRuntime,
    interval: Duration,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        thread::sleep(interval);
        if !running.load(Ordering::SeqCst) {
            break;
        }

        for session in session_manager.get_playing_sessions() {
            let Some(mount) = mounts.resolve_from_uri(&session.uri) else { continue };
            let (packet_count, octet_count) = mount.rtp_stats();
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            let sr = SenderReport {
                ssrc: mount.ssrc(),
                ntp_seconds: (now.as_secs() + NTP_UNIX_EPOCH_OFFSET) as u32,
                ntp_fraction: ((now.subsec_nanos() as u64 * (1u64 << 32)) / 1_000_000_000) as u32,
                rtp_timestamp: mount.next_rtp_timestamp(),
                packet_count: packet_count as u32,
                octet_count: octet_count as u32,
                reports: Vec::new(),
            };
            if let Err(e) = runtime.deliver(&session.id, &sr.encode(), false) {
                tracing::trace!(session_id = %session.id, error = %e, "sender report not delivered");
            }
        }
    }
}

/// Information about a connected viewer (client in PLAY state).
#[derive(Debug, Clone)]
pub struct Viewer {
    pub session_id: String,
    pub uri: String,
    pub transport: String,
}
