//! RTSP client (RFC 2326 §4.8, client-driven direction).
//!
//! [`Client`] opens one TCP control connection and drives it through OPTIONS
//! / DESCRIBE (or ANNOUNCE) / SETUP / PLAY (or RECORD) / TEARDOWN, mirroring
//! [`crate::server::Server`]'s thread-per-connection shape but from the other
//! side: a single reader thread demultiplexes inbound RTSP responses,
//! server-initiated requests, and (in interleaved mode) RTP/RTCP frames, while
//! every public method blocks on a CSeq-keyed one-shot channel for its
//! response.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::auth::{DigestChallenge, DigestCredentials};
use crate::error::{Result, RtspError};
use crate::media::aac::AacDepacketizer;
use crate::media::h264::H264Depacketizer;
use crate::media::{AccessUnit, Depacketizer};
use crate::protocol::sdp::SdpSessionDescription;
use crate::protocol::{Method, RtspRequest, RtspResponse, RtspUrl};
use crate::rtcp::{ReceiverReport, ReceiverState, SenderReport};
use crate::session::client::{ClientOp, ClientSessionState};
use crate::session::transport::{Transport, TransportHeader};
use crate::transport::interleaved::{InterleavedFrame, MAGIC};
use crate::transport::udp::UdpPair;

/// How SETUP should negotiate a track's media transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// UDP unicast, with client ports chosen from [`ClientConfig::udp_port_base`].
    Udp,
    /// RTP/RTCP interleaved onto the signaling TCP connection (RFC 2326 §10.12).
    TcpInterleaved,
}

/// Which method is used to keep an idle session alive (RFC 2326 §10.8/§10.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveMethod {
    GetParameter,
    Options,
}

/// One media track discovered via DESCRIBE, or declared for an ANNOUNCE.
#[derive(Debug, Clone)]
pub struct Track {
    pub index: usize,
    pub control_url: String,
    pub media_type: String,
    pub payload_type: u8,
    pub encoding_name: Option<String>,
    pub clock_rate: Option<u32>,
    pub fmtp: Option<String>,
}

impl Track {
    fn from_sdp(index: usize, base: &RtspUrl, media: &crate::protocol::sdp::SdpMedia) -> Self {
        let control_url = match &media.control {
            Some(c) => base.add_control_attribute(c),
            None => base.add_control_attribute(&format!("trackID={index}")),
        };
        Track {
            index,
            control_url,
            media_type: media.media_type.clone(),
            payload_type: media.payload_type,
            encoding_name: media.encoding_name.clone(),
            clock_rate: media.clock_rate,
            fmtp: media.fmtp.clone(),
        }
    }
}

/// Client-side tunables. Analogous to [`crate::server::ServerConfig`] on the
/// other end of the connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for a response to an individual request.
    pub request_timeout: Duration,
    /// Method used for periodic keepalive traffic while Playing/Recording.
    pub keepalive_method: KeepaliveMethod,
    /// First port tried when binding a UDP RTP/RTCP pair (spec §4.4).
    pub udp_port_base: u16,
    /// Width of the range scanned from `udp_port_base` before falling back
    /// to an OS-assigned ephemeral pair.
    pub udp_port_range: u16,
    /// Username/password to answer a Digest challenge with, if the server
    /// issues one (RFC 2617). `None` means a 401 is reported as
    /// [`RtspError::AuthenticationRequired`] instead of retried.
    pub credentials: Option<(String, String)>,
    /// How often an RTCP Receiver Report is sent back for a Playing track.
    pub receiver_report_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            request_timeout: Duration::from_secs(10),
            keepalive_method: KeepaliveMethod::Options,
            udp_port_base: 8000,
            udp_port_range: 1000,
            credentials: None,
            receiver_report_interval: Duration::from_secs(5),
        }
    }
}

/// Per-track receive state, built once SETUP succeeds.
struct TrackRuntime {
    transport: Transport,
    udp: Option<Arc<UdpPair>>,
    depacketizer: Mutex<Box<dyn Depacketizer>>,
    rtcp_state: Mutex<ReceiverState>,
}

type FrameCallback = dyn Fn(usize, &AccessUnit) + Send + Sync;
type RawRtcpCallback = dyn Fn(usize, &[u8]) + Send + Sync;

/// An RTSP client connection (RFC 2326 §4.8).
///
/// Created with [`Client::connect`], then driven through the state machine
/// with [`options`](Self::options), [`describe`](Self::describe),
/// [`announce`](Self::announce), [`setup`](Self::setup), [`play`](Self::play),
/// [`record`](Self::record), [`pause`](Self::pause) and
/// [`teardown`](Self::teardown). All methods block until the corresponding
/// response arrives or [`ClientConfig::request_timeout`] elapses.
pub struct Client {
    url: RtspUrl,
    writer: Arc<Mutex<TcpStream>>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
    cseq: AtomicU64,
    awaiters: Arc<Mutex<HashMap<u64, mpsc::Sender<RtspResponse>>>>,
    state: RwLock<ClientSessionState>,
    session_id: RwLock<Option<String>>,
    session_timeout: RwLock<Duration>,
    digest: Mutex<Option<DigestChallenge>>,
    running: Arc<AtomicBool>,
    terminal: Arc<Mutex<Option<RtspError>>>,
    closed_signal: Arc<(Mutex<bool>, Condvar)>,
    tracks: RwLock<Vec<Track>>,
    runtimes: Arc<RwLock<HashMap<usize, Arc<TrackRuntime>>>>,
    rtp_callback: RwLock<Option<Arc<FrameCallback>>>,
    rtcp_callback: RwLock<Option<Arc<RawRtcpCallback>>>,
    config: ClientConfig,
}

impl Client {
    /// Opens the TCP control connection to `url` (e.g.
    /// `rtsp://camera.local:554/live`) and starts the reader thread. No RTSP
    /// request has been sent yet — the session is in
    /// [`ClientSessionState::Prelude`].
    pub fn connect(url: &str, config: ClientConfig) -> Result<Arc<Self>> {
        let parsed = RtspUrl::parse(url)?;
        let addrs: Vec<SocketAddr> = (parsed.host.as_str(), parsed.port).to_socket_addrs()?.collect();
        let addr = addrs.into_iter().next().ok_or(RtspError::ConnectionClosed)?;
        let stream = TcpStream::connect_timeout(&addr, config.request_timeout)?;
        stream.set_nodelay(true).ok();
        let reader_stream = stream.try_clone()?;

        let client = Arc::new(Client {
            url: parsed,
            writer: Arc::new(Mutex::new(stream)),
            reader_thread: Mutex::new(None),
            cseq: AtomicU64::new(1),
            awaiters: Arc::new(Mutex::new(HashMap::new())),
            state: RwLock::new(ClientSessionState::Initial),
            session_id: RwLock::new(None),
            session_timeout: RwLock::new(Duration::from_secs(60)),
            digest: Mutex::new(None),
            running: Arc::new(AtomicBool::new(true)),
            terminal: Arc::new(Mutex::new(None)),
            closed_signal: Arc::new((Mutex::new(false), Condvar::new())),
            tracks: RwLock::new(Vec::new()),
            runtimes: Arc::new(RwLock::new(HashMap::new())),
            rtp_callback: RwLock::new(None),
            rtcp_callback: RwLock::new(None),
            config,
        });
        client.advance(ClientOp::Start)?;

        let handle = {
            let client = client.clone();
            thread::spawn(move || client.run_reader(reader_stream))
        };
        *client.reader_thread.lock() = Some(handle);
        client.start_keepalive_loop();

        tracing::info!(host = %client.url.host, port = client.url.port, "RTSP client connected");
        Ok(client)
    }

    /// Periodically sends GET_PARAMETER or OPTIONS (per
    /// [`ClientConfig::keepalive_method`]) so the server's session timeout
    /// never elapses (RFC 2326 §12.37) while a session is open.
    fn start_keepalive_loop(self: &Arc<Self>) {
        let client = self.clone();
        thread::spawn(move || {
            let mut consecutive_misses = 0u32;
            while client.running.load(Ordering::SeqCst) {
                thread::sleep(*client.session_timeout.read() / 2);
                if !client.running.load(Ordering::SeqCst) || client.state() == ClientSessionState::Closed {
                    break;
                }
                if client.session_id.read().is_none() {
                    continue;
                }
                let method = match client.config.keepalive_method {
                    KeepaliveMethod::GetParameter => Method::GetParameter,
                    KeepaliveMethod::Options => Method::Options,
                };
                let req = client.build_request(method, &client.url_string());
                if client.send_request(req).is_err() {
                    consecutive_misses += 1;
                    tracing::warn!(consecutive_misses, "keepalive request failed");
                    if consecutive_misses >= 2 {
                        client.fail(RtspError::KeepaliveTimeout);
                        break;
                    }
                    continue;
                }
                consecutive_misses = 0;
            }
        });
    }

    /// Installs a callback invoked with every reassembled access unit for
    /// `track_index` while Playing.
    pub fn on_access_unit(&self, callback: impl Fn(usize, &AccessUnit) + Send + Sync + 'static) {
        *self.rtp_callback.write() = Some(Arc::new(callback));
    }

    /// Installs a callback invoked with every raw inbound RTCP packet.
    pub fn on_rtcp(&self, callback: impl Fn(usize, &[u8]) + Send + Sync + 'static) {
        *self.rtcp_callback.write() = Some(Arc::new(callback));
    }

    /// Current client-side session state.
    pub fn state(&self) -> ClientSessionState {
        *self.state.read()
    }

    /// Tracks discovered by [`describe`](Self::describe) or declared by the
    /// caller before [`announce`](Self::announce).
    pub fn tracks(&self) -> Vec<Track> {
        self.tracks.read().clone()
    }

    /// OPTIONS (RFC 2326 §10.1): queries which methods the server supports.
    /// Legal at any point before the connection closes.
    pub fn options(&self) -> Result<Vec<String>> {
        self.advance(ClientOp::Options)?;
        let req = self.build_request(Method::Options, &self.url_string());
        let resp = self.send_request(req)?;
        Ok(resp.get_header("Public").map(|v| v.split(',').map(|s| s.trim().to_string()).collect()).unwrap_or_default())
    }

    /// DESCRIBE (RFC 2326 §10.2): fetches the SDP description and populates
    /// [`tracks`](Self::tracks) for subsequent SETUP calls.
    pub fn describe(&self) -> Result<SdpSessionDescription> {
        self.advance(ClientOp::Describe)?;
        let mut req = self.build_request(Method::Describe, &self.url_string());
        req.headers.insert("Accept", "application/sdp");
        let resp = self.send_request(req)?;
        let body = resp.body.as_deref().unwrap_or_default();
        let sdp = SdpSessionDescription::parse(std::str::from_utf8(body).map_err(|_| RtspError::Parse {
            kind: crate::error::ParseErrorKind::InvalidEncoding,
        })?)?;

        let tracks: Vec<Track> = sdp.media.iter().enumerate().map(|(i, m)| Track::from_sdp(i, &self.url, m)).collect();
        *self.tracks.write() = tracks;
        self.commit(ClientSessionState::Described);
        Ok(sdp)
    }

    /// ANNOUNCE (RFC 2326 §10.3): publishes an SDP description, picking the
    /// write (publish) direction. `sdp_body` must already be a complete SDP
    /// document (see [`crate::protocol::sdp::generate_announce_sdp`]).
    pub fn announce(&self, sdp_body: &str, tracks: Vec<Track>) -> Result<()> {
        self.advance(ClientOp::Announce)?;
        let mut req = self.build_request(Method::Announce, &self.url_string());
        req.headers.set("Content-Type", "application/sdp");
        let req = req.with_body(sdp_body.as_bytes().to_vec());
        self.send_request(req)?;
        *self.tracks.write() = tracks;
        self.commit(ClientSessionState::PreSetup);
        Ok(())
    }

    /// SETUP (RFC 2326 §10.4) for one track: negotiates transport, binding a
    /// UDP pair or reserving an interleaved channel pair as requested. Falls
    /// back from UDP to interleaved automatically on a 461 response.
    pub fn setup(&self, track_index: usize, mode: TransportMode) -> Result<()> {
        let track = self
            .tracks
            .read()
            .iter()
            .find(|t| t.index == track_index)
            .cloned()
            .ok_or_else(|| RtspError::Codec(format!("no track with index {track_index}")))?;

        match mode {
            TransportMode::Udp => match self.setup_udp(&track) {
                Ok(()) => Ok(()),
                Err(RtspError::RequestFailed { status: 461, .. }) => {
                    tracing::warn!(track_index, "server rejected UDP transport, retrying interleaved");
                    self.setup_interleaved(&track)
                }
                Err(e) => Err(e),
            },
            TransportMode::TcpInterleaved => self.setup_interleaved(&track),
        }
    }

    fn setup_udp(&self, track: &Track) -> Result<()> {
        self.advance(ClientOp::Setup)?;
        let udp = Arc::new(UdpPair::bind_in_range(self.config.udp_port_base, self.config.udp_port_range)?);
        let (client_rtp, client_rtcp) = udp.local_ports()?;
        let header = TransportHeader::Udp { unicast: true, client_port: Some((client_rtp, client_rtcp)), server_port: None };

        let mut req = self.build_request(Method::Setup, &track.control_url);
        req.headers.insert("Transport", header.format());
        let resp = self.send_request(req)?;

        self.adopt_session_header(&resp)?;
        let server_port = resp
            .get_header("Transport")
            .and_then(TransportHeader::parse)
            .and_then(|h| match h {
                TransportHeader::Udp { server_port, .. } => server_port,
                TransportHeader::Interleaved { .. } => None,
            })
            .ok_or(RtspError::UnsupportedTransport)?;

        let peer_ip =
            (self.url.host.as_str(), self.url.port).to_socket_addrs()?.next().ok_or(RtspError::ConnectionClosed)?.ip();
        udp.connect_peer(peer_ip, server_port.0, server_port.1)?;
        udp.set_read_timeout(Some(Duration::from_millis(500)))?;

        let transport = Transport::Udp {
            client_addr: SocketAddr::new(peer_ip, client_rtp),
            client_rtp_port: client_rtp,
            client_rtcp_port: client_rtcp,
            server_rtp_port: server_port.0,
            server_rtcp_port: server_port.1,
        };
        self.install_track_runtime(track, transport, Some(udp.clone()));
        self.spawn_udp_reader(track.index, udp);
        self.commit(ClientSessionState::Ready);
        Ok(())
    }

    fn setup_interleaved(&self, track: &Track) -> Result<()> {
        self.advance(ClientOp::Setup)?;
        let rtp_channel = (track.index * 2) as u8;
        let header = TransportHeader::Interleaved { channels: (rtp_channel, rtp_channel + 1) };

        let mut req = self.build_request(Method::Setup, &track.control_url);
        req.headers.insert("Transport", header.format());
        let resp = self.send_request(req)?;
        self.adopt_session_header(&resp)?;

        let channels = resp
            .get_header("Transport")
            .and_then(TransportHeader::parse)
            .and_then(|h| match h {
                TransportHeader::Interleaved { channels } => Some(channels),
                TransportHeader::Udp { .. } => None,
            })
            .unwrap_or((rtp_channel, rtp_channel + 1));

        let transport = Transport::Interleaved { rtp_channel: channels.0, rtcp_channel: channels.1 };
        self.install_track_runtime(track, transport, None);
        self.commit(ClientSessionState::Ready);
        Ok(())
    }

    fn install_track_runtime(&self, track: &Track, transport: Transport, udp: Option<Arc<UdpPair>>) {
        let depacketizer: Box<dyn Depacketizer> = match track.encoding_name.as_deref() {
            Some(name) if name.eq_ignore_ascii_case("MPEG4-GENERIC") => Box::new(AacDepacketizer::new()),
            _ => Box::new(H264Depacketizer::new()),
        };
        let runtime = Arc::new(TrackRuntime {
            transport,
            udp,
            depacketizer: Mutex::new(depacketizer),
            rtcp_state: Mutex::new(ReceiverState::new(rand::random(), track.clock_rate.unwrap_or(90000))),
        });
        self.runtimes.write().insert(track.index, runtime);
    }

    fn spawn_udp_reader(&self, track_index: usize, udp: Arc<UdpPair>) {
        let running = self.running.clone();
        let runtimes = self.runtimes.clone();
        let rtp_cb = self.rtp_callback.read().clone();
        thread::spawn(move || {
            let mut buf = vec![0u8; 65536];
            while running.load(Ordering::SeqCst) {
                match udp.recv_rtp(&mut buf) {
                    Ok((n, _)) => dispatch_rtp(&runtimes, track_index, &buf[..n], rtp_cb.as_deref()),
                    Err(_) => continue,
                }
            }
        });
        let running = self.running.clone();
        let runtimes = self.runtimes.clone();
        let rtcp_cb = self.rtcp_callback.read().clone();
        thread::spawn(move || {
            let mut buf = vec![0u8; 65536];
            while running.load(Ordering::SeqCst) {
                match udp.recv_rtcp(&mut buf) {
                    Ok((n, _)) => dispatch_rtcp(&runtimes, track_index, &buf[..n], rtcp_cb.as_deref()),
                    Err(_) => continue,
                }
            }
        });
    }

    /// PLAY (RFC 2326 §10.5): starts (or resumes) server -> client delivery.
    pub fn play(&self, range: Option<crate::protocol::Range>) -> Result<()> {
        self.advance(ClientOp::Play)?;
        let mut req = self.build_request(Method::Play, &self.url_string());
        if let Some(r) = range {
            req.headers.insert("Range", r.format());
        }
        self.send_request(req)?;
        self.commit(ClientSessionState::Playing);
        self.start_receiver_report_loop();
        Ok(())
    }

    /// RECORD (RFC 2326 §10.11): starts client -> server delivery after an
    /// ANNOUNCE + SETUP sequence.
    pub fn record(&self) -> Result<()> {
        self.advance(ClientOp::Record)?;
        let req = self.build_request(Method::Record, &self.url_string());
        self.send_request(req)?;
        self.commit(ClientSessionState::Recording);
        Ok(())
    }

    /// Sends one RTP packet for `track_index` while Recording, over whatever
    /// transport was negotiated at SETUP.
    pub fn send_rtp(&self, track_index: usize, packet: &[u8]) -> Result<()> {
        let runtimes = self.runtimes.read();
        let runtime = runtimes.get(&track_index).ok_or(RtspError::TransportNotConfigured(format!("track {track_index}")))?;
        match &runtime.transport {
            Transport::Udp { .. } => {
                runtime.udp.as_ref().ok_or(RtspError::TransportNotConfigured("no udp pair".into()))?.send_rtp(packet)?;
            }
            Transport::Interleaved { rtp_channel, .. } => {
                let frame = InterleavedFrame::new(*rtp_channel, packet.to_vec());
                self.writer.lock().write_all(&frame.encode())?;
            }
        }
        Ok(())
    }

    /// PAUSE (RFC 2326 §10.6): suspends delivery without tearing down state.
    pub fn pause(&self) -> Result<()> {
        self.advance(ClientOp::Pause)?;
        let req = self.build_request(Method::Pause, &self.url_string());
        self.send_request(req)?;
        self.commit(ClientSessionState::Paused);
        Ok(())
    }

    /// TEARDOWN (RFC 2326 §10.7): frees session state on the server and
    /// marks this client closed. Safe to call from any state.
    pub fn teardown(&self) -> Result<()> {
        let next = self.advance(ClientOp::Teardown)?;
        let req = self.build_request(Method::Teardown, &self.url_string());
        let result = self.send_request(req);
        self.commit(next);
        self.shutdown();
        result.map(|_| ())
    }

    /// Blocks until the session closes (TEARDOWN, a terminal error, or the
    /// peer dropping the connection).
    pub fn wait(&self) -> Result<()> {
        let (lock, cvar) = &*self.closed_signal;
        let mut closed = lock.lock();
        while !*closed {
            cvar.wait(&mut closed);
        }
        match self.terminal.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn start_receiver_report_loop(&self) {
        let interval = self.config.receiver_report_interval;
        let running = self.running.clone();
        let runtimes = self.runtimes.clone();
        let writer = self.writer.clone();
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(interval);
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                for (&index, runtime) in runtimes.read().iter() {
                    let block = runtime.rtcp_state.lock().build_report_block();
                    let rr = ReceiverReport { ssrc: block.ssrc, reports: vec![block] };
                    let payload = rr.encode();
                    match &runtime.transport {
                        Transport::Udp { .. } => {
                            if let Some(udp) = &runtime.udp {
                                let _ = udp.send_rtcp(&payload);
                            }
                        }
                        Transport::Interleaved { rtcp_channel, .. } => {
                            let frame = InterleavedFrame::new(*rtcp_channel, payload);
                            let _ = writer.lock().write_all(&frame.encode());
                        }
                    }
                    tracing::trace!(track_index = index, "sent RTCP receiver report");
                }
            }
        });
    }

    fn advance(&self, op: ClientOp) -> Result<ClientSessionState> {
        self.state.read().check(op)
    }

    fn commit(&self, state: ClientSessionState) {
        tracing::debug!(?state, "client state transition");
        *self.state.write() = state;
        if state == ClientSessionState::Closed {
            let (lock, cvar) = &*self.closed_signal;
            *lock.lock() = true;
            cvar.notify_all();
        }
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader_thread.lock().take() {
            let _ = self.writer.lock().shutdown(std::net::Shutdown::Both);
            let _ = handle.join();
        }
    }

    fn url_string(&self) -> String {
        format!("{}://{}:{}{}", if self.url.secure { "rtsps" } else { "rtsp" }, self.url.host, self.url.port, self.url.path)
    }

    fn build_request(&self, method: Method, uri: &str) -> RtspRequest {
        let mut req = RtspRequest::new(method, uri);
        req.headers.insert("CSeq", self.cseq.fetch_add(1, Ordering::SeqCst).to_string());
        req.headers.insert("User-Agent", crate::protocol::response::SERVER_AGENT);
        if let Some(id) = self.session_id.read().clone() {
            req.headers.insert("Session", id);
        }
        req
    }

    fn adopt_session_header(&self, resp: &RtspResponse) -> Result<()> {
        if let Some(value) = resp.get_header("Session") {
            let (id, timeout) = match value.split_once(';') {
                Some((id, rest)) => {
                    let timeout = rest.strip_prefix("timeout=").and_then(|s| s.parse().ok());
                    (id.to_string(), timeout)
                }
                None => (value.to_string(), None),
            };
            *self.session_id.write() = Some(id);
            if let Some(secs) = timeout {
                *self.session_timeout.write() = Duration::from_secs(secs);
            }
        }
        Ok(())
    }

    /// Sends `req`, waits for its matching response, and retries once with
    /// Digest credentials on a 401 (RFC 2617 §3.2.1). Non-2xx (after any
    /// retry) becomes [`RtspError::RequestFailed`].
    fn send_request(&self, mut req: RtspRequest) -> Result<RtspResponse> {
        if let Some(err) = self.terminal.lock().as_ref() {
            return Err(clone_error(err));
        }

        if let Some(challenge) = self.digest.lock().clone() {
            if let Some((user, pass)) = &self.config.credentials {
                let header = DigestCredentials::generate_header(&challenge, user, pass, req.method.as_str(), &req.uri);
                req.headers.set("Authorization", header);
            }
        }

        let resp = self.dispatch(req.clone())?;
        if resp.status_code != 401 {
            return Self::finish(resp);
        }

        let challenge = resp
            .get_header("WWW-Authenticate")
            .map(DigestChallenge::parse)
            .transpose()?
            .ok_or(RtspError::AuthenticationFailed)?;
        let (user, pass) = self.config.credentials.as_ref().ok_or(RtspError::AuthenticationRequired)?;
        *self.digest.lock() = Some(challenge.clone());

        let header = DigestCredentials::generate_header(&challenge, user, pass, req.method.as_str(), &req.uri);
        let mut retry = req;
        retry.headers.set("CSeq", self.cseq.fetch_add(1, Ordering::SeqCst).to_string());
        retry.headers.set("Authorization", header);
        let resp = self.dispatch(retry)?;
        if resp.status_code == 401 {
            return Err(RtspError::AuthenticationFailed);
        }
        Self::finish(resp)
    }

    fn finish(resp: RtspResponse) -> Result<RtspResponse> {
        if resp.is_success() {
            Ok(resp)
        } else {
            Err(RtspError::RequestFailed { status: resp.status_code, reason: resp.status_text.clone() })
        }
    }

    fn dispatch(&self, req: RtspRequest) -> Result<RtspResponse> {
        let cseq: u64 = req.cseq().ok_or_else(|| RtspError::Codec("request missing CSeq".into()))?.parse().map_err(|_| {
            RtspError::Parse { kind: crate::error::ParseErrorKind::InvalidHeaderValue("CSeq") }
        })?;
        let (tx, rx) = mpsc::channel();
        self.awaiters.lock().insert(cseq, tx);

        {
            let mut writer = self.writer.lock();
            writer.write_all(&req.serialize())?;
        }

        let resp = rx.recv_timeout(self.config.request_timeout).map_err(|_| {
            self.awaiters.lock().remove(&cseq);
            RtspError::Timeout
        })?;
        Ok(resp)
    }

    fn run_reader(self: Arc<Self>, stream: TcpStream) {
        let mut reader = BufReader::new(stream);
        while self.running.load(Ordering::SeqCst) {
            let mut first = [0u8; 1];
            match reader.read_exact(&mut first) {
                Ok(()) => {}
                Err(_) => break,
            }

            if first[0] == MAGIC {
                match InterleavedFrame::read_after_magic(&mut reader) {
                    Ok(frame) => self.handle_interleaved_frame(frame),
                    Err(_) => break,
                }
            } else {
                match self.read_text_message(&mut reader, first[0]) {
                    Ok(Some(raw)) => self.handle_text_message(&raw),
                    Ok(None) => continue,
                    Err(_) => break,
                }
            }
        }
        self.fail(RtspError::ConnectionClosed);
    }

    fn read_text_message(&self, reader: &mut BufReader<TcpStream>, first_byte: u8) -> std::io::Result<Option<Vec<u8>>> {
        let mut head = vec![first_byte];
        loop {
            let mut line = Vec::new();
            let n = read_line(reader, &mut line)?;
            if n == 0 {
                return Ok(None);
            }
            head.extend_from_slice(&line);
            if line == b"\r\n" || line == b"\n" {
                break;
            }
        }
        let headers_text = String::from_utf8_lossy(&head).to_string();
        let content_length = headers_text
            .lines()
            .find_map(|l| l.split_once(':').filter(|(k, _)| k.trim().eq_ignore_ascii_case("content-length")))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let mut body = vec![0u8; content_length];
        if content_length > 0 {
            reader.read_exact(&mut body)?;
        }
        head.extend_from_slice(&body);
        Ok(Some(head))
    }

    fn handle_text_message(&self, raw: &[u8]) {
        if raw.starts_with(b"RTSP/") {
            if let Ok(resp) = RtspResponse::parse(raw) {
                if let Some(cseq) = resp.cseq().and_then(|c| c.parse::<u64>().ok()) {
                    if let Some(tx) = self.awaiters.lock().remove(&cseq) {
                        let _ = tx.send(resp);
                        return;
                    }
                }
                tracing::warn!("dropped RTSP response with no matching request");
            }
        } else if let Ok(req) = RtspRequest::parse(raw) {
            self.handle_server_initiated_request(req);
        }
    }

    /// The server side can itself issue TEARDOWN (or GET_PARAMETER as a
    /// keepalive probe); this client acknowledges both minimally.
    fn handle_server_initiated_request(&self, req: RtspRequest) {
        tracing::debug!(method = %req.method, "server-initiated request");
        let resp = match req.method {
            Method::Teardown => {
                self.commit(ClientSessionState::Closed);
                RtspResponse::ok()
            }
            Method::GetParameter | Method::Options => RtspResponse::ok(),
            _ => RtspResponse::not_implemented(),
        };
        let resp = match req.cseq() {
            Some(cseq) => resp.add_header("CSeq", cseq),
            None => resp,
        };
        let _ = self.writer.lock().write_all(&resp.serialize());
    }

    fn handle_interleaved_frame(&self, frame: InterleavedFrame) {
        let rtp_cb = self.rtp_callback.read().clone();
        let rtcp_cb = self.rtcp_callback.read().clone();
        let runtimes = self.runtimes.read();
        for (&index, runtime) in runtimes.iter() {
            if let Transport::Interleaved { rtp_channel, rtcp_channel } = runtime.transport {
                if frame.channel == rtp_channel {
                    drop(runtimes);
                    dispatch_rtp(&self.runtimes, index, &frame.payload, rtp_cb.as_deref());
                    return;
                }
                if frame.channel == rtcp_channel {
                    drop(runtimes);
                    dispatch_rtcp(&self.runtimes, index, &frame.payload, rtcp_cb.as_deref());
                    return;
                }
            }
        }
    }

    fn fail(&self, err: RtspError) {
        let mut terminal = self.terminal.lock();
        if terminal.is_none() {
            *terminal = Some(err);
        }
        drop(terminal);
        self.commit(ClientSessionState::Closed);
    }
}

fn dispatch_rtp(runtimes: &Arc<RwLock<HashMap<usize, Arc<TrackRuntime>>>>, track_index: usize, datagram: &[u8], cb: Option<&FrameCallback>) {
    let Some(header) = crate::media::rtp::parse_header(datagram) else { return };
    let Some(runtime) = runtimes.read().get(&track_index).cloned() else { return };
    runtime.rtcp_state.lock().on_rtp(header.sequence, header.timestamp);
    let payload = &datagram[header.payload_offset..];
    let aus = match runtime.depacketizer.lock().push(payload, header.timestamp, header.marker) {
        Ok(aus) => aus,
        Err(e) => {
            tracing::warn!(track_index, error = %e, "depacketization failed, dropping packet");
            return;
        }
    };
    if let Some(cb) = cb {
        for au in &aus {
            cb(track_index, au);
        }
    }
}

fn dispatch_rtcp(runtimes: &Arc<RwLock<HashMap<usize, Arc<TrackRuntime>>>>, track_index: usize, datagram: &[u8], cb: Option<&RawRtcpCallback>) {
    if let Some(cb) = cb {
        cb(track_index, datagram);
    }
    if let Ok(sr) = SenderReport::parse(datagram) {
        if let Some(runtime) = runtimes.read().get(&track_index) {
            runtime.rtcp_state.lock().on_sender_report(&sr);
        }
    }
}

fn read_line(reader: &mut BufReader<TcpStream>, out: &mut Vec<u8>) -> std::io::Result<usize> {
    reader.read_until(b'\n', out)
}

fn clone_error(err: &RtspError) -> RtspError {
    match err {
        RtspError::ConnectionClosed => RtspError::ConnectionClosed,
        RtspError::Timeout => RtspError::Timeout,
        RtspError::AuthenticationFailed => RtspError::AuthenticationFailed,
        other => RtspError::Codec(other.to_string()),
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_control_url_resolves_relative_attribute() {
        let base = RtspUrl::parse("rtsp://host:554/stream").unwrap();
        let media = crate::protocol::sdp::SdpMedia {
            media_type: "video".into(),
            payload_type: 96,
            control: Some("trackID=0".into()),
            encoding_name: Some("H264".into()),
            clock_rate: Some(90000),
            fmtp: None,
        };
        let track = Track::from_sdp(0, &base, &media);
        assert_eq!(track.control_url, "rtsp://host:554/stream/trackID=0");
    }

    #[test]
    fn track_falls_back_to_index_when_sdp_omits_control() {
        let base = RtspUrl::parse("rtsp://host:554/stream").unwrap();
        let media = crate::protocol::sdp::SdpMedia {
            media_type: "audio".into(),
            payload_type: 97,
            control: None,
            encoding_name: Some("MPEG4-GENERIC".into()),
            clock_rate: Some(48000),
            fmtp: None,
        };
        let track = Track::from_sdp(1, &base, &media);
        assert_eq!(track.control_url, "rtsp://host:554/stream/trackID=1");
    }

    #[test]
    fn default_config_prefers_options_keepalive_and_8000_port_base() {
        let config = ClientConfig::default();
        assert_eq!(config.keepalive_method, KeepaliveMethod::Options);
        assert_eq!(config.udp_port_base, 8000);
    }
}
