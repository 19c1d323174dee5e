use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::auth::{DigestChallenge, DigestCredentials};
use crate::media::aac::AacDepacketizer;
use crate::media::h264::H264Depacketizer;
use crate::media::{rtp, Depacketizer};
use crate::mount::MountRegistry;
use crate::protocol::method::Method;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::{self, SdpSessionDescription};
use crate::rtcp::ReceiverReport;
use crate::server::{InterleavedSink, MediaRuntime, ServerConfig};
use crate::session::transport::TransportHeader;
use crate::session::{SessionManager, SessionState, Transport};
use crate::transport::InterleavedFrame;
use crate::transport::udp::UdpPair;

/// Handles RTSP method requests for a single TCP connection.
///
/// Tracks which sessions were created on this connection (for cleanup on
/// disconnect) and which interleaved channel ids this connection has
/// negotiated, so inbound `$`-framed RTP/RTCP can be routed back to the
/// right session without a connection-wide lookup.
pub struct MethodHandler {
    session_manager: SessionManager,
    mounts: MountRegistry,
    client_addr: SocketAddr,
    config: Arc<ServerConfig>,
    runtime: MediaRuntime,
    writer: Arc<Mutex<TcpStream>>,
    /// Session IDs created during this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
    /// Interleaved RTP channel id -> session id, for this connection only.
    interleaved_rtp_channels: HashMap<u8, String>,
    /// Interleaved RTCP channel id -> session id, for this connection only.
    interleaved_rtcp_channels: HashMap<u8, String>,
    /// The most recent Digest challenge this connection issued, checked
    /// against the nonce on a following `Authorization` header.
    digest_challenge: Option<DigestChallenge>,
}

impl MethodHandler {
    pub fn new(
        session_manager: SessionManager,
        client_addr: SocketAddr,
        mounts: MountRegistry,
        config: Arc<ServerConfig>,
        runtime: MediaRuntime,
        writer: Arc<Mutex<TcpStream>>,
    ) -> Self {
        MethodHandler {
            session_manager,
            mounts,
            client_addr,
            config,
            runtime,
            writer,
            session_ids: Vec::new(),
            interleaved_rtp_channels: HashMap::new(),
            interleaved_rtcp_channels: HashMap::new(),
            digest_challenge: None,
        }
    }

    /// Returns session IDs owned by this connection (for cleanup on disconnect).
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    /// The shared media transport state this connection's sessions are
    /// registered into, so the caller can drop them on disconnect.
    pub fn runtime(&self) -> &MediaRuntime {
        &self.runtime
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        if request.method != Method::Options
            && let Some(challenge) = self.check_auth(cseq, request)
        {
            return challenge;
        }

        match request.method {
            Method::Options => self.handle_options(cseq),
            Method::Describe => self.handle_describe(cseq, &request.uri),
            Method::Announce => self.handle_announce(cseq, request),
            Method::Setup => self.handle_setup(cseq, request),
            Method::Play => self.handle_play(cseq, request),
            Method::Record => self.handle_record(cseq, request),
            Method::Pause => self.handle_pause(cseq, request),
            Method::Teardown => self.handle_teardown(cseq, request),
            Method::GetParameter => self.handle_get_parameter(cseq, request),
            Method::SetParameter => self.handle_set_parameter(cseq, request),
        }
    }

    /// Handles interleaved `$`-framed RTP/RTCP arriving on this same TCP
    /// connection (RFC 2326 §10.12): RTP channels feed a RECORDing
    /// session's depacketizer, RTCP channels record a receiver report.
    pub fn handle_interleaved_frame(&mut self, frame: InterleavedFrame) {
        if let Some(session_id) = self.interleaved_rtp_channels.get(&frame.channel).cloned() {
            let Some(session) = self.session_manager.get_session(&session_id) else { return };
            let Some(header) = rtp::parse_header(&frame.payload) else {
                tracing::trace!(session_id, channel = frame.channel, "dropping malformed interleaved RTP frame");
                return;
            };
            self.deliver_record_payload(&session_id, &session, &frame.payload[header.payload_offset..], header.timestamp, header.marker);
            return;
        }

        if let Some(session_id) = self.interleaved_rtcp_channels.get(&frame.channel).cloned()
            && let Some(session) = self.session_manager.get_session(&session_id)
            && let Ok(report) = ReceiverReport::parse(&frame.payload)
        {
            session.record_receiver_report(report);
        }
    }

    fn deliver_record_payload(
        &self,
        session_id: &str,
        session: &crate::session::Session,
        payload: &[u8],
        timestamp: u32,
        marker: bool,
    ) {
        match session.depacketize_record(payload, timestamp, marker) {
            Ok(access_units) => {
                if access_units.is_empty() {
                    return;
                }
                let Some(callback) = self.runtime.record_sink.read().clone() else { return };
                for access_unit in access_units {
                    callback(session_id, access_unit);
                }
            }
            Err(e) => tracing::warn!(session_id, error = %e, "failed to depacketize recorded media"),
        }
    }

    /// Verifies Digest credentials (RFC 2617, via RFC 2326 §18) when the
    /// server is configured with `ServerConfig::credentials`. Returns a
    /// `401 Unauthorized` challenge when credentials are missing or wrong,
    /// `None` when the request may proceed (including when no credentials
    /// are configured at all).
    fn check_auth(&mut self, cseq: &str, request: &RtspRequest) -> Option<RtspResponse> {
        let (username, password) = self.config.credentials.as_ref()?;

        let valid = request.get_header("Authorization").and_then(|header| DigestCredentials::parse(header).ok()).is_some_and(|creds| {
            creds.username == *username
                && self.digest_challenge.as_ref().is_some_and(|c| c.nonce == creds.nonce)
                && creds.verify(password, request.method.as_str())
        });

        if valid {
            return None;
        }

        tracing::debug!(%cseq, method = %request.method, "challenging for Digest credentials");
        let challenge = DigestChallenge::new(self.config.realm.clone());
        let header_value = challenge.header_value();
        self.digest_challenge = Some(challenge);
        Some(RtspResponse::unauthorized().add_header("CSeq", cseq).add_header("WWW-Authenticate", &header_value))
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok().add_header("CSeq", cseq).add_header(
            "Public",
            "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER",
        )
    }

    /// Parses host from an RTSP URI (e.g. rtsp://host:8554/path -> host). Falls back to client IP if invalid.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.client_addr.ip().to_string()
    }

    fn handle_describe(&self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        let mount = match self.mounts.resolve_from_uri(uri) {
            Some(m) => m,
            None => {
                tracing::warn!(uri, "DESCRIBE for unknown mount");
                return RtspResponse::not_found().add_header("CSeq", cseq);
            }
        };

        let host = self.host_from_uri_or_client(uri);
        let sdp = sdp::generate_sdp(
            &mount,
            &host,
            &self.config.sdp_session_id,
            &self.config.sdp_session_version,
            &self.config.sdp_username,
            &self.config.sdp_session_name,
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", uri)
            .with_body(sdp)
    }

    /// ANNOUNCE (RFC 2326 §10.3): the client describes the media it is about
    /// to publish. Remembered on the mount so a following SETUP can tell
    /// this is a RECORD-direction track and build the right depacketizer.
    fn handle_announce(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let mount = match self.mounts.resolve_from_uri(&request.uri) {
            Some(m) => m,
            None => {
                tracing::warn!(uri = %request.uri, "ANNOUNCE for unknown mount");
                return RtspResponse::not_found().add_header("CSeq", cseq);
            }
        };

        let Some(body) = request.body.as_deref() else {
            tracing::warn!(%cseq, "ANNOUNCE missing SDP body");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };
        let Ok(body) = std::str::from_utf8(body) else {
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };
        let description = match SdpSessionDescription::parse(body) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(%cseq, error = %e, "ANNOUNCE SDP did not parse");
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            }
        };

        tracing::info!(mount = %mount.path(), media = description.media.len(), "mount announced for recording");
        mount.set_announced(description);

        RtspResponse::ok().add_header("CSeq", cseq)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let mount = match self.mounts.resolve_from_uri(&request.uri) {
            Some(m) => m,
            None => {
                tracing::warn!(uri = %request.uri, "SETUP for unknown mount");
                return RtspResponse::not_found().add_header("CSeq", cseq);
            }
        };

        let transport_header = match request.get_header("Transport") {
            Some(t) => t,
            None => {
                tracing::warn!(%cseq, "SETUP missing Transport header");
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            }
        };

        let client_transport = match TransportHeader::parse(transport_header) {
            Some(t) => t,
            None => {
                tracing::warn!(%cseq, transport_header, "SETUP invalid Transport header");
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            }
        };

        let record_media = mount.resolve_announced_media(&request.uri);

        let session = self.session_manager.create_session(&request.uri);
        let session_id = session.id.clone();

        if let Some(media) = &record_media {
            let depacketizer: Box<dyn Depacketizer> = match media.encoding_name.as_deref() {
                Some(name) if name.eq_ignore_ascii_case("MPEG4-GENERIC") => Box::new(AacDepacketizer::new()),
                _ => Box::new(H264Depacketizer::new()),
            };
            session.set_record_depacketizer(depacketizer);
        }

        let transport_response = match client_transport {
            TransportHeader::Interleaved { channels } => {
                let sink = InterleavedSink { writer: self.writer.clone(), rtp_channel: channels.0, rtcp_channel: channels.1 };
                self.runtime.interleaved_sinks.write().insert(session_id.clone(), sink);
                self.interleaved_rtp_channels.insert(channels.0, session_id.clone());
                self.interleaved_rtcp_channels.insert(channels.1, session_id.clone());
                session.set_transport(Transport::Interleaved { rtp_channel: channels.0, rtcp_channel: channels.1 });
                TransportHeader::Interleaved { channels }.format()
            }
            TransportHeader::Udp { client_port: Some((client_rtp_port, client_rtcp_port)), .. } => {
                let (server_rtp_port, server_rtcp_port) = match self.session_manager.allocate_server_ports() {
                    Ok(ports) => ports,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to allocate server ports");
                        return RtspResponse::new(500, "Internal Server Error").add_header("CSeq", cseq);
                    }
                };

                let pair = match UdpPair::bind(server_rtp_port, server_rtcp_port) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to bind UDP transport");
                        return RtspResponse::new(500, "Internal Server Error").add_header("CSeq", cseq);
                    }
                };
                let client_ip = self.client_addr.ip();
                if let Err(e) = pair.connect_peer(client_ip, client_rtp_port, client_rtcp_port) {
                    tracing::error!(error = %e, "failed to connect UDP transport to client");
                    return RtspResponse::new(500, "Internal Server Error").add_header("CSeq", cseq);
                }
                let client_rtp_addr = SocketAddr::new(client_ip, client_rtp_port);
                let pair = Arc::new(pair);
                self.runtime.udp_pairs.write().insert(session_id.clone(), pair.clone());
                session.set_transport(Transport::Udp {
                    client_addr: client_rtp_addr,
                    client_rtp_port,
                    client_rtcp_port,
                    server_rtp_port,
                    server_rtcp_port,
                });

                if record_media.is_some() {
                    spawn_udp_record_reader(pair, self.session_manager.clone(), session_id.clone(), self.runtime.clone());
                }

                TransportHeader::Udp {
                    unicast: true,
                    client_port: Some((client_rtp_port, client_rtcp_port)),
                    server_port: Some((server_rtp_port, server_rtcp_port)),
                }
                .format()
            }
            TransportHeader::Udp { client_port: None, .. } => {
                tracing::warn!(%cseq, "SETUP UDP transport missing client_port");
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            }
        };

        mount.subscribe(&session_id);
        self.session_ids.push(session_id.clone());

        tracing::info!(
            session_id,
            mount = %mount.path(),
            uri = %request.uri,
            recording = record_media.is_some(),
            "session created via SETUP"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport_response)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session_id = match self.extract_session_id(request) {
            Some(id) => id,
            None => {
                tracing::warn!(%cseq, "PLAY missing Session header");
                return RtspResponse::session_not_found().add_header("CSeq", cseq);
            }
        };

        let Some(session) = self.session_manager.get_session(&session_id) else {
            tracing::warn!(session_id, "PLAY for unknown session");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if !session.get_state().allows(Method::Play.as_str()) {
            tracing::warn!(session_id, state = ?session.get_state(), "PLAY rejected: invalid session state");
            return RtspResponse::method_not_valid_in_state()
                .add_header("CSeq", cseq)
                .add_header("Session", &session.session_header_value());
        }

        session.set_state(SessionState::Playing);
        tracing::info!(session_id, "session started playing");

        let mut resp = RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-");

        if let Some(mount) = self.mounts.resolve_from_uri(&session.uri) {
            let rtp_info = format!(
                "url={};seq={};rtptime={}",
                session.uri,
                mount.next_sequence(),
                mount.next_rtp_timestamp()
            );
            resp = resp.add_header("RTP-Info", &rtp_info);
        }

        resp
    }

    /// RECORD (RFC 2326 §10.11): starts accepting media the client pushes
    /// for a session that was SETUP against an ANNOUNCEd track.
    fn handle_record(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session_id = match self.extract_session_id(request) {
            Some(id) => id,
            None => {
                tracing::warn!(%cseq, "RECORD missing Session header");
                return RtspResponse::session_not_found().add_header("CSeq", cseq);
            }
        };

        let Some(session) = self.session_manager.get_session(&session_id) else {
            tracing::warn!(session_id, "RECORD for unknown session");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if !session.get_state().allows(Method::Record.as_str()) {
            tracing::warn!(session_id, state = ?session.get_state(), "RECORD rejected: invalid session state");
            return RtspResponse::method_not_valid_in_state()
                .add_header("CSeq", cseq)
                .add_header("Session", &session.session_header_value());
        }

        session.set_state(SessionState::Recording);
        tracing::info!(session_id, "session started recording");

        RtspResponse::ok().add_header("CSeq", cseq).add_header("Session", &session.session_header_value())
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session_id = match self.extract_session_id(request) {
            Some(id) => id,
            None => {
                tracing::warn!(%cseq, "PAUSE missing Session header");
                return RtspResponse::session_not_found().add_header("CSeq", cseq);
            }
        };

        let Some(session) = self.session_manager.get_session(&session_id) else {
            tracing::warn!(session_id, "PAUSE for unknown session");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if !session.get_state().allows(Method::Pause.as_str()) {
            tracing::warn!(session_id, state = ?session.get_state(), "PAUSE rejected: invalid session state");
            return RtspResponse::method_not_valid_in_state()
                .add_header("CSeq", cseq)
                .add_header("Session", &session.session_header_value());
        }

        session.set_state(SessionState::Paused);
        tracing::info!(session_id, "session paused");
        RtspResponse::ok().add_header("CSeq", cseq).add_header("Session", &session.session_header_value())
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session_id = match self.extract_session_id(request) {
            Some(id) => id,
            None => {
                tracing::warn!(%cseq, "TEARDOWN missing Session header");
                return RtspResponse::session_not_found().add_header("CSeq", cseq);
            }
        };

        match self.session_manager.remove_session(&session_id) {
            Some(_) => {
                self.mounts.unsubscribe_all(&session_id);
                self.runtime.forget_session(&session_id);
                self.interleaved_rtp_channels.retain(|_, id| id != &session_id);
                self.interleaved_rtcp_channels.retain(|_, id| id != &session_id);
                self.session_ids.retain(|id| id != &session_id);
                tracing::info!(session_id, "session terminated via TEARDOWN");
                RtspResponse::ok().add_header("CSeq", cseq)
            }
            None => {
                tracing::warn!(session_id, "TEARDOWN for unknown session");
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            }
        }
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");
        self.keepalive_response(cseq, request)
    }

    /// SET_PARAMETER is used the same way as GET_PARAMETER when no body
    /// parameter is actually being set (RFC 2326 §10.9).
    fn handle_set_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "SET_PARAMETER keepalive");
        self.keepalive_response(cseq, request)
    }

    fn keepalive_response(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);

        if let Some(id) = self.extract_session_id(request)
            && self.session_manager.get_session(&id).is_some()
        {
            resp = resp.add_header("Session", &id);
        }

        resp
    }

    /// Extract session ID from the Session header.
    /// Handles timeout suffix: "SESSIONID;timeout=60" -> "SESSIONID"
    fn extract_session_id(&self, request: &RtspRequest) -> Option<String> {
        request
            .get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
    }
}

/// Reads inbound RTP off a RECORDing session's UDP pair for as long as the
/// session stays registered, depacketizing each packet and handing
/// completed access units to the server's record callback.
///
/// Self-terminating: once TEARDOWN (or disconnect cleanup) removes the
/// session from `session_manager`, the next poll sees it gone and the
/// thread exits, so no separate shutdown signal is needed.
fn spawn_udp_record_reader(pair: Arc<UdpPair>, session_manager: SessionManager, session_id: String, runtime: MediaRuntime) {
    thread::spawn(move || {
        if pair.set_read_timeout(Some(Duration::from_millis(500))).is_err() {
            return;
        }
        let mut buf = [0u8; 2048];
        loop {
            let Some(session) = session_manager.get_session(&session_id) else {
                tracing::trace!(session_id, "record reader exiting: session gone");
                return;
            };

            match pair.recv_rtp(&mut buf) {
                Ok((n, _peer)) => {
                    let Some(header) = rtp::parse_header(&buf[..n]) else { continue };
                    match session.depacketize_record(&buf[header.payload_offset..n], header.timestamp, header.marker) {
                        Ok(access_units) => {
                            if access_units.is_empty() {
                                continue;
                            }
                            let Some(callback) = runtime.record_sink.read().clone() else { continue };
                            for access_unit in access_units {
                                callback(&session_id, access_unit);
                            }
                        }
                        Err(e) => tracing::warn!(session_id, error = %e, "failed to depacketize recorded media"),
                    }
                }
                Err(_) => continue,
            }
        }
    });
}
