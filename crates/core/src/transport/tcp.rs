use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::mount::MountRegistry;
use crate::protocol::MethodHandler;
use crate::protocol::RtspRequest;
use crate::server::{MediaRuntime, ServerConfig};
use crate::session::SessionManager;
use crate::transport::interleaved::{InterleavedFrame, MAGIC};

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub fn accept_loop(
    listener: TcpListener,
    session_manager: SessionManager,
    mounts: MountRegistry,
    config: Arc<ServerConfig>,
    runtime: MediaRuntime,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let sm = session_manager.clone();
                let r = running.clone();
                let m = mounts.clone();
                let c = config.clone();
                let rt = runtime.clone();
                thread::spawn(move || {
                    Connection::handle(stream, sm, m, c, rt, r);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection with its own lifecycle.
///
/// A connection multiplexes RTSP request/response text with interleaved
/// `$`-framed RTP/RTCP (RFC 2326 §10.12) on the same socket: whichever
/// transport a client's SETUP negotiates, the reader has to tell the two
/// apart by peeking the leading byte of the next message.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: Arc<Mutex<TcpStream>>,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    pub fn handle(
        stream: TcpStream,
        session_manager: SessionManager,
        mounts: MountRegistry,
        config: Arc<ServerConfig>,
        runtime: MediaRuntime,
        running: Arc<AtomicBool>,
    ) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        tracing::info!(%peer_addr, "client connected");

        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        let writer = Arc::new(Mutex::new(stream));

        let handler = MethodHandler::new(
            session_manager.clone(),
            peer_addr,
            mounts.clone(),
            config,
            runtime,
            writer.clone(),
        );

        let mut conn = Connection { reader: BufReader::new(reader_stream), writer, handler, peer_addr };

        let reason = conn.run(&running);
        conn.cleanup(&session_manager, &mounts);

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let first_byte = match self.reader.fill_buf() {
                Ok(buf) if buf.is_empty() => return "connection closed by client",
                Ok(buf) => buf[0],
                Err(_) => return "read error",
            };

            if first_byte == MAGIC {
                self.reader.consume(1);
                match InterleavedFrame::read_after_magic(&mut self.reader) {
                    Ok(frame) => self.handler.handle_interleaved_frame(frame),
                    Err(_) => return "read error",
                }
                continue;
            }

            let mut request_text = String::new();
            loop {
                let mut line = String::new();
                match self.reader.read_line(&mut line) {
                    Ok(0) => return "connection closed by client",
                    Ok(_) => {
                        request_text.push_str(&line);
                        if line == "\r\n" || line == "\n" {
                            break;
                        }
                    }
                    Err(_) => return "read error",
                }
            }

            if request_text.trim().is_empty() {
                continue;
            }

            let declared_len = content_length_of(&request_text);
            let mut body = vec![0u8; declared_len];
            if declared_len > 0 && self.reader.read_exact(&mut body).is_err() {
                return "read error";
            }
            let mut raw = request_text.into_bytes();
            raw.extend_from_slice(&body);

            match RtspRequest::parse(&raw) {
                Ok(request) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        version = %request.version,
                        "request"
                    );

                    let response = self.handler.handle(&request);

                    tracing::debug!(
                        peer = %self.peer_addr,
                        status = response.status_code,
                        "response"
                    );

                    if self.writer.lock().write_all(&response.serialize()).is_err() {
                        return "write error";
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                }
            }
        }

        "server shutting down"
    }

    /// Clean up sessions owned by this connection and unsubscribe from mounts.
    fn cleanup(&self, session_manager: &SessionManager, mounts: &MountRegistry) {
        let orphaned = self.handler.session_ids().to_vec();
        if !orphaned.is_empty() {
            for id in &orphaned {
                mounts.unsubscribe_all(id);
                self.handler.runtime().forget_session(id);
            }
            let removed = session_manager.remove_sessions(&orphaned);
            tracing::info!(peer = %self.peer_addr, removed, "cleaned up sessions on disconnect");
        }
    }
}

/// Scans already-read header text for a `Content-Length` value, defaulting
/// to 0 (most requests, and all error paths, carry no body).
fn content_length_of(header_text: &str) -> usize {
    for line in header_text.split("\r\n") {
        if let Some(rest) = line.split_once(':')
            && rest.0.trim().eq_ignore_ascii_case("Content-Length")
        {
            return rest.1.trim().parse().unwrap_or(0);
        }
    }
    0
}
