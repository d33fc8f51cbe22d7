//! MJPEG-over-HTTP server
//!
//! One accept thread per camera, one streaming thread per viewer. Viewers
//! never share a socket or a write path, so a stalled viewer only slows
//! itself down. Stopping shuts every viewer socket down, so a thread blocked
//! in a read or write returns at once.

mod client;
pub mod http;
mod stats;

pub use client::{ClientStreamer, StreamEnd};
pub use stats::{ServerStats, StreamerStats};

use crate::frame::FrameStore;
use crate::registry::{ClientHandle, ClientRegistry};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How often the accept thread looks at the stop flag when idle
const ACCEPT_POLL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// Deadline for a single part write; a viewer slower than this is dropped
    pub write_timeout: Duration,
    /// Deadline for receiving the request head
    pub request_timeout: Duration,
    pub max_request_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            write_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            max_request_bytes: 8192,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Listening,
}

/// Connection acceptor for one camera
pub struct MjpegServer {
    local_addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    accepting: Arc<AtomicBool>,
    registry: Arc<ClientRegistry>,
    stats: Arc<ServerStats>,
    accept_thread: Option<JoinHandle<()>>,
    clients: Arc<Mutex<Vec<ClientThread>>>,
}

/// A viewer thread and a second handle to its socket
struct ClientThread {
    thread: JoinHandle<()>,
    socket: Option<TcpStream>,
}

impl ClientThread {
    fn shutdown(&self) {
        if let Some(socket) = &self.socket {
            // Already closed by the peer or by the thread itself
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

impl MjpegServer {
    /// Binds the listener and starts accepting on a background thread.
    ///
    /// `running` is the camera's run flag; streamers stop when it clears.
    pub fn start(
        config: ListenerConfig,
        store: Arc<FrameStore>,
        registry: Arc<ClientRegistry>,
        running: Arc<AtomicBool>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).map_err(|source| ServerError::Bind {
            addr: config.bind_addr,
            source,
        })?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let state = Arc::new(Mutex::new(ServerState::Listening));
        let accepting = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ServerStats::default());
        let clients = Arc::new(Mutex::new(Vec::new()));

        let acceptor = Acceptor {
            listener,
            config,
            store,
            registry: Arc::clone(&registry),
            running,
            accepting: Arc::clone(&accepting),
            stats: Arc::clone(&stats),
            state: Arc::clone(&state),
            clients: Arc::clone(&clients),
        };

        let accept_thread = thread::Builder::new()
            .name(format!("mjpeg-accept-{}", local_addr.port()))
            .spawn(move || acceptor.run())?;

        info!(addr = %local_addr, "MJPEG server listening");

        Ok(Self {
            local_addr,
            state,
            accepting,
            registry,
            stats,
            accept_thread: Some(accept_thread),
            clients,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn stats(&self) -> StreamerStats {
        self.stats.snapshot(self.registry.len())
    }

    /// Closes the listener, wakes every streamer with a stop and waits for
    /// them to release their connections. Idempotent.
    pub fn stop(&mut self) {
        let Some(accept_thread) = self.accept_thread.take() else {
            return;
        };

        info!(addr = %self.local_addr, "Stopping MJPEG server");

        // The accept thread sees the flag within one poll and drops the
        // listener; no client is added after the join.
        self.accepting.store(false, Ordering::SeqCst);
        self.registry.close_all();
        if accept_thread.join().is_err() {
            warn!(addr = %self.local_addr, "Accept thread panicked");
        }

        let clients = std::mem::take(&mut *self.clients.lock());
        let count = clients.len();
        for client in &clients {
            client.shutdown();
        }
        for client in clients {
            if client.thread.join().is_err() {
                warn!(addr = %self.local_addr, "Client thread panicked");
            }
        }

        *self.state.lock() = ServerState::Stopped;
        info!(addr = %self.local_addr, joined = count, "MJPEG server stopped");
    }
}

impl Drop for MjpegServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    )
}

/// State moved onto the accept thread
struct Acceptor {
    listener: TcpListener,
    config: ListenerConfig,
    store: Arc<FrameStore>,
    registry: Arc<ClientRegistry>,
    running: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    state: Arc<Mutex<ServerState>>,
    clients: Arc<Mutex<Vec<ClientThread>>>,
}

impl Acceptor {
    fn run(self) {
        while self.accepting.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => self.handle_connection(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) if is_transient(&e) => {
                    debug!(error = %e, "Transient accept error");
                }
                Err(e) => {
                    error!(error = %e, "Accept failed, closing listener");
                    break;
                }
            }
        }

        self.accepting.store(false, Ordering::SeqCst);
        *self.state.lock() = ServerState::Stopped;
        debug!("Accept loop exited");
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        self.stats.record_accept();

        let socket = match stream.try_clone() {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to clone viewer socket");
                None
            }
        };

        let handle = self.registry.register(Some(peer));
        let client_id = handle.id();
        info!(client_id, peer = ?peer, clients = self.registry.len(), "Viewer connected");

        let ctx = ClientContext {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            running: Arc::clone(&self.running),
            stats: Arc::clone(&self.stats),
        };

        let spawned = thread::Builder::new()
            .name(format!("mjpeg-client-{client_id}"))
            .spawn(move || ctx.serve(stream, handle));

        match spawned {
            Ok(thread) => {
                let mut clients = self.clients.lock();
                clients.retain(|c| !c.thread.is_finished());
                clients.push(ClientThread { thread, socket });
            }
            Err(e) => {
                warn!(client_id, error = %e, "Failed to spawn client thread");
                self.stats.record_reject();
            }
        }
    }
}

/// Everything a client thread needs besides its socket and handle
struct ClientContext {
    config: ListenerConfig,
    store: Arc<FrameStore>,
    running: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
}

impl ClientContext {
    fn serve(self, mut stream: TcpStream, handle: ClientHandle) {
        let client_id = handle.id();

        if let Err(e) = self.configure_socket(&stream) {
            warn!(client_id, error = %e, "Failed to configure socket");
        }

        match http::read_request_head(
            &mut stream,
            self.config.max_request_bytes,
            self.config.request_timeout,
        ) {
            Ok(head) => {
                debug!(client_id, method = %head.method, path = %head.path, "Stream requested");
            }
            Err(e) => {
                debug!(client_id, error = %e, "Bad or missing request head");
                self.stats.record_reject();
                return;
            }
        }

        if handle.is_closed() || !self.running.load(Ordering::Relaxed) {
            return;
        }

        if let Err(e) = stream
            .write_all(http::RESPONSE_HEAD)
            .and_then(|()| stream.flush())
        {
            debug!(client_id, error = %e, "Failed to write response head");
            self.stats.record_write_error();
            return;
        }

        let streamer = ClientStreamer::new(handle, self.store, stream, self.running, self.stats);
        match streamer.run() {
            StreamEnd::Stopped => debug!(client_id, "Viewer stream stopped"),
            StreamEnd::Disconnected(e) => info!(client_id, reason = %e, "Viewer disconnected"),
        }
    }

    fn configure_socket(&self, stream: &TcpStream) -> io::Result<()> {
        // Some platforms hand out accepted sockets in the listener's mode
        stream.set_nonblocking(false)?;
        // Latency over throughput: every part goes out as soon as it is written
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn test_config() -> ListenerConfig {
        ListenerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        }
    }

    fn start_server() -> (MjpegServer, Arc<FrameStore>, Arc<ClientRegistry>) {
        start_server_with(test_config())
    }

    fn start_server_with(config: ListenerConfig) -> (MjpegServer, Arc<FrameStore>, Arc<ClientRegistry>) {
        let store = Arc::new(FrameStore::with_capacity(1024));
        let registry = ClientRegistry::new();
        let server = MjpegServer::start(
            config,
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        (server, store, registry)
    }

    /// Sends a request head one byte every `gap` until the server hangs up
    fn trickle_request(addr: SocketAddr, gap: Duration) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            for byte in b"GET / HTTP/1.1\r\nX-Padding: ".iter().chain([b'x'; 256].iter()) {
                if stream.write_all(&[*byte]).is_err() {
                    return;
                }
                thread::sleep(gap);
            }
        })
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let (server, store, registry) = start_server();
        let config = ListenerConfig {
            bind_addr: server.local_addr(),
            ..test_config()
        };

        let err = MjpegServer::start(config, store, registry, Arc::new(AtomicBool::new(true)))
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[test]
    fn test_serves_latest_frame_to_new_viewer() {
        let (mut server, store, _registry) = start_server();
        store.publish(7, b"jpeg-bytes").unwrap();

        let mut viewer = TcpStream::connect(server.local_addr()).unwrap();
        viewer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        viewer.write_all(b"GET /anything HTTP/1.1\r\n\r\n").unwrap();

        let head = read_exact_len(&mut viewer, http::RESPONSE_HEAD.len());
        assert_eq!(head, http::RESPONSE_HEAD);

        let header = http::part_header(10);
        let part = read_exact_len(&mut viewer, header.len() + 10);
        assert_eq!(&part[..header.len()], header.as_bytes());
        assert_eq!(&part[header.len()..], b"jpeg-bytes");

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.stats().frames_sent, 1);
    }

    #[test]
    fn test_stop_closes_viewer_connections() {
        let (mut server, _store, registry) = start_server();

        let mut viewer = TcpStream::connect(server.local_addr()).unwrap();
        viewer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        viewer.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        read_exact_len(&mut viewer, http::RESPONSE_HEAD.len());
        assert_eq!(registry.len(), 1);

        server.stop();

        let mut rest = Vec::new();
        let n = viewer.read_to_end(&mut rest).unwrap_or(0);
        assert_eq!(n, 0);
        assert!(registry.is_empty());
        assert!(TcpStream::connect_timeout(&server.local_addr(), Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut server, _store, _registry) = start_server();
        server.stop();
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_stop_does_not_wait_for_trickled_request() {
        let (mut server, _store, registry) = start_server_with(ListenerConfig {
            request_timeout: Duration::from_secs(30),
            ..test_config()
        });
        let client = trickle_request(server.local_addr(), Duration::from_millis(50));

        wait_until(|| registry.len() == 1);
        thread::sleep(Duration::from_millis(200));

        let start = std::time::Instant::now();
        server.stop();
        assert!(start.elapsed() < Duration::from_secs(1), "stop took {:?}", start.elapsed());
        assert!(registry.is_empty());
        client.join().unwrap();
    }

    #[test]
    fn test_request_head_deadline_covers_whole_head() {
        let (mut server, _store, registry) = start_server_with(ListenerConfig {
            request_timeout: Duration::from_millis(300),
            ..test_config()
        });
        // Every single read succeeds well inside the timeout
        let client = trickle_request(server.local_addr(), Duration::from_millis(50));

        wait_until(|| server.stats().clients_rejected == 1);
        assert!(registry.is_empty());
        assert_eq!(server.stats().clients_accepted, 1);

        server.stop();
        client.join().unwrap();
    }

    #[test]
    fn test_stop_returns_promptly_without_viewers() {
        let (mut server, _store, _registry) = start_server();
        let start = std::time::Instant::now();
        server.stop();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(TcpStream::connect_timeout(&server.local_addr(), Duration::from_millis(200)).is_err());
    }
}
