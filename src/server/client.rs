//! Per-connection streaming loop

use super::http;
use super::stats::ServerStats;
use crate::frame::FrameStore;
use crate::registry::ClientHandle;
use crate::wake::Wake;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Why a client streamer returned
#[derive(Debug)]
pub enum StreamEnd {
    /// Server or camera stopped
    Stopped,
    /// A write failed, usually because the viewer went away
    Disconnected(io::Error),
}

/// Serves one viewer: wait for a wake, copy the latest frame, write a part.
///
/// Owns its output and its registry handle; both are released when
/// [`run`](Self::run) returns, which closes the connection and removes the
/// client from the registry.
pub struct ClientStreamer<W: Write> {
    handle: ClientHandle,
    store: Arc<FrameStore>,
    out: W,
    running: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    scratch: Vec<u8>,
    last_sent: Option<u64>,
    frames_sent: u64,
}

impl<W: Write> ClientStreamer<W> {
    pub fn new(
        handle: ClientHandle,
        store: Arc<FrameStore>,
        out: W,
        running: Arc<AtomicBool>,
        stats: Arc<ServerStats>,
    ) -> Self {
        let scratch = Vec::with_capacity(store.capacity());
        Self {
            handle,
            store,
            out,
            running,
            stats,
            scratch,
            last_sent: None,
            frames_sent: 0,
        }
    }

    pub fn run(mut self) -> StreamEnd {
        let client_id = self.handle.id();
        let end = self.stream();
        debug!(client_id, frames = self.frames_sent, end = ?end, "Client streamer finished");
        end
    }

    fn stream(&mut self) -> StreamEnd {
        loop {
            if self.handle.wait() == Wake::Closed || !self.running.load(Ordering::Relaxed) {
                return StreamEnd::Stopped;
            }

            // Lock held for the copy only; the write below works on our copy.
            let Some(frame) = self.store.copy_latest(&mut self.scratch) else {
                continue;
            };
            // A wake that raced with the previous copy can point at a frame
            // this viewer already has.
            if self.last_sent == Some(frame.frame_id) {
                continue;
            }

            match http::write_part(&mut self.out, &self.scratch) {
                Ok(written) => {
                    self.last_sent = Some(frame.frame_id);
                    self.frames_sent += 1;
                    self.stats.record_frame(written);
                }
                Err(e) => {
                    self.stats.record_write_error();
                    return StreamEnd::Disconnected(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientRegistry;
    use parking_lot::Mutex;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "viewer gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Blocks inside its first `write` until released, like a viewer whose
    /// socket buffer is full
    struct StuckWriter {
        entered: Sender<()>,
        release: Receiver<()>,
        stuck: bool,
    }

    impl Write for StuckWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.stuck {
                self.stuck = false;
                let _ = self.entered.send(());
                let _ = self.release.recv();
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn part(jpeg: &[u8]) -> Vec<u8> {
        let mut bytes = http::part_header(jpeg.len()).into_bytes();
        bytes.extend_from_slice(jpeg);
        bytes
    }

    fn wait_for_len(buf: &SharedBuf, len: usize) {
        for _ in 0..200 {
            if buf.0.lock().len() >= len {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {len} bytes");
    }

    fn wait_for_suffix(buf: &SharedBuf, tail: &[u8]) {
        for _ in 0..200 {
            if buf.0.lock().ends_with(tail) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for part");
    }

    #[test]
    fn test_blocked_writer_stalls_only_its_own_viewer() {
        let registry = ClientRegistry::new();
        let store = Arc::new(FrameStore::with_capacity(64));
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ServerStats::default());
        store.publish(1, b"f1").unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let stuck = ClientStreamer::new(
            registry.register(None),
            Arc::clone(&store),
            StuckWriter {
                entered: entered_tx,
                release: release_rx,
                stuck: true,
            },
            Arc::clone(&running),
            Arc::clone(&stats),
        );
        let stuck = thread::spawn(move || stuck.run());
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let out = SharedBuf::default();
        let healthy = ClientStreamer::new(
            registry.register(None),
            Arc::clone(&store),
            out.clone(),
            Arc::clone(&running),
            Arc::clone(&stats),
        );
        let healthy = thread::spawn(move || healthy.run());
        wait_for_suffix(&out, &part(b"f1"));

        let mut expected = part(b"f1");
        for id in 2..=6u64 {
            let jpeg = format!("f{id}").into_bytes();

            let start = Instant::now();
            store.publish(id, &jpeg).unwrap();
            assert_eq!(registry.wake_all(), 2);
            assert!(start.elapsed() < Duration::from_millis(20), "publish stalled");

            wait_for_suffix(&out, &part(&jpeg));
            expected.extend(part(&jpeg));
        }
        assert_eq!(*out.0.lock(), expected);

        release_tx.send(()).unwrap();
        registry.close_all();
        assert!(matches!(stuck.join().unwrap(), StreamEnd::Stopped));
        assert!(matches!(healthy.join().unwrap(), StreamEnd::Stopped));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_backlog_collapses_to_latest_frame() {
        let registry = ClientRegistry::new();
        let store = Arc::new(FrameStore::with_capacity(64));
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ServerStats::default());
        let out = SharedBuf::default();

        let handle = registry.register(None);
        for (i, payload) in [b"one", b"two", b"six"].iter().enumerate() {
            store.publish(i as u64 + 1, *payload).unwrap();
            registry.wake_all();
        }

        let streamer = ClientStreamer::new(
            handle,
            Arc::clone(&store),
            out.clone(),
            Arc::clone(&running),
            Arc::clone(&stats),
        );
        let worker = thread::spawn(move || streamer.run());

        wait_for_len(&out, part(b"six").len());
        thread::sleep(Duration::from_millis(20));
        registry.close_all();

        assert!(matches!(worker.join().unwrap(), StreamEnd::Stopped));
        assert_eq!(*out.0.lock(), part(b"six"));
        assert_eq!(stats.snapshot(0).frames_sent, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_wake_without_frame_writes_nothing() {
        let registry = ClientRegistry::new();
        let store = Arc::new(FrameStore::with_capacity(64));
        let out = SharedBuf::default();

        let streamer = ClientStreamer::new(
            registry.register(None),
            store,
            out.clone(),
            Arc::new(AtomicBool::new(true)),
            Arc::new(ServerStats::default()),
        );
        let worker = thread::spawn(move || streamer.run());

        registry.wake_all();
        thread::sleep(Duration::from_millis(20));
        registry.close_all();

        assert!(matches!(worker.join().unwrap(), StreamEnd::Stopped));
        assert!(out.0.lock().is_empty());
    }

    #[test]
    fn test_write_failure_unregisters_client() {
        let registry = ClientRegistry::new();
        let store = Arc::new(FrameStore::with_capacity(64));
        let stats = Arc::new(ServerStats::default());
        store.publish(1, b"frame").unwrap();

        let streamer = ClientStreamer::new(
            registry.register(None),
            store,
            BrokenPipe,
            Arc::new(AtomicBool::new(true)),
            Arc::clone(&stats),
        );
        assert_eq!(registry.len(), 1);

        match streamer.run() {
            StreamEnd::Disconnected(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected end: {other:?}"),
        }
        assert!(registry.is_empty());
        assert_eq!(stats.snapshot(0).write_errors, 1);
    }

    #[test]
    fn test_cleared_running_flag_stops_before_write() {
        let registry = ClientRegistry::new();
        let store = Arc::new(FrameStore::with_capacity(64));
        store.publish(1, b"frame").unwrap();
        let out = SharedBuf::default();

        let streamer = ClientStreamer::new(
            registry.register(None),
            store,
            out.clone(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(ServerStats::default()),
        );

        assert!(matches!(streamer.run(), StreamEnd::Stopped));
        assert!(out.0.lock().is_empty());
    }

    #[test]
    fn test_same_frame_is_not_sent_twice() {
        let registry = ClientRegistry::new();
        let store = Arc::new(FrameStore::with_capacity(64));
        let stats = Arc::new(ServerStats::default());
        let out = SharedBuf::default();
        store.publish(7, b"frame").unwrap();

        let streamer = ClientStreamer::new(
            registry.register(None),
            Arc::clone(&store),
            out.clone(),
            Arc::new(AtomicBool::new(true)),
            Arc::clone(&stats),
        );
        let worker = thread::spawn(move || streamer.run());

        wait_for_len(&out, part(b"frame").len());
        // Wakes without a new publish
        registry.wake_all();
        registry.wake_all();
        thread::sleep(Duration::from_millis(20));
        registry.close_all();

        assert!(matches!(worker.join().unwrap(), StreamEnd::Stopped));
        assert_eq!(*out.0.lock(), part(b"frame"));
        assert_eq!(stats.snapshot(0).frames_sent, 1);
    }
}
