//! Ingest loop: Frame Source -> Frame Store + client wake-ups
//!
//! Runs on its own thread, polls the source at a bounded rate and does work
//! only when the frame identifier moves forward.

use crate::frame::FrameStore;
use crate::registry::ClientRegistry;
use crate::source::{decode_jpeg_payload, FrameSource};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default pause between polls, caps the loop near 250 Hz
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(4);

/// Result of a single [`IngestLoop::poll_once`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Identifier did not advance
    Unchanged,
    /// New JPEG published and `woken` clients notified
    Published { frame_id: u64, len: usize, woken: usize },
    /// Identifier advanced but the JPEG payload was missing or unusable
    Skipped { frame_id: u64 },
}

/// Counters for the ingest loop
#[derive(Debug, Default)]
pub struct IngestStats {
    polls: AtomicU64,
    frames_published: AtomicU64,
    frames_invalid: AtomicU64,
    previews_refreshed: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSnapshot {
    pub polls: u64,
    pub frames_published: u64,
    pub frames_invalid: u64,
    pub previews_refreshed: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_invalid: self.frames_invalid.load(Ordering::Relaxed),
            previews_refreshed: self.previews_refreshed.load(Ordering::Relaxed),
        }
    }
}

impl IngestSnapshot {
    /// Publish rate between two snapshots
    pub fn calculate_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let delta = self.frames_published.saturating_sub(previous.frames_published);
        delta as f64 / elapsed_secs
    }
}

pub struct IngestLoop {
    device: String,
    source: Arc<dyn FrameSource>,
    jpeg: Arc<FrameStore>,
    preview: Arc<FrameStore>,
    registry: Arc<ClientRegistry>,
    stats: Arc<IngestStats>,
    last_frame: Option<u64>,
}

impl IngestLoop {
    pub fn new(
        device: impl Into<String>,
        source: Arc<dyn FrameSource>,
        jpeg: Arc<FrameStore>,
        preview: Arc<FrameStore>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            device: device.into(),
            source,
            jpeg,
            preview,
            registry,
            stats: Arc::new(IngestStats::default()),
            last_frame: None,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Performs one poll of the source.
    ///
    /// The identifier is recorded as seen before the payload is read, so a
    /// frame whose JPEG is missing is skipped rather than retried. The preview
    /// is refreshed for every new identifier whatever the JPEG looked like.
    pub fn poll_once(&mut self) -> PollOutcome {
        self.stats.polls.fetch_add(1, Ordering::Relaxed);

        let frame_id = self.source.frame_number(&self.device);
        if self.last_frame.is_some_and(|last| frame_id <= last) {
            return PollOutcome::Unchanged;
        }
        self.last_frame = Some(frame_id);

        let outcome = self.ingest_jpeg(frame_id);
        self.refresh_preview(frame_id);
        outcome
    }

    fn ingest_jpeg(&self, frame_id: u64) -> PollOutcome {
        let Some(payload) = self.source.jpeg_payload(&self.device) else {
            debug!(device = %self.device, frame_id, "No JPEG payload for frame");
            self.stats.frames_invalid.fetch_add(1, Ordering::Relaxed);
            return PollOutcome::Skipped { frame_id };
        };

        let Some(jpeg) = decode_jpeg_payload(&payload) else {
            warn!(
                device = %self.device,
                frame_id,
                payload_len = payload.len(),
                "Malformed JPEG payload"
            );
            self.stats.frames_invalid.fetch_add(1, Ordering::Relaxed);
            return PollOutcome::Skipped { frame_id };
        };

        if let Err(e) = self.jpeg.publish(frame_id, jpeg) {
            warn!(device = %self.device, frame_id, error = %e, "Dropping frame");
            self.stats.frames_invalid.fetch_add(1, Ordering::Relaxed);
            return PollOutcome::Skipped { frame_id };
        }
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);

        let woken = self.registry.wake_all();
        PollOutcome::Published {
            frame_id,
            len: jpeg.len(),
            woken,
        }
    }

    fn refresh_preview(&self, frame_id: u64) {
        let Some(raw) = self.source.raw_payload(&self.device) else {
            return;
        };

        match self.preview.publish(frame_id, &raw) {
            Ok(()) => {
                self.stats.previews_refreshed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(device = %self.device, frame_id, error = %e, "Preview frame dropped");
            }
        }
    }

    /// Polls until `running` goes false, pacing each iteration to at least
    /// `interval`.
    pub fn run(mut self, running: Arc<AtomicBool>, interval: Duration) {
        info!(device = %self.device, interval_ms = interval.as_millis() as u64, "Ingest loop started");

        while running.load(Ordering::Relaxed) {
            let started = Instant::now();

            if let PollOutcome::Published { frame_id, len, woken } = self.poll_once() {
                debug!(device = %self.device, frame_id, len, woken, "Frame published");
            }

            let elapsed = started.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }

        let stats = self.stats.snapshot();
        info!(
            device = %self.device,
            published = %stats.frames_published,
            invalid = %stats.frames_invalid,
            "Ingest loop stopped"
        );
    }

    /// Runs the loop on a dedicated named thread.
    pub fn spawn(
        self,
        running: Arc<AtomicBool>,
        interval: Duration,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("ingest-{}", self.device))
            .spawn(move || self.run(running, interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ScriptedSource;
    use crate::wake::Wake;
    use bytes::Bytes;

    struct Fixture {
        source: Arc<ScriptedSource>,
        jpeg: Arc<FrameStore>,
        preview: Arc<FrameStore>,
        registry: Arc<ClientRegistry>,
        ingest: IngestLoop,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(ScriptedSource::new());
        let jpeg = Arc::new(FrameStore::with_capacity(64));
        let preview = Arc::new(FrameStore::with_capacity(64));
        let registry = ClientRegistry::new();
        let ingest = IngestLoop::new(
            "cam0",
            Arc::clone(&source) as Arc<dyn FrameSource>,
            Arc::clone(&jpeg),
            Arc::clone(&preview),
            Arc::clone(&registry),
        );
        Fixture {
            source,
            jpeg,
            preview,
            registry,
            ingest,
        }
    }

    fn latest(store: &FrameStore) -> Option<Vec<u8>> {
        let mut dst = Vec::new();
        store.copy_latest(&mut dst).map(|_| dst)
    }

    #[test]
    fn test_publishes_only_on_new_identifier() {
        let mut f = fixture();
        f.source.push_frame(b"A", None);

        assert!(matches!(
            f.ingest.poll_once(),
            PollOutcome::Published { frame_id: 1, len: 1, .. }
        ));
        assert_eq!(f.ingest.poll_once(), PollOutcome::Unchanged);
        assert_eq!(f.ingest.poll_once(), PollOutcome::Unchanged);
        assert_eq!(f.jpeg.publish_count(), 1);
        assert_eq!(latest(&f.jpeg).unwrap(), b"A");
    }

    #[test]
    fn test_identifier_going_backwards_is_ignored() {
        let mut f = fixture();
        f.source.push_frame(b"A", None);
        f.source.push_frame(b"B", None);
        f.ingest.poll_once();

        f.source.set_frame_number(1);
        assert_eq!(f.ingest.poll_once(), PollOutcome::Unchanged);
        assert_eq!(f.jpeg.latest_frame_id(), Some(2));
    }

    #[test]
    fn test_unchanged_poll_does_not_wake_clients() {
        let mut f = fixture();
        let client = f.registry.register(None);
        client.try_wait();

        f.source.push_frame(b"A", None);
        f.ingest.poll_once();
        assert_eq!(client.try_wait(), Some(Wake::Notified));

        f.ingest.poll_once();
        assert_eq!(client.try_wait(), None);
    }

    #[test]
    fn test_missing_payload_is_skipped_not_retried() {
        let mut f = fixture();
        let client = f.registry.register(None);
        client.try_wait();

        let id = f.source.push_empty_frame(None);
        assert_eq!(f.ingest.poll_once(), PollOutcome::Skipped { frame_id: id });
        assert_eq!(f.ingest.poll_once(), PollOutcome::Unchanged);
        assert_eq!(client.try_wait(), None);
        assert_eq!(latest(&f.jpeg), None);
        assert_eq!(f.ingest.stats().snapshot().frames_invalid, 1);
    }

    #[test]
    fn test_malformed_and_oversized_payloads_are_skipped() {
        let mut f = fixture();
        f.source.push_frame(b"good", None);
        f.ingest.poll_once();

        let id = f.source.push_payload(Some(Bytes::from_static(&[9, 0])));
        assert_eq!(f.ingest.poll_once(), PollOutcome::Skipped { frame_id: id });

        let id = f.source.push_frame(&[0u8; 65], None);
        assert_eq!(f.ingest.poll_once(), PollOutcome::Skipped { frame_id: id });

        assert_eq!(latest(&f.jpeg).unwrap(), b"good");
    }

    #[test]
    fn test_preview_refreshed_regardless_of_jpeg() {
        let mut f = fixture();
        f.source.push_empty_frame(Some(b"raw-1"));
        f.ingest.poll_once();
        assert_eq!(latest(&f.preview).unwrap(), b"raw-1");

        f.source.push_frame(b"A", Some(b"raw-2"));
        f.ingest.poll_once();
        assert_eq!(latest(&f.preview).unwrap(), b"raw-2");
        assert_eq!(f.ingest.stats().snapshot().previews_refreshed, 2);
    }

    #[test]
    fn test_run_stops_when_flag_clears() {
        let f = fixture();
        let running = Arc::new(AtomicBool::new(true));
        let stats = f.ingest.stats();
        f.source.push_frame(b"A", None);

        let handle = f
            .ingest
            .spawn(Arc::clone(&running), Duration::from_millis(1))
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();

        let snapshot = stats.snapshot();
        assert!(snapshot.polls > 1);
        assert_eq!(snapshot.frames_published, 1);
    }

    #[test]
    fn test_calculate_fps() {
        let prev = IngestSnapshot {
            frames_published: 100,
            ..Default::default()
        };
        let current = IngestSnapshot {
            frames_published: 130,
            ..Default::default()
        };
        assert_eq!(current.calculate_fps(&prev, 1.0), 30.0);
        assert_eq!(current.calculate_fps(&prev, 0.0), 0.0);
    }
}
