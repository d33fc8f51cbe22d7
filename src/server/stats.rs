//! Streaming statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the acceptor and every client streamer
#[derive(Debug, Default)]
pub struct ServerStats {
    clients_accepted: AtomicU64,
    clients_rejected: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    write_errors: AtomicU64,
}

impl ServerStats {
    pub(crate) fn record_accept(&self) {
        self.clients_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reject(&self) {
        self.clients_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, clients_active: usize) -> StreamerStats {
        StreamerStats {
            clients_accepted: self.clients_accepted.load(Ordering::Relaxed),
            clients_rejected: self.clients_rejected.load(Ordering::Relaxed),
            clients_active: clients_active as u64,
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for the MJPEG server
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamerStats {
    /// Connections accepted since start
    pub clients_accepted: u64,

    /// Connections dropped before streaming (bad request head, spawn failure)
    pub clients_rejected: u64,

    /// Clients currently registered
    pub clients_active: u64,

    /// Parts written across all clients
    pub frames_sent: u64,

    /// Bytes written across all clients, part headers included
    pub bytes_sent: u64,

    /// Clients that ended on a failed write
    pub write_errors: u64,
}

impl StreamerStats {
    /// Calculates frame rate based on delta
    pub fn calculate_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let frames_delta = self.frames_sent.saturating_sub(previous.frames_sent);
        frames_delta as f64 / elapsed_secs
    }

    /// Calculates bitrate in kbps based on delta
    pub fn calculate_bitrate_kbps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let bytes_delta = self.bytes_sent.saturating_sub(previous.bytes_sent);
        (bytes_delta as f64 * 8.0) / elapsed_secs / 1000.0
    }
}
