//! Latest-frame storage shared between the ingest thread and client streamers
//!
//! A [`FrameStore`] is a pre-sized byte buffer plus a valid length. The ingest
//! loop overwrites it in place; readers copy the valid region out under the
//! same lock and do their network I/O on the copy. The lock is never held
//! across anything but a `memcpy`.

mod jpeg;

pub use jpeg::{inspect_jpeg, validate_jpeg, JpegInfo, JpegParseError};

#[cfg(test)]
pub(crate) use jpeg::create_minimal_jpeg;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameStoreError {
    #[error("frame of {len} bytes exceeds store capacity of {capacity} bytes")]
    TooLarge { len: usize, capacity: usize },
}

/// Metadata of the frame returned by [`FrameStore::copy_latest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopiedFrame {
    pub frame_id: u64,
    pub len: usize,
}

struct FrameBuffer {
    data: Box<[u8]>,
    valid_len: usize,
    frame_id: Option<u64>,
    publish_count: u64,
}

/// Single-slot latest-frame buffer
pub struct FrameStore {
    buffer: Mutex<FrameBuffer>,
}

impl FrameStore {
    /// Allocates the full buffer up front so steady-state publishing never
    /// allocates.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(FrameBuffer {
                data: vec![0u8; capacity].into_boxed_slice(),
                valid_len: 0,
                frame_id: None,
                publish_count: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.lock().data.len()
    }

    /// Replaces the current frame. Readers observe either the previous frame
    /// or this one in full, never a mix.
    pub fn publish(&self, frame_id: u64, payload: &[u8]) -> Result<(), FrameStoreError> {
        let mut buffer = self.buffer.lock();
        let capacity = buffer.data.len();
        if payload.len() > capacity {
            return Err(FrameStoreError::TooLarge {
                len: payload.len(),
                capacity,
            });
        }

        buffer.data[..payload.len()].copy_from_slice(payload);
        buffer.valid_len = payload.len();
        buffer.frame_id = Some(frame_id);
        buffer.publish_count += 1;
        Ok(())
    }

    /// Copies the valid region of the latest frame into `dst`, replacing its
    /// contents. Returns `None` if nothing has been published yet, in which
    /// case `dst` is left untouched.
    ///
    /// `dst` keeps its allocation between calls, so a reader that reuses the
    /// same vector stops allocating once it has seen the largest frame.
    pub fn copy_latest(&self, dst: &mut Vec<u8>) -> Option<CopiedFrame> {
        let buffer = self.buffer.lock();
        let frame_id = buffer.frame_id?;
        dst.clear();
        dst.extend_from_slice(&buffer.data[..buffer.valid_len]);
        Some(CopiedFrame {
            frame_id,
            len: buffer.valid_len,
        })
    }

    /// Identifier of the latest published frame.
    pub fn latest_frame_id(&self) -> Option<u64> {
        self.buffer.lock().frame_id
    }

    /// Number of successful publishes since creation.
    pub fn publish_count(&self) -> u64 {
        self.buffer.lock().publish_count
    }
}

impl std::fmt::Debug for FrameStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buffer = self.buffer.lock();
        f.debug_struct("FrameStore")
            .field("capacity", &buffer.data.len())
            .field("valid_len", &buffer.valid_len)
            .field("frame_id", &buffer.frame_id)
            .finish()
    }
}
