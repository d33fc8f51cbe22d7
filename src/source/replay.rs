//! Directory replay source
//!
//! Loops over the JPEG files of a directory at a fixed rate. Useful for
//! running the server without camera hardware.

use super::{encode_jpeg_payload, CameraMode, FrameSource, SourceError, StartParams};
use crate::frame::validate_jpeg;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct ReplaySource {
    frames: Vec<Bytes>,
    mode: CameraMode,
    started: Mutex<HashMap<String, Instant>>,
}

impl ReplaySource {
    /// Loads every `.jpg` / `.jpeg` file in `dir`, sorted by file name.
    ///
    /// Files that are not complete JPEGs (no SOF, or cut short before EOI)
    /// are skipped. The advertised mode takes its dimensions from the first
    /// file.
    pub fn from_dir<P: AsRef<Path>>(dir: P, fps: u32) -> Result<Self, SourceError> {
        let dir = dir.as_ref();
        if fps == 0 {
            return Err(SourceError::InvalidMode(format!("replay fps must be > 0, got {fps}")));
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            })
            .collect();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        let mut first_info = None;
        for path in &paths {
            let data = std::fs::read(path)?;
            match validate_jpeg(&data) {
                Ok(info) => {
                    first_info.get_or_insert(info);
                    frames.push(Bytes::from(data));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable JPEG"),
            }
        }

        let Some(info) = first_info else {
            return Err(SourceError::DeviceNotFound(format!(
                "no JPEG files in {}",
                dir.display()
            )));
        };
        let mode = CameraMode::mjpeg(info.width as u32, info.height as u32, fps);

        info!(dir = %dir.display(), frames = frames.len(), mode = %mode, "Replay source loaded");

        Ok(Self {
            frames,
            mode,
            started: Mutex::new(HashMap::new()),
        })
    }

    pub fn mode(&self) -> CameraMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frame identifier derived from the time since `start`; `0` before.
    fn current(&self, device: &str) -> u64 {
        self.started
            .lock()
            .get(device)
            .map(|started| (started.elapsed().as_secs_f64() * self.mode.fps as f64) as u64 + 1)
            .unwrap_or(0)
    }
}

impl FrameSource for ReplaySource {
    fn open(&self, device: &str) -> Result<Vec<String>, SourceError> {
        debug!(device, "Replay device opened");
        Ok(vec![format!(
            "{},{},{},{}",
            self.mode.format, self.mode.width, self.mode.height, self.mode.fps
        )])
    }

    fn start(&self, device: &str, params: &StartParams) -> i32 {
        if params.width != self.mode.width || params.height != self.mode.height {
            warn!(device, ?params, mode = %self.mode, "Replay started with a mode it does not advertise");
            return -1;
        }
        self.started.lock().insert(device.to_string(), Instant::now());
        0
    }

    fn frame_number(&self, device: &str) -> u64 {
        self.current(device)
    }

    fn jpeg_payload(&self, device: &str) -> Option<Bytes> {
        let frame_id = self.current(device);
        if frame_id == 0 {
            return None;
        }
        let index = ((frame_id - 1) % self.frames.len() as u64) as usize;
        self.frames.get(index).map(|jpeg| encode_jpeg_payload(jpeg))
    }

    fn raw_payload(&self, _device: &str) -> Option<Bytes> {
        None
    }

    fn close(&self, device: &str) {
        self.started.lock().remove(device);
    }
}
