//! Scripted frame source for deterministic tests and demos

use super::{encode_jpeg_payload, Exposure, FrameSource, SourceError, StartParams};
use bytes::Bytes;
use parking_lot::Mutex;

/// A recorded call to [`FrameSource::start`]
#[derive(Debug, Clone, PartialEq)]
pub struct StartCall {
    pub device: String,
    pub params: StartParams,
}

#[derive(Debug)]
struct Script {
    modes: Vec<String>,
    permitted: bool,
    permission_requests: u32,
    start_status: i32,
    starts: Vec<StartCall>,
    frame_number: u64,
    jpeg: Option<Bytes>,
    raw: Option<Bytes>,
    exposures: Vec<Exposure>,
    closed: Vec<String>,
}

/// Frame source driven entirely by the caller.
///
/// Frames appear only when [`push_frame`](Self::push_frame) is called, so a
/// test controls exactly which identifiers and payloads the ingest loop sees.
#[derive(Debug)]
pub struct ScriptedSource {
    script: Mutex<Script>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::with_modes(["6,640,480,30"])
    }

    pub fn with_modes<I, S>(modes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(Script {
                modes: modes.into_iter().map(Into::into).collect(),
                permitted: true,
                permission_requests: 0,
                start_status: 0,
                starts: Vec::new(),
                frame_number: 0,
                jpeg: None,
                raw: None,
                exposures: Vec::new(),
                closed: Vec::new(),
            }),
        }
    }

    pub fn set_permitted(&self, permitted: bool) {
        self.script.lock().permitted = permitted;
    }

    /// Status code returned by the next `start` calls.
    pub fn set_start_status(&self, status: i32) {
        self.script.lock().start_status = status;
    }

    /// Publishes a new frame with the next identifier and returns it.
    pub fn push_frame(&self, jpeg: &[u8], raw: Option<&[u8]>) -> u64 {
        let mut script = self.script.lock();
        script.frame_number += 1;
        script.jpeg = Some(encode_jpeg_payload(jpeg));
        script.raw = raw.map(Bytes::copy_from_slice);
        script.frame_number
    }

    /// Advances the identifier without a JPEG payload.
    pub fn push_empty_frame(&self, raw: Option<&[u8]>) -> u64 {
        let mut script = self.script.lock();
        script.frame_number += 1;
        script.jpeg = None;
        script.raw = raw.map(Bytes::copy_from_slice);
        script.frame_number
    }

    /// Sets an arbitrary payload, including malformed ones, and advances
    /// the identifier.
    pub fn push_payload(&self, payload: Option<Bytes>) -> u64 {
        let mut script = self.script.lock();
        script.frame_number += 1;
        script.jpeg = payload;
        script.frame_number
    }

    /// Forces the identifier, e.g. to simulate a counter that goes backwards.
    pub fn set_frame_number(&self, frame_number: u64) {
        self.script.lock().frame_number = frame_number;
    }

    pub fn permission_requests(&self) -> u32 {
        self.script.lock().permission_requests
    }

    pub fn starts(&self) -> Vec<StartCall> {
        self.script.lock().starts.clone()
    }

    pub fn exposures(&self) -> Vec<Exposure> {
        self.script.lock().exposures.clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.script.lock().closed.clone()
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for ScriptedSource {
    fn has_permission(&self, _device: &str) -> bool {
        self.script.lock().permitted
    }

    fn request_permission(&self, _device: &str) {
        self.script.lock().permission_requests += 1;
    }

    fn open(&self, device: &str) -> Result<Vec<String>, SourceError> {
        let script = self.script.lock();
        if !script.permitted {
            return Err(SourceError::PermissionDenied(device.to_string()));
        }
        Ok(script.modes.clone())
    }

    fn start(&self, device: &str, params: &StartParams) -> i32 {
        let mut script = self.script.lock();
        script.starts.push(StartCall {
            device: device.to_string(),
            params: params.clone(),
        });
        script.start_status
    }

    fn frame_number(&self, _device: &str) -> u64 {
        self.script.lock().frame_number
    }

    fn jpeg_payload(&self, _device: &str) -> Option<Bytes> {
        self.script.lock().jpeg.clone()
    }

    fn raw_payload(&self, _device: &str) -> Option<Bytes> {
        self.script.lock().raw.clone()
    }

    fn set_exposure(&self, _device: &str, exposure: Exposure) -> Result<(), SourceError> {
        self.script.lock().exposures.push(exposure);
        Ok(())
    }

    fn close(&self, device: &str) {
        self.script.lock().closed.push(device.to_string());
    }
}
