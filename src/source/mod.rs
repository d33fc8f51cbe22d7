//! Frame Source capability interface
//!
//! The streaming core never talks to a camera directly. Everything it needs
//! from the acquisition side goes through [`FrameSource`]: mode enumeration,
//! start/close, a monotonic frame counter and the latest JPEG / raw payloads.

mod fixture;
#[cfg(feature = "gstreamer")]
mod gst;
mod replay;

pub use fixture::{ScriptedSource, StartCall};
#[cfg(feature = "gstreamer")]
pub use gst::GstSource;
pub use replay::ReplaySource;

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Format code the camera layer uses for MJPEG modes
pub const MJPEG_FORMAT: u32 = 6;

/// Size of the little-endian length prefix on JPEG payloads
pub const PAYLOAD_PREFIX_LEN: usize = 4;

/// Auto exposure mode code
pub const AUTO_EXPOSURE_MODE: i32 = 8;

/// Manual exposure mode code
pub const MANUAL_EXPOSURE_MODE: i32 = 1;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("permission not granted for device {0}")]
    PermissionDenied(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("invalid mode descriptor: {0}")]
    InvalidMode(String),

    #[error("operation not supported by this source")]
    Unsupported,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Parameters passed to [`FrameSource::start`]
#[derive(Debug, Clone, PartialEq)]
pub struct StartParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
    /// Share of USB bandwidth this camera may claim (1.0 for two cameras,
    /// 0.5 for four, ...)
    pub bandwidth: f32,
}

/// Exposure command forwarded to the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exposure {
    Auto,
    /// Exposure time in tenths of a millisecond
    Manual(u32),
}

impl Exposure {
    /// Maps the slider convention (negative = auto) onto a command.
    pub fn from_value(value: i32) -> Self {
        if value < 0 {
            Exposure::Auto
        } else {
            Exposure::Manual(value as u32)
        }
    }

    pub fn mode_code(&self) -> i32 {
        match self {
            Exposure::Auto => AUTO_EXPOSURE_MODE,
            Exposure::Manual(_) => MANUAL_EXPOSURE_MODE,
        }
    }
}

/// Opaque producer of camera frames.
///
/// Implementations are shared between the session (control calls) and the
/// ingest thread (polling), so every method takes `&self`.
pub trait FrameSource: Send + Sync {
    /// Whether the caller may open `device` right now.
    fn has_permission(&self, _device: &str) -> bool {
        true
    }

    /// Asks for access to `device`. There is no completion callback: the
    /// caller has to invoke `open` again later.
    fn request_permission(&self, _device: &str) {}

    /// Opens the device and returns its mode descriptors
    /// (`"<type>,<width>,<height>,<fps>"`).
    fn open(&self, device: &str) -> Result<Vec<String>, SourceError>;

    /// Starts streaming. Returns a status code, `0` on success.
    fn start(&self, device: &str, params: &StartParams) -> i32;

    /// Current frame identifier, monotonic within a started session.
    fn frame_number(&self, device: &str) -> u64;

    /// Latest JPEG payload, framed as a 4-byte little-endian length followed
    /// by the JPEG bytes.
    fn jpeg_payload(&self, device: &str) -> Option<Bytes>;

    /// Latest raw pixel payload for local preview.
    fn raw_payload(&self, device: &str) -> Option<Bytes>;

    fn set_exposure(&self, _device: &str, _exposure: Exposure) -> Result<(), SourceError> {
        Err(SourceError::Unsupported)
    }

    /// Releases the device.
    fn close(&self, device: &str);
}

/// A capture mode advertised by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CameraMode {
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl CameraMode {
    pub fn mjpeg(width: u32, height: u32, fps: u32) -> Self {
        Self {
            format: MJPEG_FORMAT,
            width,
            height,
            fps,
        }
    }

    pub fn is_mjpeg(&self) -> bool {
        self.format == MJPEG_FORMAT
    }

    /// Worst-case frame size for this resolution (three bytes per pixel).
    pub fn max_frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl FromStr for CameraMode {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(SourceError::InvalidMode(s.to_string()));
        }

        let parse = |field: &str| {
            field
                .parse::<u32>()
                .map_err(|_| SourceError::InvalidMode(s.to_string()))
        };

        Ok(Self {
            format: parse(fields[0])?,
            width: parse(fields[1])?,
            height: parse(fields[2])?,
            fps: parse(fields[3])?,
        })
    }
}

impl fmt::Display for CameraMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.fps)
    }
}

/// Parses descriptors and keeps only well-formed MJPEG modes, in order.
pub fn usable_modes<S: AsRef<str>>(descriptors: &[S]) -> Vec<CameraMode> {
    descriptors
        .iter()
        .filter_map(|d| d.as_ref().parse::<CameraMode>().ok())
        .filter(|m| m.is_mjpeg() && m.width > 0 && m.height > 0 && m.fps > 0)
        .collect()
}

/// Prefixes `jpeg` with its little-endian length.
pub fn encode_jpeg_payload(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PAYLOAD_PREFIX_LEN + jpeg.len());
    buf.put_u32_le(jpeg.len() as u32);
    buf.put_slice(jpeg);
    buf.freeze()
}

/// Returns the JPEG bytes of a length-prefixed payload, or `None` when the
/// prefix is missing or claims more bytes than are present.
pub fn decode_jpeg_payload(payload: &[u8]) -> Option<&[u8]> {
    let prefix: [u8; PAYLOAD_PREFIX_LEN] = payload.get(..PAYLOAD_PREFIX_LEN)?.try_into().ok()?;
    let len = u32::from_le_bytes(prefix) as usize;
    payload.get(PAYLOAD_PREFIX_LEN..PAYLOAD_PREFIX_LEN.checked_add(len)?)
}
