//! Live MJPEG streaming of UVC cameras over HTTP
//!
//! A frame source is polled by one ingest thread per camera. Each new JPEG
//! frame is copied into a shared [`FrameStore`](frame::FrameStore) and every
//! connected viewer is woken. Viewers are served by their own threads as a
//! `multipart/x-mixed-replace` stream, so a slow viewer only delays itself:
//! - the frame store lock is held for a copy, never across socket I/O
//! - wake signals coalesce, a viewer that falls behind skips to the latest frame
//! - shutdown closes every wake signal and shuts every viewer socket down
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use uvc_mjpeg_server::session::{CameraSession, ModeSelection, SessionConfig};
//! use uvc_mjpeg_server::source::ReplaySource;
//!
//! let source = Arc::new(ReplaySource::from_dir("frames", 30).unwrap());
//! let mut session = CameraSession::new("replay", source, SessionConfig::default());
//! let addr = session.start(ModeSelection::First).unwrap();
//! println!("streaming on http://{addr}/");
//! ```

pub mod config;
pub mod frame;
pub mod hub;
pub mod ingest;
pub mod registry;
pub mod server;
pub mod session;
pub mod source;
pub mod wake;

// Re-exports for convenience
pub use config::{CameraConfig, Config, ConfigError};
pub use frame::{FrameStore, FrameStoreError};
pub use hub::{CameraHub, SessionInfo};
pub use ingest::{IngestLoop, IngestSnapshot, IngestStats};
pub use registry::{ClientHandle, ClientRegistry};
pub use server::{ListenerConfig, MjpegServer, ServerError, StreamerStats};
pub use session::{CameraSession, ModeSelection, SessionConfig, SessionError, SessionState, SessionStats};
pub use source::{CameraMode, FrameSource, ReplaySource, ScriptedSource, SourceError};
pub use wake::{Wake, WakeSignal};
