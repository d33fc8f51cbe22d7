//! Camera session lifecycle
//!
//! `Closed -> Opened -> Started -> Stopped`. A session owns everything that
//! exists only while its camera streams: the frame stores, the ingest thread
//! and the HTTP server. A failed start is terminal; the caller discards the
//! session instead of retrying it.

use crate::frame::{CopiedFrame, FrameStore};
use crate::ingest::{IngestLoop, IngestSnapshot, IngestStats, DEFAULT_POLL_INTERVAL};
use crate::registry::ClientRegistry;
use crate::server::{ListenerConfig, MjpegServer, ServerError, StreamerStats};
use crate::source::{usable_modes, CameraMode, Exposure, FrameSource, SourceError, StartParams};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Exposure range accepted by [`CameraSession::set_exposure`], in tenths of
/// a millisecond. `-1` means auto.
pub const EXPOSURE_RANGE: std::ops::RangeInclusive<i32> = -1..=1000;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("permission pending for {0}, open again once granted")]
    PermissionPending(String),

    #[error("{0} advertises no MJPEG modes")]
    NoModes(String),

    #[error("no mode matching {selection:?} on {device}")]
    InvalidSelection {
        device: String,
        selection: ModeSelection,
    },

    #[error("error starting camera {device}: status {code}")]
    StartFailed { device: String, code: i32 },

    #[error("session for {0} is not open")]
    NotOpen(String),

    #[error("session for {0} has been stopped")]
    Stopped(String),

    #[error("no sequential port left for {0}")]
    PortsExhausted(String),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the session had to be torn down because of this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::StartFailed { .. } | SessionError::Server(_) | SessionError::Io(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Closed,
    Opened,
    Started,
    Stopped,
}

/// Which advertised mode to start with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSelection {
    First,
    Index(usize),
    Exact { width: u32, height: u32, fps: u32 },
}

/// Per-session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub listener: ListenerConfig,
    pub poll_interval: Duration,
    pub buffer_count: u32,
    pub bandwidth: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            buffer_count: 2,
            bandwidth: 1.0,
        }
    }
}

/// Combined statistics of a started session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub ingest: IngestSnapshot,
    pub server: StreamerStats,
}

/// Resources that exist only while the camera streams
struct ActiveStream {
    mode: CameraMode,
    running: Arc<AtomicBool>,
    preview: Arc<FrameStore>,
    server: MjpegServer,
    ingest: Option<JoinHandle<()>>,
    ingest_stats: Arc<IngestStats>,
}

pub struct CameraSession {
    device: String,
    source: Arc<dyn FrameSource>,
    config: SessionConfig,
    state: SessionState,
    modes: Vec<CameraMode>,
    exposure: i32,
    active: Option<ActiveStream>,
}

impl CameraSession {
    pub fn new(device: impl Into<String>, source: Arc<dyn FrameSource>, config: SessionConfig) -> Self {
        Self {
            device: device.into(),
            source,
            config,
            state: SessionState::Closed,
            modes: Vec::new(),
            exposure: -1,
            active: None,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// MJPEG modes found by the last successful `open`.
    pub fn modes(&self) -> &[CameraMode] {
        &self.modes
    }

    /// Mode the camera was started with.
    pub fn mode(&self) -> Option<CameraMode> {
        self.active.as_ref().map(|a| a.mode)
    }

    /// Port the listener binds when started.
    pub fn configured_port(&self) -> u16 {
        self.config.listener.bind_addr.port()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|a| a.server.local_addr())
    }

    pub fn exposure(&self) -> i32 {
        self.exposure
    }

    /// Reads the device's modes, keeping only MJPEG ones.
    ///
    /// Without permission this asks for it and returns
    /// [`SessionError::PermissionPending`]; call `open` again later. Once
    /// opened, further calls return the cached modes.
    pub fn open(&mut self) -> Result<&[CameraMode], SessionError> {
        match self.state {
            SessionState::Opened | SessionState::Started => return Ok(&self.modes),
            SessionState::Stopped => return Err(SessionError::Stopped(self.device.clone())),
            SessionState::Closed => {}
        }

        if !self.source.has_permission(&self.device) {
            info!(device = %self.device, "Requesting camera permission");
            self.source.request_permission(&self.device);
            return Err(SessionError::PermissionPending(self.device.clone()));
        }

        let descriptors = match self.source.open(&self.device) {
            Ok(descriptors) => descriptors,
            Err(SourceError::PermissionDenied(_)) => {
                self.source.request_permission(&self.device);
                return Err(SessionError::PermissionPending(self.device.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        self.modes = usable_modes(&descriptors);
        self.state = SessionState::Opened;
        info!(
            device = %self.device,
            advertised = descriptors.len(),
            mjpeg = self.modes.len(),
            "Camera opened"
        );

        Ok(&self.modes)
    }

    fn resolve(&self, selection: ModeSelection) -> Result<CameraMode, SessionError> {
        if self.modes.is_empty() {
            return Err(SessionError::NoModes(self.device.clone()));
        }

        let mode = match selection {
            ModeSelection::First => self.modes.first(),
            ModeSelection::Index(i) => self.modes.get(i),
            ModeSelection::Exact { width, height, fps } => self
                .modes
                .iter()
                .find(|m| m.width == width && m.height == height && m.fps == fps),
        };

        mode.copied().ok_or_else(|| SessionError::InvalidSelection {
            device: self.device.clone(),
            selection,
        })
    }

    /// Starts the camera and begins serving it over HTTP.
    ///
    /// Opens first if needed. A non-zero start status, a bind failure or a
    /// thread spawn failure tears the session down for good. Starting an
    /// already started session returns its address.
    pub fn start(&mut self, selection: ModeSelection) -> Result<SocketAddr, SessionError> {
        match self.state {
            SessionState::Started => {
                if let Some(addr) = self.local_addr() {
                    return Ok(addr);
                }
            }
            SessionState::Stopped => return Err(SessionError::Stopped(self.device.clone())),
            SessionState::Closed => {
                self.open()?;
            }
            SessionState::Opened => {}
        }

        let mode = self.resolve(selection)?;
        let params = StartParams {
            width: mode.width,
            height: mode.height,
            fps: mode.fps,
            buffer_count: self.config.buffer_count,
            bandwidth: self.config.bandwidth,
        };

        info!(device = %self.device, mode = %mode, bandwidth = params.bandwidth, "Starting camera");
        let code = self.source.start(&self.device, &params);
        if code != 0 {
            error!(device = %self.device, code, "Error starting camera");
            self.teardown();
            return Err(SessionError::StartFailed {
                device: self.device.clone(),
                code,
            });
        }

        match self.launch(mode) {
            Ok(active) => {
                let addr = active.server.local_addr();
                self.active = Some(active);
                self.state = SessionState::Started;
                info!(device = %self.device, addr = %addr, mode = %mode, "Camera streaming");
                Ok(addr)
            }
            Err(e) => {
                error!(device = %self.device, error = %e, "Failed to launch stream");
                self.teardown();
                Err(e)
            }
        }
    }

    fn launch(&self, mode: CameraMode) -> Result<ActiveStream, SessionError> {
        let capacity = mode.max_frame_bytes();
        let jpeg = Arc::new(FrameStore::with_capacity(capacity));
        let preview = Arc::new(FrameStore::with_capacity(capacity));
        let registry = ClientRegistry::new();
        let running = Arc::new(AtomicBool::new(true));

        let mut server = MjpegServer::start(
            self.config.listener.clone(),
            Arc::clone(&jpeg),
            Arc::clone(&registry),
            Arc::clone(&running),
        )?;

        let ingest = IngestLoop::new(
            self.device.clone(),
            Arc::clone(&self.source),
            jpeg,
            Arc::clone(&preview),
            registry,
        );
        let ingest_stats = ingest.stats();
        let ingest = match ingest.spawn(Arc::clone(&running), self.config.poll_interval) {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                server.stop();
                return Err(e.into());
            }
        };

        Ok(ActiveStream {
            mode,
            running,
            preview,
            server,
            ingest: Some(ingest),
            ingest_stats,
        })
    }

    /// Stops streaming, disconnects every viewer and releases the camera.
    /// Idempotent.
    pub fn stop(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        info!(device = %self.device, "Stopping camera session");
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.running.store(false, Ordering::SeqCst);
            active.server.stop();
            if let Some(ingest) = active.ingest.take() {
                if ingest.join().is_err() {
                    warn!(device = %self.device, "Ingest thread panicked");
                }
            }
        }

        if self.state != SessionState::Closed {
            self.source.close(&self.device);
            debug!(device = %self.device, "Camera released");
        }
        self.state = SessionState::Stopped;
    }

    /// Sets exposure; negative selects auto. Clamped to [`EXPOSURE_RANGE`].
    pub fn set_exposure(&mut self, value: i32) -> Result<(), SessionError> {
        match self.state {
            SessionState::Opened | SessionState::Started => {}
            SessionState::Closed => return Err(SessionError::NotOpen(self.device.clone())),
            SessionState::Stopped => return Err(SessionError::Stopped(self.device.clone())),
        }

        let value = value.clamp(*EXPOSURE_RANGE.start(), *EXPOSURE_RANGE.end());
        self.source
            .set_exposure(&self.device, Exposure::from_value(value))?;
        self.exposure = value;
        debug!(device = %self.device, exposure = value, "Exposure set");
        Ok(())
    }

    /// Shifts exposure by `delta` from the last value set.
    pub fn adjust_exposure(&mut self, delta: i32) -> Result<(), SessionError> {
        self.set_exposure(self.exposure.saturating_add(delta))
    }

    /// Copies the latest raw frame for local preview rendering.
    pub fn copy_preview(&self, dst: &mut Vec<u8>) -> Option<CopiedFrame> {
        self.active.as_ref()?.preview.copy_latest(dst)
    }

    pub fn stats(&self) -> Option<SessionStats> {
        let active = self.active.as_ref()?;
        Some(SessionStats {
            ingest: active.ingest_stats.snapshot(),
            server: active.server.stats(),
        })
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ScriptedSource;
    use std::thread;

    fn config() -> SessionConfig {
        SessionConfig {
            listener: ListenerConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                ..Default::default()
            },
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn session(source: &Arc<ScriptedSource>) -> CameraSession {
        CameraSession::new("cam0", Arc::clone(source) as Arc<dyn FrameSource>, config())
    }

    #[test]
    fn test_open_filters_modes() {
        let source = Arc::new(ScriptedSource::with_modes([
            "4,640,480,30",
            "6,640,480,30",
            "6,1280,720,15",
        ]));
        let mut session = session(&source);

        let modes = session.open().unwrap().to_vec();
        assert_eq!(
            modes,
            vec![CameraMode::mjpeg(640, 480, 30), CameraMode::mjpeg(1280, 720, 15)]
        );
        assert_eq!(session.state(), SessionState::Opened);
    }

    #[test]
    fn test_open_without_permission_must_be_retried() {
        let source = Arc::new(ScriptedSource::new());
        source.set_permitted(false);
        let mut session = session(&source);

        assert!(matches!(session.open(), Err(SessionError::PermissionPending(_))));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(source.permission_requests(), 1);

        source.set_permitted(true);
        assert!(session.open().is_ok());
        assert_eq!(session.state(), SessionState::Opened);
    }

    #[test]
    fn test_start_passes_parameters() {
        let source = Arc::new(ScriptedSource::with_modes(["6,640,480,30", "6,320,240,60"]));
        let mut session = session(&source);

        session
            .start(ModeSelection::Exact {
                width: 320,
                height: 240,
                fps: 60,
            })
            .unwrap();

        let starts = source.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].device, "cam0");
        assert_eq!(
            starts[0].params,
            StartParams {
                width: 320,
                height: 240,
                fps: 60,
                buffer_count: 2,
                bandwidth: 1.0,
            }
        );
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(session.mode(), Some(CameraMode::mjpeg(320, 240, 60)));

        // second start is a no-op
        let addr = session.local_addr().unwrap();
        assert_eq!(session.start(ModeSelection::First).unwrap(), addr);
        assert_eq!(source.starts().len(), 1);
    }

    #[test]
    fn test_failed_start_is_fatal() {
        let source = Arc::new(ScriptedSource::new());
        source.set_start_status(-3);
        let mut session = session(&source);

        let err = session.start(ModeSelection::First).unwrap_err();
        assert!(matches!(err, SessionError::StartFailed { code: -3, .. }));
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(source.closed(), vec!["cam0".to_string()]);
        assert!(session.local_addr().is_none());

        source.set_start_status(0);
        assert!(matches!(
            session.start(ModeSelection::First),
            Err(SessionError::Stopped(_))
        ));
    }

    #[test]
    fn test_invalid_selection() {
        let source = Arc::new(ScriptedSource::new());
        let mut session = session(&source);
        session.open().unwrap();

        assert!(matches!(
            session.start(ModeSelection::Index(5)),
            Err(SessionError::InvalidSelection { .. })
        ));
        assert_eq!(session.state(), SessionState::Opened);
        assert!(source.starts().is_empty());
    }

    #[test]
    fn test_no_modes() {
        let source = Arc::new(ScriptedSource::with_modes(["4,640,480,30"]));
        let mut session = session(&source);
        assert!(matches!(
            session.start(ModeSelection::First),
            Err(SessionError::NoModes(_))
        ));
    }

    #[test]
    fn test_preview_follows_source() {
        let source = Arc::new(ScriptedSource::new());
        let mut session = session(&source);
        session.start(ModeSelection::First).unwrap();

        let id = source.push_empty_frame(Some(b"rgbrgb"));
        let mut dst = Vec::new();
        let mut copied = None;
        for _ in 0..200 {
            copied = session.copy_preview(&mut dst);
            if copied.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(copied, Some(CopiedFrame { frame_id: id, len: 6 }));
        assert_eq!(dst, b"rgbrgb");
    }

    #[test]
    fn test_exposure_commands() {
        let source = Arc::new(ScriptedSource::new());
        let mut session = session(&source);
        assert!(matches!(session.set_exposure(100), Err(SessionError::NotOpen(_))));

        session.open().unwrap();
        session.set_exposure(5000).unwrap();
        assert_eq!(session.exposure(), 1000);
        session.adjust_exposure(-200).unwrap();
        session.set_exposure(-50).unwrap();

        assert_eq!(
            source.exposures(),
            vec![Exposure::Manual(1000), Exposure::Manual(800), Exposure::Auto]
        );
        assert_eq!(session.exposure(), -1);
    }

    #[test]
    fn test_stop_releases_camera_once() {
        let source = Arc::new(ScriptedSource::new());
        let mut session = session(&source);
        session.start(ModeSelection::First).unwrap();

        session.stop();
        session.stop();
        drop(session);

        assert_eq!(source.closed(), vec!["cam0".to_string()]);
    }
}
