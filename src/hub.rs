//! Multi-camera hub
//!
//! Keeps one [`CameraSession`] per device, each on its own port handed out
//! sequentially from a base port. Sessions that fail fatally are dropped
//! from the hub so the device can be selected again.

use crate::session::{
    CameraSession, ModeSelection, SessionConfig, SessionError, SessionState, SessionStats,
};
use crate::source::FrameSource;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Summary of one session in the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub device: String,
    pub port: u16,
    pub state: SessionState,
    pub local_addr: Option<SocketAddr>,
}

struct HubInner {
    sessions: BTreeMap<String, CameraSession>,
    /// `None` once port 65535 has been handed out
    next_port: Option<u16>,
}

pub struct CameraHub {
    source: Arc<dyn FrameSource>,
    template: SessionConfig,
    inner: Mutex<HubInner>,
}

impl CameraHub {
    /// `template.listener.bind_addr` supplies the bind IP and the first port.
    pub fn new(source: Arc<dyn FrameSource>, template: SessionConfig) -> Self {
        let next_port = Some(template.listener.bind_addr.port());
        Self {
            source,
            template,
            inner: Mutex::new(HubInner {
                sessions: BTreeMap::new(),
                next_port,
            }),
        }
    }

    /// Creates a session for `device` if there is none and opens it.
    ///
    /// `port` pins the listener port; otherwise the next sequential port is
    /// used. Returns the port of the (new or existing) session. A pending
    /// permission leaves the session in the hub, so calling `select` again
    /// retries the open.
    pub fn select(&self, device: &str, port: Option<u16>) -> Result<u16, SessionError> {
        self.select_with(device, port, |_| {})
    }

    /// Like [`select`](Self::select), with `configure` adjusting the new
    /// session's settings (buffer count, bandwidth share, ...). Ignored if
    /// the session already exists.
    pub fn select_with(
        &self,
        device: &str,
        port: Option<u16>,
        configure: impl FnOnce(&mut SessionConfig),
    ) -> Result<u16, SessionError> {
        let mut inner = self.inner.lock();

        if !inner.sessions.contains_key(device) {
            let port = match port {
                Some(port) => port,
                None => {
                    let Some(port) = inner.next_port else {
                        return Err(SessionError::PortsExhausted(device.to_string()));
                    };
                    inner.next_port = port.checked_add(1);
                    port
                }
            };

            let mut config = self.template.clone();
            configure(&mut config);
            config.listener.bind_addr.set_port(port);
            let session = CameraSession::new(device, Arc::clone(&self.source), config);
            inner.sessions.insert(device.to_string(), session);
            info!(device, port, "Camera selected");
        }

        let Some(session) = inner.sessions.get_mut(device) else {
            return Err(SessionError::NotOpen(device.to_string()));
        };
        let port = session_port(session);
        session.open()?;
        Ok(port)
    }

    /// Starts a selected device.
    ///
    /// A fatal failure removes the session; the device has to be selected
    /// again.
    pub fn start(&self, device: &str, selection: ModeSelection) -> Result<SocketAddr, SessionError> {
        let mut inner = self.inner.lock();
        let Some(session) = inner.sessions.get_mut(device) else {
            return Err(SessionError::NotOpen(device.to_string()));
        };

        match session.start(selection) {
            Ok(addr) => Ok(addr),
            Err(e) => {
                if e.is_fatal() {
                    warn!(device, error = %e, "Discarding camera session");
                    inner.sessions.remove(device);
                }
                Err(e)
            }
        }
    }

    /// Runs `f` against the session for `device`.
    pub fn with_session<R>(&self, device: &str, f: impl FnOnce(&mut CameraSession) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.sessions.get_mut(device).map(f)
    }

    /// Stops and removes the session for `device`.
    pub fn close(&self, device: &str) -> bool {
        let session = self.inner.lock().sessions.remove(device);
        match session {
            Some(mut session) => {
                session.stop();
                info!(device, "Camera closed");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let sessions = std::mem::take(&mut self.inner.lock().sessions);
        for (_, mut session) in sessions {
            session.stop();
        }
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .lock()
            .sessions
            .values()
            .map(|s| SessionInfo {
                device: s.device().to_string(),
                port: session_port(s),
                state: s.state(),
                local_addr: s.local_addr(),
            })
            .collect()
    }

    /// Statistics of every started session, keyed by device.
    pub fn stats(&self) -> Vec<(String, SessionStats)> {
        self.inner
            .lock()
            .sessions
            .iter()
            .filter_map(|(device, s)| s.stats().map(|stats| (device.clone(), stats)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn session_port(session: &CameraSession) -> u16 {
    session
        .local_addr()
        .map(|addr| addr.port())
        .unwrap_or_else(|| session.configured_port())
}

impl Drop for CameraHub {
    fn drop(&mut self) {
        self.stop_all();
    }
}
