//! Client registry
//!
//! Holds one wake signal per connected client. The ingest loop iterates it to
//! broadcast "new frame"; the server closes it on shutdown. Entries are owned
//! through [`ClientHandle`], which removes its entry when dropped, so a client
//! that disconnects never leaves a dead signal behind.

use crate::wake::{Wake, WakeSignal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

pub type ClientId = u64;

#[derive(Debug)]
struct Entry {
    peer: Option<SocketAddr>,
    wake: Arc<WakeSignal>,
}

#[derive(Debug, Default)]
struct Inner {
    clients: HashMap<ClientId, Entry>,
    next_id: ClientId,
    closed: bool,
}

/// Set of live client wake signals under a single lock
#[derive(Debug, Default)]
pub struct ClientRegistry {
    inner: Mutex<Inner>,
}

impl ClientRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a client and returns the only handle to its wake signal.
    ///
    /// The signal starts armed so the newcomer is served the current frame
    /// straight away instead of waiting for the next publish. If the registry
    /// is already closed the signal starts closed.
    pub fn register(self: &Arc<Self>, peer: Option<SocketAddr>) -> ClientHandle {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;

        let wake = Arc::new(WakeSignal::armed());
        if inner.closed {
            wake.close();
        }

        inner.clients.insert(
            id,
            Entry {
                peer,
                wake: Arc::clone(&wake),
            },
        );
        debug!(client_id = id, peer = ?peer, clients = inner.clients.len(), "Client registered");

        ClientHandle {
            id,
            wake,
            registry: Arc::clone(self),
        }
    }

    fn remove(&self, id: ClientId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.clients.remove(&id) {
            debug!(client_id = id, peer = ?entry.peer, clients = inner.clients.len(), "Client unregistered");
        }
    }

    /// Notifies every registered client. Returns how many were notified.
    pub fn wake_all(&self) -> usize {
        let inner = self.inner.lock();
        for entry in inner.clients.values() {
            entry.wake.notify();
        }
        inner.clients.len()
    }

    /// Closes every signal, current and future. Blocked streamers return
    /// [`Wake::Closed`] and exit.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for entry in inner.clients.values() {
            entry.wake.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn clients(&self) -> Vec<(ClientId, Option<SocketAddr>)> {
        let mut clients: Vec<_> = self
            .inner
            .lock()
            .clients
            .iter()
            .map(|(id, entry)| (*id, entry.peer))
            .collect();
        clients.sort_by_key(|(id, _)| *id);
        clients
    }
}

/// Exclusive handle to one client's registry entry.
///
/// Not `Clone`: exactly one streamer consumes a given wake signal. Dropping
/// the handle unregisters the client.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    wake: Arc<WakeSignal>,
    registry: Arc<ClientRegistry>,
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn wait(&self) -> Wake {
        self.wake.wait()
    }

    #[cfg(test)]
    pub(crate) fn try_wait(&self) -> Option<Wake> {
        self.wake.try_wait()
    }

    pub fn is_closed(&self) -> bool {
        self.wake.is_closed()
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
