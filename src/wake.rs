//! Single-slot coalescing wake signal
//!
//! `notify` sets a flag; `wait` clears it. Any number of notifications
//! between two waits collapse into one, so a slow consumer only ever sees
//! "something new happened", never a backlog. `close` is sticky and wins
//! over a pending notification.

use parking_lot::{Condvar, Mutex};

/// Outcome of waiting on a [`WakeSignal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// At least one notification arrived since the last wait
    Notified,
    /// The signal was closed; no further notifications will be delivered
    Closed,
}

#[derive(Debug, Default)]
struct WakeState {
    pending: bool,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct WakeSignal {
    state: Mutex<WakeState>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signal with a notification already pending.
    pub fn armed() -> Self {
        let signal = Self::new();
        signal.notify();
        signal
    }

    pub fn notify(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.pending = true;
        self.cond.notify_one();
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending = false;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Blocks until notified or closed.
    pub fn wait(&self) -> Wake {
        let mut state = self.state.lock();
        loop {
            if let Some(wake) = Self::take(&mut state) {
                return wake;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Consumes a pending notification without blocking.
    pub fn try_wait(&self) -> Option<Wake> {
        Self::take(&mut self.state.lock())
    }

    fn take(state: &mut WakeState) -> Option<Wake> {
        if state.closed {
            Some(Wake::Closed)
        } else if state.pending {
            state.pending = false;
            Some(Wake::Notified)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_notifications_coalesce() {
        let signal = WakeSignal::new();
        for _ in 0..5 {
            signal.notify();
        }
        assert_eq!(signal.try_wait(), Some(Wake::Notified));
        assert_eq!(signal.try_wait(), None);
    }

    #[test]
    fn test_armed_signal() {
        let signal = WakeSignal::armed();
        assert_eq!(signal.wait(), Wake::Notified);
        assert_eq!(signal.try_wait(), None);
    }

    #[test]
    fn test_close_wins_over_pending() {
        let signal = WakeSignal::new();
        signal.notify();
        signal.close();
        assert_eq!(signal.wait(), Wake::Closed);
        // sticky
        assert_eq!(signal.wait(), Wake::Closed);

        signal.notify();
        assert_eq!(signal.try_wait(), Some(Wake::Closed));
    }

    #[test]
    fn test_blocked_waiter_is_woken() {
        let signal = Arc::new(WakeSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };

        thread::sleep(Duration::from_millis(20));
        signal.notify();
        assert_eq!(waiter.join().unwrap(), Wake::Notified);
    }

    #[test]
    fn test_close_releases_blocked_waiter() {
        let signal = Arc::new(WakeSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };

        thread::sleep(Duration::from_millis(20));
        signal.close();
        assert_eq!(waiter.join().unwrap(), Wake::Closed);
    }
}
