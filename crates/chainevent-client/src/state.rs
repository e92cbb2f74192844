//! Connection state of the event client.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    /// Transitional: always resolves to `Connected` or back to `Disconnected`.
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Lock-free cell holding a [`ConnectionState`].
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `current` to `new`. On failure returns the actual state.
    pub fn compare_and_set(
        &self,
        current: ConnectionState,
        new: ConnectionState,
    ) -> Result<(), ConnectionState> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    /// Unconditional set, for teardown.
    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for AtomicConnectionState {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn guarded_transitions() {
        let state = AtomicConnectionState::default();
        assert_eq!(state.get(), ConnectionState::Disconnected);

        state
            .compare_and_set(ConnectionState::Disconnected, ConnectionState::Connecting)
            .unwrap();
        assert_eq!(
            state.compare_and_set(ConnectionState::Disconnected, ConnectionState::Connecting),
            Err(ConnectionState::Connecting)
        );
        state
            .compare_and_set(ConnectionState::Connecting, ConnectionState::Connected)
            .unwrap();
        assert_eq!(state.get(), ConnectionState::Connected);

        state.set(ConnectionState::Disconnected);
        assert_eq!(state.get(), ConnectionState::Disconnected);
    }

    #[test]
    fn only_one_connecting_episode() {
        let state = Arc::new(AtomicConnectionState::default());
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if state
                        .compare_and_set(ConnectionState::Disconnected, ConnectionState::Connecting)
                        .is_ok()
                    {
                        winners.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
