// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a single broker connection attempt.
///
/// Transitions: `Disconnected -> Connecting -> Connected -> Disconnecting ->
/// Disconnected`. Only two loops ever write this: the Supervisor (`Client`, on
/// connect/disconnect) and the Reader (on an unexpected transport loss, the one case
/// where the Supervisor is not already the one driving the transition). Every other
/// loop only reads it to decide whether to keep running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl ConnectionState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

/// Shared, lock-free cell holding the current `ConnectionState`.
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}

impl StateCell {
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[must_use]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disconnected() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        assert!(!cell.is_connected());
    }

    #[test]
    fn test_set_then_get_round_trips() {
        let cell = StateCell::default();
        cell.set(ConnectionState::Connected);
        assert!(cell.is_connected());
        cell.set(ConnectionState::Disconnecting);
        assert_eq!(cell.get(), ConnectionState::Disconnecting);
    }
}
