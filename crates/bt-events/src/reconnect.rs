//! The publisher/subscriber's shared reconnect state machine:
//! `Disconnected -> Connecting -> Connected -> Closing`. Only the
//! `Connecting` and `Closing` transitions are guarded by the instance
//! mutex — `Connected`/`Disconnected` are plain atomic reads so `publish`
//! never blocks behind the reconnect loop's lock.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Closing,
        }
    }
}

/// Lock-free state cell. The reconnect loop is the only writer during
/// `Connecting`/`Closing`; `publish` only ever reads.
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Exponential backoff bounded by `max`, doubling from `initial` each call.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: std::time::Duration,
    max: std::time::Duration,
    initial: std::time::Duration,
}

impl Backoff {
    pub fn new(initial: std::time::Duration, max: std::time::Duration) -> Self {
        Self { current: initial, max, initial }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Returns the delay to sleep before the next attempt, then advances it.
    pub fn next_delay(&mut self) -> std::time::Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_until_capped() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(400));
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn state_cell_round_trips() {
        let cell = StateCell::new(ConnectionState::Disconnected);
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        cell.set(ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Connected);
    }
}
