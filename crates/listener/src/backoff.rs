//! Reconnect backoff for the control connection.

use std::time::Duration;

/// Delays applied before consecutive connect attempts: 0, 1, 2, 5, 10, 30 seconds.
pub const CONNECT_DELAYS: [Duration; 6] = [
    Duration::ZERO,
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// Index into [`CONNECT_DELAYS`].
///
/// `None` means "just went online": the next disconnect moves to index 0, so
/// the first reconnect after a healthy period happens without delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectBackoff {
    index: Option<usize>,
}

impl ConnectBackoff {
    pub fn new() -> Self {
        Self { index: Some(0) }
    }

    /// Delay to wait before the next connect attempt.
    pub fn delay(&self) -> Duration {
        CONNECT_DELAYS[self.index.unwrap_or(0)]
    }

    /// Moves one step along the table after a disconnect. Saturates at the last entry.
    pub fn advance(&mut self) {
        self.index = Some(match self.index {
            None => 0,
            Some(i) => (i + 1).min(CONNECT_DELAYS.len() - 1),
        });
    }

    /// Called once a connect succeeds.
    pub fn reset(&mut self) {
        self.index = None;
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }
}

impl Default for ConnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}
