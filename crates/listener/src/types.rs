//! Public types for the listener.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tunnelrelay_protocol::constants::{
    DEFAULT_CONNECTION_BUFFER_SIZE, DEFAULT_OPERATION_TIMEOUT, DEFAULT_TOKEN_VALIDITY, USER_AGENT,
};

use crate::error::ListenerError;

/// Control-channel status transitions, mirrored at the listener level.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// The channel was lost and a reconnect is about to start.
    Connecting,
    /// The channel is connected and registered with the relay.
    Online,
    /// The channel is down. Carries the error that took it down, if any.
    Offline { last_error: Option<ListenerError> },
}

/// Snapshot of the control-channel status.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    pub is_online: bool,
    pub last_error: Option<ListenerError>,
}

/// Decides whether the control connection reconnects after losing the
/// channel with the given error.
pub type ReconnectPolicy = Arc<dyn Fn(&ListenerError) -> bool + Send + Sync>;

/// Policy that reconnects after every disconnect.
pub fn always_reconnect() -> ReconnectPolicy {
    Arc::new(|_| true)
}

/// Listener configuration. Frozen once the listener is opened.
#[derive(Clone)]
pub struct ListenerOptions {
    /// Buffer size of the control channel; also the largest accepted command.
    pub connection_buffer_size: usize,
    /// Deadline applied by `open()` and `close()`.
    pub operation_timeout: Duration,
    /// Validity requested for each listener token.
    pub token_validity: Duration,
    /// Value of the `User-Agent` header on the control channel.
    pub user_agent: String,
    pub reconnect_policy: ReconnectPolicy,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            connection_buffer_size: DEFAULT_CONNECTION_BUFFER_SIZE,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            token_validity: DEFAULT_TOKEN_VALIDITY,
            user_agent: USER_AGENT.to_string(),
            reconnect_policy: always_reconnect(),
        }
    }
}

impl fmt::Debug for ListenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerOptions")
            .field("connection_buffer_size", &self.connection_buffer_size)
            .field("operation_timeout", &self.operation_timeout)
            .field("token_validity", &self.token_validity)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}
