//! Listener side of a relay hybrid connection.
//!
//! A [`Listener`] keeps a self-healing control channel to the relay, turns
//! accept notifications into relayed connections and hands them out through
//! [`Listener::accept_connection`].

pub mod backoff;
mod control;
mod deadline;
pub mod error;
pub mod listener;
mod pumps;
pub mod queue;
pub mod rendezvous;
pub mod token;
pub mod transport;
pub mod types;
pub mod ws_transport;

#[cfg(test)]
mod testing;

// Re-export primary types for convenience.
pub use error::{ListenerError, TokenError, TransportError};
pub use listener::Listener;
pub use queue::{Dispatch, HandoffQueue};
pub use rendezvous::{AcceptHandler, BoxError, RendezvousContext, RendezvousResponse};
pub use token::{SecurityToken, StaticTokenProvider, TokenProvider};
pub use transport::{ConnectRequest, ControlSocket, Frame, RelayedStream, Transport};
pub use types::{ConnectionStatus, ListenerOptions, ReconnectPolicy, StatusEvent, always_reconnect};
pub use ws_transport::{WsControlSocket, WsRelayedStream, WsTransport};
