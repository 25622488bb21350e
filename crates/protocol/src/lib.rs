pub mod command;
pub mod constants;
pub mod error;
pub mod tracking;
pub mod uri;

// Re-export primary types for convenience.
pub use command::{AcceptCommand, Command, ListenerCommand, RemoteEndpoint, RenewTokenCommand};
pub use error::ProtocolError;
pub use tracking::TrackingContext;
