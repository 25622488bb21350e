//! Transport contract used by the control connection and the accept pipeline.
//!
//! The listener core never touches a socket library directly. The default
//! implementation is [`WsTransport`](crate::ws_transport::WsTransport).

use std::future::Future;

use url::Url;

use crate::error::TransportError;

/// Parameters for opening a control channel.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub uri: Url,
    pub headers: Vec<(String, String)>,
    /// Upper bound for a single message on the channel.
    pub buffer_size: usize,
}

impl ConnectRequest {
    /// Returns the value of the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A frame read from the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete data message.
    Data(Vec<u8>),
    /// The peer started (or answered) the close handshake.
    Close { code: u16, reason: String },
}

/// Opens control channels and performs rendezvous handshakes.
pub trait Transport: Send + Sync + 'static {
    type Socket: ControlSocket;
    type Stream: RelayedStream;

    /// Opens a control channel.
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> impl Future<Output = Result<Self::Socket, TransportError>> + Send;

    /// Completes a rendezvous and returns the relayed stream.
    fn accept(
        &self,
        rendezvous_address: &str,
        buffer_size: usize,
    ) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;

    /// Declines a rendezvous with an HTTP status code and description.
    fn reject(
        &self,
        rendezvous_address: &str,
        status_code: u16,
        status_description: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// An open control channel.
///
/// `send` and `receive` may run concurrently. Concurrent `send` calls must be
/// serialized by the caller.
pub trait ControlSocket: Send + Sync + 'static {
    /// Writes one complete message.
    fn send(&self, bytes: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Reads the next complete frame.
    fn receive(&self) -> impl Future<Output = Result<Frame, TransportError>> + Send;

    /// Sends a close frame without waiting for the peer's reply.
    fn close_output(
        &self,
        code: u16,
        reason: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Completes the close handshake and releases the channel.
    fn close(
        &self,
        code: u16,
        reason: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Tears the channel down immediately. Pending and future I/O fails.
    fn abort(&self);
}

/// A connection handed to application code after a successful rendezvous.
pub trait RelayedStream: Send + 'static {
    /// Drops the connection without a close handshake.
    fn abort(self);
}
