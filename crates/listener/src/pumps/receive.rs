//! Control-channel receive pump.
//!
//! Reads frames from the current socket and forwards data frames to the
//! command handler. A close frame or a read error ends the socket; the
//! reconnect policy then decides whether to connect again.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::control::{Connected, ControlConnection};
use crate::error::ListenerError;
use crate::transport::{ControlSocket, Frame, Transport};

/// How long a closing listener waits for the relay to answer its close frame.
pub(crate) const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How a socket stopped being read.
enum SocketEnd {
    /// The relay answered our close frame, or the grace period ran out.
    Closed,
    /// The channel went away without being asked to.
    Lost(ListenerError),
}

/// Runs until the connection is closed or the reconnect policy gives up.
pub(crate) async fn receive_pump<T: Transport>(
    control: Arc<ControlConnection<T>>,
    connected: Connected<T::Socket>,
) {
    let mut current = Some(connected);

    while !control.shutdown_token().is_cancelled() {
        let connected = match current.take() {
            Some(connected) => connected,
            None => match control.ensure_connect().await {
                Ok(connected) => connected,
                Err(e) => {
                    if control.on_disconnect(e) {
                        continue;
                    }
                    break;
                }
            },
        };

        match read_socket(&control, &connected).await {
            SocketEnd::Closed => break,
            SocketEnd::Lost(e) => {
                control.invalidate(connected.attempt);
                if !control.on_disconnect(e) {
                    break;
                }
            }
        }
    }

    debug!(listener = %control.tracking(), "receive pump stopped");
    control.on_offline();
}

async fn read_socket<T: Transport>(
    control: &ControlConnection<T>,
    connected: &Connected<T::Socket>,
) -> SocketEnd {
    let socket = &connected.socket;
    let shutdown = control.shutdown_token();

    loop {
        let frame = if shutdown.is_cancelled() {
            match tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, socket.receive()).await {
                Ok(frame) => frame,
                Err(_) => {
                    warn!(listener = %control.tracking(), "relay did not answer close, aborting");
                    socket.abort();
                    return SocketEnd::Closed;
                }
            }
        } else {
            tokio::select! {
                biased;
                frame = socket.receive() => frame,
                _ = shutdown.cancelled() => continue,
            }
        };

        match frame {
            Ok(Frame::Data(payload)) => {
                trace!(listener = %control.tracking(), len = payload.len(), "command received");
                control.dispatch(&payload);
            }
            Ok(Frame::Close { code, reason }) => {
                if let Err(e) = socket.close(code, &reason).await {
                    debug!(listener = %control.tracking(), error = %e, "close handshake failed");
                    socket.abort();
                }
                if control.close_requested() {
                    return SocketEnd::Closed;
                }
                return SocketEnd::Lost(ListenerError::ConnectionLost(format!("{code}: {reason}")));
            }
            Err(e) => {
                warn!(listener = %control.tracking(), error = %e, "control channel read failed");
                socket.abort();
                if control.close_requested() {
                    return SocketEnd::Closed;
                }
                return SocketEnd::Lost(ListenerError::connection_lost(e));
            }
        }
    }
}
