//! WebSocket transport built on tokio-tungstenite.
//!
//! The control channel carries one command per binary message. Text messages
//! are accepted too. Rendezvous connections are plain WebSocket connections
//! to the one-time address the relay hands out.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use tunnelrelay_protocol::uri::rejection_uri;

use crate::error::TransportError;
use crate::transport::{ConnectRequest, ControlSocket, Frame, RelayedStream, Transport};

/// Close code reported when the peer's close frame carried no status.
const CLOSE_NO_STATUS: u16 = 1005;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Http(response) => TransportError::Rejected {
                status: response.status().as_u16(),
                reason: response
                    .status()
                    .canonical_reason()
                    .unwrap_or_default()
                    .to_string(),
            },
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::Closed
            }
            tungstenite::Error::Url(e) => TransportError::InvalidRequest(e.to_string()),
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

/// Errors that only say the close handshake already happened.
fn is_closed_error(e: &tungstenite::Error) -> bool {
    matches!(
        e,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(tungstenite::error::ProtocolError::SendAfterClosing)
    )
}

fn control_config(buffer_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.read_buffer_size = buffer_size;
    config.write_buffer_size = buffer_size;
    config.max_message_size = Some(buffer_size);
    config.max_frame_size = Some(buffer_size);
    config
}

fn stream_config(buffer_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.read_buffer_size = buffer_size;
    config.write_buffer_size = buffer_size;
    config
}

/// tokio-tungstenite implementation of [`Transport`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    type Socket = WsControlSocket;
    type Stream = WsRelayedStream;

    async fn connect(&self, request: ConnectRequest) -> Result<WsControlSocket, TransportError> {
        let mut ws_request = request.uri.as_str().into_client_request()?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            ws_request.headers_mut().insert(name, value);
        }

        let (ws, response) = tokio_tungstenite::connect_async_with_config(
            ws_request,
            Some(control_config(request.buffer_size)),
            true,
        )
        .await?;
        debug!(status = %response.status(), "control channel upgraded");
        Ok(WsControlSocket::new(ws))
    }

    async fn accept(
        &self,
        rendezvous_address: &str,
        buffer_size: usize,
    ) -> Result<WsRelayedStream, TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async_with_config(
            rendezvous_address,
            Some(stream_config(buffer_size)),
            true,
        )
        .await?;
        Ok(WsRelayedStream { inner: ws })
    }

    async fn reject(
        &self,
        rendezvous_address: &str,
        status_code: u16,
        status_description: &str,
    ) -> Result<(), TransportError> {
        let uri = rejection_uri(rendezvous_address, status_code, status_description)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        match tokio_tungstenite::connect_async(uri.as_str()).await {
            Ok((mut ws, _)) => {
                let _ = ws.close(None).await;
                Ok(())
            }
            // The relay answers a rejection with a non-upgrade response.
            Err(tungstenite::Error::Http(response)) => {
                trace!(status = %response.status(), "rendezvous rejected");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Control channel over a WebSocket.
///
/// Reading and writing use separate halves so the receive pump never blocks
/// senders.
pub struct WsControlSocket {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    aborted: CancellationToken,
}

impl WsControlSocket {
    fn new(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            aborted: CancellationToken::new(),
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), tungstenite::Error> {
        let mut sink = self.sink.lock().await;
        tokio::select! {
            biased;
            _ = self.aborted.cancelled() => Err(tungstenite::Error::AlreadyClosed),
            result = sink.send(message) => result,
        }
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

impl ControlSocket for WsControlSocket {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.aborted.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        self.send_message(Message::Binary(bytes.into()))
            .await
            .map_err(Into::into)
    }

    async fn receive(&self) -> Result<Frame, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.aborted.cancelled() => return Err(TransportError::Aborted),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(Message::Binary(data))) => return Ok(Frame::Data(data.to_vec())),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Frame::Data(text.as_bytes().to_vec()));
                }
                Some(Ok(Message::Close(frame))) => {
                    return Ok(match frame {
                        Some(f) => Frame::Close {
                            code: u16::from(f.code),
                            reason: f.reason.to_string(),
                        },
                        None => Frame::Close {
                            code: CLOSE_NO_STATUS,
                            reason: String::new(),
                        },
                    });
                }
                Some(Ok(_)) => {
                    trace!("control frame");
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(TransportError::Closed),
            }
        }
    }

    async fn close_output(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        match self.send_message(close_message(code, reason)).await {
            Ok(()) => Ok(()),
            Err(e) if is_closed_error(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.close_output(code, reason).await?;
        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(()) => Ok(()),
            Err(e) if is_closed_error(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn abort(&self) {
        self.aborted.cancel();
    }
}

/// An accepted rendezvous connection.
pub struct WsRelayedStream {
    inner: WsStream,
}

impl WsRelayedStream {
    pub fn get_mut(&mut self) -> &mut WebSocketStream<MaybeTlsStream<TcpStream>> {
        &mut self.inner
    }

    pub fn into_inner(self) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
        self.inner
    }
}

impl RelayedStream for WsRelayedStream {
    fn abort(self) {
        // Dropping the socket closes it without a handshake.
        drop(self.inner);
    }
}
