//! Scripted in-memory transport for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{TokenError, TransportError};
use crate::token::{SecurityToken, StaticTokenProvider, TokenProvider};
use crate::transport::{ConnectRequest, ControlSocket, Frame, RelayedStream, Transport};

pub(crate) fn test_token_provider() -> Arc<dyn TokenProvider> {
    Arc::new(StaticTokenProvider::new(
        "SharedAccessSignature sr=test",
        Duration::from_secs(3600),
    ))
}

/// Issues `token-1`, `token-2`, ... each valid for `lifetime`.
pub(crate) fn counting_token_provider(lifetime: Duration) -> Arc<dyn TokenProvider> {
    Arc::new(CountingProvider {
        calls: AtomicUsize::new(0),
        lifetime,
    })
}

struct CountingProvider {
    calls: AtomicUsize,
    lifetime: Duration,
}

impl TokenProvider for CountingProvider {
    fn get_token<'a>(
        &'a self,
        audience: &'a str,
        _valid_for: Duration,
    ) -> BoxFuture<'a, Result<SecurityToken, TokenError>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let token = SecurityToken {
            token: format!("token-{n}"),
            audience: audience.to_string(),
            expires_at: SystemTime::now() + self.lifetime,
        };
        async move { Ok(token) }.boxed()
    }
}

#[derive(Default)]
struct Record {
    hold: bool,
    connects: VecDeque<Result<(), TransportError>>,
    requests: Vec<ConnectRequest>,
    accepted: Vec<String>,
    rejected: Vec<(String, u16, String)>,
    streams: Vec<(String, Arc<AtomicBool>)>,
}

/// Transport whose sockets are driven from the test through [`MockPeer`].
pub(crate) struct MockTransport {
    record: Mutex<Record>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockTransport {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            record: Mutex::new(Record::default()),
            peers,
        });
        (transport, rx)
    }

    /// Queues the outcome of the next connect. Unscripted connects succeed.
    pub(crate) fn script_connect(&self, outcome: Result<(), TransportError>) {
        self.record.lock().unwrap().connects.push_back(outcome);
    }

    /// Makes every following connect hang until cancelled.
    pub(crate) fn hold_connects(&self, hold: bool) {
        self.record.lock().unwrap().hold = hold;
    }

    pub(crate) fn requests(&self) -> Vec<ConnectRequest> {
        self.record.lock().unwrap().requests.clone()
    }

    pub(crate) fn accepted(&self) -> Vec<String> {
        self.record.lock().unwrap().accepted.clone()
    }

    pub(crate) fn rejected(&self) -> Vec<(String, u16, String)> {
        self.record.lock().unwrap().rejected.clone()
    }

    /// Addresses of accepted streams that were aborted.
    pub(crate) fn aborted_streams(&self) -> Vec<String> {
        self.record
            .lock()
            .unwrap()
            .streams
            .iter()
            .filter(|(_, aborted)| aborted.load(Ordering::SeqCst))
            .map(|(address, _)| address.clone())
            .collect()
    }
}

impl Transport for MockTransport {
    type Socket = MockSocket;
    type Stream = MockStream;

    async fn connect(&self, request: ConnectRequest) -> Result<MockSocket, TransportError> {
        let (hold, outcome) = {
            let mut record = self.record.lock().unwrap();
            record.requests.push(request);
            (record.hold, record.connects.pop_front().unwrap_or(Ok(())))
        };
        if hold {
            std::future::pending::<()>().await;
        }
        outcome?;

        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let shared = Arc::new(PeerState {
            echo_close: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            failed_sends: AtomicUsize::new(0),
            close_output_code: Mutex::new(None),
            closed: AtomicBool::new(false),
            wire: Mutex::new(Vec::new()),
        });
        let aborted = CancellationToken::new();

        let _ = self.peers.send(MockPeer {
            incoming: incoming_tx.clone(),
            sent,
            shared: shared.clone(),
            aborted: aborted.clone(),
        });
        Ok(MockSocket {
            incoming: tokio::sync::Mutex::new(incoming),
            incoming_tx,
            sent: sent_tx,
            shared,
            aborted,
        })
    }

    async fn accept(
        &self,
        rendezvous_address: &str,
        _buffer_size: usize,
    ) -> Result<MockStream, TransportError> {
        let aborted = Arc::new(AtomicBool::new(false));
        let mut record = self.record.lock().unwrap();
        record.accepted.push(rendezvous_address.to_string());
        record
            .streams
            .push((rendezvous_address.to_string(), aborted.clone()));
        Ok(MockStream {
            address: rendezvous_address.to_string(),
            aborted,
        })
    }

    async fn reject(
        &self,
        rendezvous_address: &str,
        status_code: u16,
        status_description: &str,
    ) -> Result<(), TransportError> {
        self.record.lock().unwrap().rejected.push((
            rendezvous_address.to_string(),
            status_code,
            status_description.to_string(),
        ));
        Ok(())
    }
}

struct PeerState {
    echo_close: AtomicBool,
    fail_sends: AtomicBool,
    failed_sends: AtomicUsize,
    close_output_code: Mutex<Option<u16>>,
    closed: AtomicBool,
    wire: Mutex<Vec<u8>>,
}

/// Relay side of a [`MockSocket`].
pub(crate) struct MockPeer {
    incoming: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    sent: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<PeerState>,
    aborted: CancellationToken,
}

impl MockPeer {
    pub(crate) fn push(&self, frame: Frame) {
        let _ = self.incoming.send(Ok(frame));
    }

    /// Makes the next read fail.
    pub(crate) fn fail(&self, error: TransportError) {
        let _ = self.incoming.send(Err(error));
    }

    /// Whether `close_output` is answered with a close frame. Defaults to true.
    pub(crate) fn set_echo_close(&self, echo: bool) {
        self.shared.echo_close.store(echo, Ordering::SeqCst);
    }

    /// Makes every send fail until switched off. The socket stays readable.
    pub(crate) fn set_fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn failed_sends(&self) -> usize {
        self.shared.failed_sends.load(Ordering::SeqCst)
    }

    pub(crate) async fn next_sent(&mut self) -> Option<Vec<u8>> {
        self.sent.recv().await
    }

    /// Every byte written to the socket, in write order.
    pub(crate) fn wire(&self) -> Vec<u8> {
        self.shared.wire.lock().unwrap().clone()
    }

    pub(crate) fn close_output_code(&self) -> Option<u16> {
        *self.shared.close_output_code.lock().unwrap()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.is_cancelled()
    }
}

pub(crate) struct MockSocket {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Frame, TransportError>>>,
    incoming_tx: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    sent: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<PeerState>,
    aborted: CancellationToken,
}

impl ControlSocket for MockSocket {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.aborted.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            self.shared.failed_sends.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::WebSocket("broken pipe".into()));
        }
        // Byte at a time with yields, so unserialized writers would interleave.
        for byte in &bytes {
            self.shared.wire.lock().unwrap().push(*byte);
            tokio::task::yield_now().await;
        }
        let _ = self.sent.send(bytes);
        Ok(())
    }

    async fn receive(&self) -> Result<Frame, TransportError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.aborted.cancelled() => Err(TransportError::Aborted),
            frame = incoming.recv() => frame.unwrap_or(Err(TransportError::Closed)),
        }
    }

    async fn close_output(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.aborted.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        *self.shared.close_output_code.lock().unwrap() = Some(code);
        if self.shared.echo_close.load(Ordering::SeqCst) {
            let _ = self.incoming_tx.send(Ok(Frame::Close {
                code,
                reason: reason.to_string(),
            }));
        }
        Ok(())
    }

    async fn close(&self, _code: u16, _reason: &str) -> Result<(), TransportError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self) {
        self.aborted.cancel();
    }
}

pub(crate) struct MockStream {
    pub(crate) address: String,
    aborted: Arc<AtomicBool>,
}

impl RelayedStream for MockStream {
    fn abort(self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}
