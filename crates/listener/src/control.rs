//! Control connection to the relay.
//!
//! Owns the control channel, the reconnect backoff and the online/offline
//! state. At most one connect attempt is in flight at a time: every caller
//! that needs a socket awaits the same shared attempt. The receive pump and
//! the token renewal pump run as background tasks once [`open`] succeeds.
//!
//! [`open`]: ControlConnection::open

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture, Shared};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use tunnelrelay_protocol::constants::{
    AUTHORIZATION_HEADER, CLOSE_NORMAL, CLOSE_NORMAL_REASON, USER_AGENT_HEADER,
};
use tunnelrelay_protocol::uri::listen_uri;
use tunnelrelay_protocol::{Command, TrackingContext};

use crate::backoff::ConnectBackoff;
use crate::error::ListenerError;
use crate::pumps;
use crate::token::{TokenProvider, TokenRenewer};
use crate::transport::{ConnectRequest, ControlSocket, Transport};
use crate::types::{ConnectionStatus, ListenerOptions, StatusEvent};

/// Receives the raw payload of every data frame on the control channel.
pub(crate) type CommandHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// A connected control socket, tagged with the attempt that produced it.
pub(crate) struct Connected<S> {
    pub(crate) attempt: u64,
    pub(crate) socket: Arc<S>,
}

impl<S> Clone for Connected<S> {
    fn clone(&self) -> Self {
        Self {
            attempt: self.attempt,
            socket: self.socket.clone(),
        }
    }
}

pub(crate) type ConnectFuture<S> = Shared<BoxFuture<'static, Result<Connected<S>, ListenerError>>>;

struct ConnectAttempt<S> {
    id: u64,
    cancel: CancellationToken,
    future: ConnectFuture<S>,
}

struct State<S> {
    attempt: Option<ConnectAttempt<S>>,
    next_attempt: u64,
    backoff: ConnectBackoff,
    online: bool,
    last_error: Option<ListenerError>,
    close_called: bool,
}

pub(crate) struct ControlConnection<T: Transport> {
    transport: Arc<T>,
    address: Url,
    tracking: TrackingContext,
    options: ListenerOptions,
    renewer: TokenRenewer,
    on_command: CommandHandler,
    status: broadcast::Sender<StatusEvent>,
    state: Mutex<State<T::Socket>>,
    shutdown: CancellationToken,
    send_lock: tokio::sync::Mutex<()>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> ControlConnection<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        address: Url,
        tracking: TrackingContext,
        options: ListenerOptions,
        token_provider: Arc<dyn TokenProvider>,
        status: broadcast::Sender<StatusEvent>,
        on_command: CommandHandler,
    ) -> Arc<Self> {
        let renewer = TokenRenewer::new(token_provider, address.as_str(), options.token_validity);
        Arc::new(Self {
            transport,
            address,
            tracking,
            options,
            renewer,
            on_command,
            status,
            state: Mutex::new(State {
                attempt: None,
                next_attempt: 0,
                backoff: ConnectBackoff::new(),
                online: false,
                last_error: None,
                close_called: false,
            }),
            shutdown: CancellationToken::new(),
            send_lock: tokio::sync::Mutex::new(()),
            pumps: Mutex::new(Vec::new()),
        })
    }

    /// Connects now and starts the background pumps.
    ///
    /// A failed first connect is surfaced to the caller and the half-open
    /// attempt is aborted.
    pub(crate) async fn open(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<(), ListenerError> {
        let attempt = self.ensure_connect();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ListenerError::Cancelled),
            result = attempt.clone() => result,
        };

        match result {
            Ok(connected) => {
                let receive = tokio::spawn(pumps::receive::receive_pump(
                    self.clone(),
                    connected,
                ));
                let renew = tokio::spawn(pumps::renew::renew_pump(
                    self.clone(),
                    self.renewer.subscribe(),
                ));
                lock(&self.pumps).extend([receive, renew]);
                Ok(())
            }
            Err(e) => {
                warn!(listener = %self.tracking, error = %e, "failed to open control connection");
                self.abort_attempt();
                lock(&self.state).last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Closes the control channel. Idempotent.
    ///
    /// Sends a normal close frame on the live socket, if any, then waits for
    /// the receive pump to see the relay's reply and exit.
    pub(crate) async fn close(&self, cancel: &CancellationToken) -> Result<(), ListenerError> {
        let attempt = {
            let mut state = lock(&self.state);
            if state.close_called {
                return Ok(());
            }
            state.close_called = true;
            state.attempt.take()
        };

        info!(listener = %self.tracking, "closing control connection");
        self.renewer.close();
        self.shutdown.cancel();

        if let Some(attempt) = attempt {
            attempt.cancel.cancel();
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ListenerError::Cancelled),
                result = attempt.future => result,
            };
            if let Ok(connected) = connected
                && let Err(e) = connected
                    .socket
                    .close_output(CLOSE_NORMAL, CLOSE_NORMAL_REASON)
                    .await
            {
                warn!(listener = %self.tracking, error = %e, "failed to send close frame");
            }
        }

        let handles = std::mem::take(&mut *lock(&self.pumps));
        for handle in handles {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ListenerError::Cancelled),
                _ = handle => {}
            }
        }
        Ok(())
    }

    /// Sends a command, connecting first if needed. Sends never interleave.
    pub(crate) async fn send_command(
        self: &Arc<Self>,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<(), ListenerError> {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ListenerError::Cancelled),
            result = self.ensure_connect() => result?,
        };
        let bytes = command.encode()?;

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ListenerError::Cancelled),
            guard = self.send_lock.lock() => guard,
        };
        debug!(listener = %self.tracking, command = command.kind(), "sending command");
        connected
            .socket
            .send(bytes)
            .await
            .map_err(ListenerError::connection_lost)
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        let state = lock(&self.state);
        ConnectionStatus {
            is_online: state.online,
            last_error: state.last_error.clone(),
        }
    }

    pub(crate) fn tracking(&self) -> &TrackingContext {
        &self.tracking
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn close_requested(&self) -> bool {
        lock(&self.state).close_called
    }

    /// Stops background work and drops the socket without a close handshake.
    pub(crate) fn abort(&self) {
        lock(&self.state).close_called = true;
        self.renewer.close();
        self.shutdown.cancel();
        self.abort_attempt();
    }

    pub(crate) fn dispatch(&self, payload: &[u8]) {
        (self.on_command)(payload);
    }

    #[cfg(test)]
    pub(crate) fn backoff_index(&self) -> Option<usize> {
        lock(&self.state).backoff.index()
    }

    /// Returns the current connect attempt, starting a new one if there is
    /// none or the last one failed.
    pub(crate) fn ensure_connect(self: &Arc<Self>) -> ConnectFuture<T::Socket> {
        let mut state = lock(&self.state);
        if state.close_called {
            return future::ready(Err(ListenerError::Closed)).boxed().shared();
        }
        if let Some(attempt) = &state.attempt
            && !matches!(attempt.future.peek(), Some(Err(_)))
        {
            return attempt.future.clone();
        }

        let id = state.next_attempt;
        state.next_attempt += 1;
        let delay = state.backoff.delay();
        let cancel = self.shutdown.child_token();

        let task = tokio::spawn(self.clone().connect(id, delay, cancel.clone()));
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(ListenerError::connection_lost(e)),
            }
        }
        .boxed()
        .shared();

        state.attempt = Some(ConnectAttempt {
            id,
            cancel,
            future: future.clone(),
        });
        future
    }

    async fn connect(
        self: Arc<Self>,
        attempt: u64,
        delay: Duration,
        cancel: CancellationToken,
    ) -> Result<Connected<T::Socket>, ListenerError> {
        if !delay.is_zero() {
            debug!(
                listener = %self.tracking,
                delay_secs = delay.as_secs(),
                "waiting before connect"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ListenerError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ListenerError::Cancelled),
            token = self.renewer.get_token() => token?,
        };

        // Reconnects reuse the id without the relay's role suffix.
        let uri = listen_uri(&self.address, self.tracking.base_tracking_id())?;
        let request = ConnectRequest {
            uri,
            headers: vec![
                (AUTHORIZATION_HEADER.to_string(), token.token),
                (USER_AGENT_HEADER.to_string(), self.options.user_agent.clone()),
            ],
            buffer_size: self.options.connection_buffer_size,
        };

        info!(listener = %self.tracking, attempt, "connecting control channel");
        let socket = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ListenerError::Cancelled),
            socket = self.transport.connect(request) => {
                socket.map_err(ListenerError::connection_lost)?
            }
        };

        if !self.on_online() {
            socket.abort();
            return Err(ListenerError::Closed);
        }
        Ok(Connected {
            attempt,
            socket: Arc::new(socket),
        })
    }

    /// Drops the current attempt and aborts its socket, if it produced one.
    fn abort_attempt(&self) {
        let Some(attempt) = lock(&self.state).attempt.take() else {
            return;
        };
        attempt.cancel.cancel();
        if let Some(Ok(connected)) = attempt.future.peek() {
            connected.socket.abort();
        }
    }

    /// Forgets the socket of `attempt` so the next caller reconnects.
    pub(crate) fn invalidate(&self, attempt: u64) {
        let mut state = lock(&self.state);
        if state.attempt.as_ref().is_some_and(|a| a.id == attempt) {
            state.attempt = None;
        }
    }

    /// Returns `false` if close was requested while connecting.
    fn on_online(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if state.close_called {
                return false;
            }
            state.backoff.reset();
            if state.online {
                return true;
            }
            state.online = true;
            state.last_error = None;
        }
        info!(listener = %self.tracking, "listener online");
        let _ = self.status.send(StatusEvent::Online);
        true
    }

    /// Records an unexpected disconnect. Returns whether to reconnect.
    pub(crate) fn on_disconnect(&self, error: ListenerError) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        {
            let mut state = lock(&self.state);
            state.online = false;
            state.last_error = Some(error.clone());
            state.backoff.advance();
        }

        warn!(listener = %self.tracking, error = %error, "control channel lost");
        let _ = self.status.send(StatusEvent::Offline {
            last_error: Some(error.clone()),
        });

        let reconnect = (self.options.reconnect_policy)(&error);
        if reconnect {
            let _ = self.status.send(StatusEvent::Connecting);
        }
        reconnect
    }

    /// Called once when the receive pump exits.
    pub(crate) fn on_offline(&self) {
        let last_error = {
            let mut state = lock(&self.state);
            if !state.online {
                return;
            }
            state.online = false;
            state.last_error.clone()
        };
        info!(listener = %self.tracking, "listener offline");
        let _ = self.status.send(StatusEvent::Offline { last_error });
    }
}

fn lock<S>(m: &Mutex<S>) -> MutexGuard<'_, S> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
