//! Public listener: lifecycle, accept pipeline and connection handoff.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use futures_util::FutureExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use tunnelrelay_protocol::uri::parse_listener_address;
use tunnelrelay_protocol::{AcceptCommand, Command, TrackingContext};

use crate::control::{CommandHandler, ControlConnection};
use crate::deadline::Deadline;
use crate::error::ListenerError;
use crate::queue::{Dispatch, HandoffQueue};
use crate::rendezvous::{self, AcceptHandler, BoxError, RendezvousContext};
use crate::token::TokenProvider;
use crate::transport::{RelayedStream, Transport};
use crate::types::{ConnectionStatus, ListenerOptions, StatusEvent};

const STATUS_CHANNEL_CAPACITY: usize = 32;

struct State {
    opened: bool,
    closed: bool,
    options: ListenerOptions,
}

struct Inner<T: Transport> {
    address: Url,
    tracking: TrackingContext,
    transport: Arc<T>,
    token_provider: Arc<dyn TokenProvider>,
    queue: HandoffQueue<T::Stream>,
    state: Mutex<State>,
    accept_handler: RwLock<Option<AcceptHandler>>,
    status: broadcast::Sender<StatusEvent>,
    control: OnceLock<Arc<ControlConnection<T>>>,
}

/// Listens on a relay address and hands out relayed connections.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use tunnelrelay_listener::{Listener, StaticTokenProvider, WsTransport};
/// # async fn run() -> Result<(), tunnelrelay_listener::ListenerError> {
/// let tokens = Arc::new(StaticTokenProvider::new(
///     "SharedAccessSignature ...",
///     Duration::from_secs(3600),
/// ));
/// let listener = Listener::new("sb://contoso.example.net/ep", tokens, WsTransport::new())?;
/// listener.open().await?;
/// while let Some(stream) = listener.accept_connection().await? {
///     // serve `stream`
/// #   drop(stream);
/// }
/// listener.close().await
/// # }
/// ```
pub struct Listener<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Listener<T> {
    /// Creates a listener for an `sb://` address.
    pub fn new(
        address: &str,
        token_provider: Arc<dyn TokenProvider>,
        transport: T,
    ) -> Result<Self, ListenerError> {
        Self::with_transport(address, token_provider, Arc::new(transport))
    }

    /// Like [`Listener::new`], for a transport shared with other code.
    pub fn with_transport(
        address: &str,
        token_provider: Arc<dyn TokenProvider>,
        transport: Arc<T>,
    ) -> Result<Self, ListenerError> {
        let address = parse_listener_address(address)?;
        let tracking = TrackingContext::new(address.as_str());
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                address,
                tracking,
                transport,
                token_provider,
                queue: HandoffQueue::new(),
                state: Mutex::new(State {
                    opened: false,
                    closed: false,
                    options: ListenerOptions::default(),
                }),
                accept_handler: RwLock::new(None),
                status,
                control: OnceLock::new(),
            }),
        })
    }

    pub fn address(&self) -> &Url {
        &self.inner.address
    }

    pub fn tracking_id(&self) -> &str {
        self.inner.tracking.tracking_id()
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn options(&self) -> ListenerOptions {
        self.inner.lock_state().options.clone()
    }

    /// Replaces the configuration. Fails with [`ListenerError::ReadOnly`]
    /// once the listener has been opened.
    pub fn set_options(&self, options: ListenerOptions) -> Result<(), ListenerError> {
        let mut state = self.inner.lock_state();
        if state.opened || state.closed {
            return Err(ListenerError::ReadOnly);
        }
        state.options = options;
        Ok(())
    }

    /// Installs the accept predicate. May be called at any time; each
    /// rendezvous uses the handler current when it arrives.
    pub fn set_accept_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<RendezvousContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, BoxError>> + Send + 'static,
    {
        let handler: AcceptHandler = Arc::new(move |context| handler(context).boxed());
        *self
            .inner
            .accept_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Removes the accept predicate; every rendezvous is accepted.
    pub fn clear_accept_handler(&self) {
        *self
            .inner
            .accept_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Subscribes to `Connecting` / `Online` / `Offline` transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner
            .control
            .get()
            .map(|control| control.status())
            .unwrap_or_default()
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online
    }

    pub fn last_error(&self) -> Option<ListenerError> {
        self.status().last_error
    }

    /// Connects to the relay within the configured operation timeout.
    pub async fn open(&self) -> Result<(), ListenerError> {
        self.open_with_cancel(&CancellationToken::new()).await
    }

    /// Connects to the relay. The first connect failure is returned; later
    /// disconnects are retried in the background.
    pub async fn open_with_cancel(&self, cancel: &CancellationToken) -> Result<(), ListenerError> {
        let options = {
            let mut state = self.inner.lock_state();
            if state.opened {
                return Err(ListenerError::AlreadyOpen);
            }
            if state.closed {
                return Err(ListenerError::Closed);
            }
            state.opened = true;
            state.options.clone()
        };

        let deadline = Deadline::new(cancel, options.operation_timeout);
        let control = self.inner.control.get_or_init(|| {
            ControlConnection::new(
                self.inner.transport.clone(),
                self.inner.address.clone(),
                self.inner.tracking.clone(),
                options,
                self.inner.token_provider.clone(),
                self.inner.status.clone(),
                self.command_handler(),
            )
        });

        info!(listener = %self.inner.tracking, "opening listener");
        control
            .open(deadline.token())
            .await
            .map_err(|e| deadline.map_err(e))
    }

    /// Closes the listener within the configured operation timeout. Idempotent.
    pub async fn close(&self) -> Result<(), ListenerError> {
        self.close_with_cancel(&CancellationToken::new()).await
    }

    /// Closes the listener. Connections accepted by the relay but not yet
    /// handed out are aborted.
    pub async fn close_with_cancel(&self, cancel: &CancellationToken) -> Result<(), ListenerError> {
        let (timeout, pending) = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Ok(());
            }
            state.closed = true;

            // Wakes every waiting accept_connection() with end of sequence.
            self.inner.queue.shutdown();
            (state.options.operation_timeout, self.inner.queue.drain())
        };

        info!(listener = %self.inner.tracking, pending = pending.len(), "closing listener");
        let result = match self.inner.control.get() {
            Some(control) => {
                let deadline = Deadline::new(cancel, timeout);
                control
                    .close(deadline.token())
                    .await
                    .map_err(|e| deadline.map_err(e))
            }
            None => Ok(()),
        };

        for stream in pending {
            stream.abort();
        }

        if let Err(e) = &result {
            warn!(
                listener = %self.inner.tracking,
                error = %e,
                "failed to close control connection"
            );
        }
        result
    }

    /// Waits for the next relayed connection.
    ///
    /// Returns `Ok(None)` once the listener is closed.
    pub async fn accept_connection(&self) -> Result<Option<T::Stream>, ListenerError> {
        self.accept_connection_with_cancel(&CancellationToken::new())
            .await
    }

    pub async fn accept_connection_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<T::Stream>, ListenerError> {
        if !self.inner.lock_state().opened {
            return Err(ListenerError::NotOpen);
        }
        self.inner
            .queue
            .dequeue(cancel)
            .await
            .map_err(|_| ListenerError::Cancelled)
    }

    fn command_handler(&self) -> CommandHandler {
        let inner = Arc::downgrade(&self.inner);
        Box::new(move |payload| {
            if let Some(inner) = inner.upgrade() {
                inner.on_command(payload);
            }
        })
    }
}

impl<T: Transport> Drop for Listener<T> {
    fn drop(&mut self) {
        self.inner.queue.shutdown();
        if let Some(control) = self.inner.control.get() {
            control.abort();
        }
    }
}

impl<T: Transport> fmt::Display for Listener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({})", self.inner.tracking)
    }
}

impl<T: Transport> Inner<T> {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_command(self: &Arc<Self>, payload: &[u8]) {
        match Command::decode(payload) {
            Ok(Command::Accept(accept)) => {
                tokio::spawn(self.clone().accept_rendezvous(accept));
            }
            Ok(_) => {
                warn!(
                    listener = %self.tracking,
                    command = %String::from_utf8_lossy(payload),
                    "unknown command"
                );
            }
            Err(e) => {
                warn!(listener = %self.tracking, error = %e, "failed to decode command");
            }
        }
    }

    /// Runs the accept handler for one rendezvous, then accepts or rejects it.
    async fn accept_rendezvous(self: Arc<Self>, command: AcceptCommand) {
        let context = Arc::new(RendezvousContext::new(command, self.address.as_str()));
        debug!(rendezvous = %context.tracking(), "rendezvous requested");

        let handler = self
            .accept_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if !rendezvous::should_accept(handler, context.clone()).await {
            let (status, description) = context.rejection();
            info!(rendezvous = %context.tracking(), status, "rendezvous rejected");
            if let Err(e) = self
                .transport
                .reject(context.rendezvous_address(), status, &description)
                .await
            {
                warn!(rendezvous = %context.tracking(), error = %e, "rendezvous reject failed");
            }
            return;
        }

        let buffer_size = self.lock_state().options.connection_buffer_size;
        let stream = match self
            .transport
            .accept(context.rendezvous_address(), buffer_size)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(rendezvous = %context.tracking(), error = %e, "rendezvous accept failed");
                return;
            }
        };

        let state = self.lock_state();
        if state.closed {
            drop(state);
            warn!(rendezvous = %context.tracking(), "listener closed, dropping rendezvous");
            stream.abort();
            return;
        }
        // Deferred: the consumer's continuation must not run on this task.
        if let Err(stream) = self.queue.enqueue(stream, Dispatch::Deferred) {
            drop(state);
            stream.abort();
            return;
        }
        drop(state);
        info!(rendezvous = %context.tracking(), "rendezvous accepted");
    }
}
