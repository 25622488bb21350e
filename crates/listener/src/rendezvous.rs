//! Per-rendezvous context and the user accept predicate.

use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use tracing::warn;

use tunnelrelay_protocol::constants::{STATUS_BAD_GATEWAY, STATUS_FORBIDDEN};
use tunnelrelay_protocol::{AcceptCommand, RemoteEndpoint, TrackingContext};

/// Error type returned by accept handlers.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Decides whether a rendezvous is accepted. `Ok(false)` rejects it using the
/// status set on the context.
pub type AcceptHandler =
    Arc<dyn Fn(Arc<RendezvousContext>) -> BoxFuture<'static, Result<bool, BoxError>> + Send + Sync>;

const DEFAULT_REJECT_DESCRIPTION: &str = "Rejected by listener";

/// Response fields an accept handler may set before rejecting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RendezvousResponse {
    pub status_code: Option<u16>,
    pub status_description: Option<String>,
}

/// A client's request to connect, as announced by the relay.
#[derive(Debug)]
pub struct RendezvousContext {
    tracking: TrackingContext,
    rendezvous_address: String,
    connect_headers: HashMap<String, String>,
    remote_endpoint: Option<RemoteEndpoint>,
    response: Mutex<RendezvousResponse>,
}

impl RendezvousContext {
    pub(crate) fn new(command: AcceptCommand, listener_address: &str) -> Self {
        Self {
            tracking: TrackingContext::with_id(command.id, listener_address),
            rendezvous_address: command.address,
            connect_headers: command.connect_headers,
            remote_endpoint: command.remote_endpoint,
            response: Mutex::new(RendezvousResponse::default()),
        }
    }

    pub fn tracking(&self) -> &TrackingContext {
        &self.tracking
    }

    pub fn tracking_id(&self) -> &str {
        self.tracking.tracking_id()
    }

    /// One-time address the listener connects to in order to accept.
    pub fn rendezvous_address(&self) -> &str {
        &self.rendezvous_address
    }

    /// Headers sent by the client with its connect request.
    pub fn connect_headers(&self) -> &HashMap<String, String> {
        &self.connect_headers
    }

    pub fn remote_endpoint(&self) -> Option<&RemoteEndpoint> {
        self.remote_endpoint.as_ref()
    }

    pub fn set_status_code(&self, code: u16) {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status_code = Some(code);
    }

    pub fn set_status_description(&self, description: impl Into<String>) {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status_description = Some(description.into());
    }

    pub fn response(&self) -> RendezvousResponse {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Status sent to the relay when the rendezvous is rejected.
    pub(crate) fn rejection(&self) -> (u16, String) {
        let response = self.response();
        (
            response.status_code.unwrap_or(STATUS_FORBIDDEN),
            response
                .status_description
                .unwrap_or_else(|| DEFAULT_REJECT_DESCRIPTION.to_string()),
        )
    }
}

/// Runs the accept handler for `context`. No handler accepts everything.
///
/// A handler that fails or panics rejects the rendezvous with 502.
pub(crate) async fn should_accept(
    handler: Option<AcceptHandler>,
    context: Arc<RendezvousContext>,
) -> bool {
    let Some(handler) = handler else {
        return true;
    };

    // The handler is called inside the task, so a panic while building its
    // future is contained as well.
    let ctx = context.clone();
    let outcome = tokio::spawn(async move { handler(ctx).await }).await;
    let detail = match outcome {
        Ok(Ok(accept)) => return accept,
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_panic() => "accept handler panicked".to_string(),
        Err(e) => e.to_string(),
    };

    let description = format!(
        "The listener's accept handler failed. TrackingId:{}",
        context.tracking_id()
    );
    warn!(rendezvous = %context.tracking(), error = %detail, "accept handler failed");
    context.set_status_code(STATUS_BAD_GATEWAY);
    context.set_status_description(description);
    false
}
