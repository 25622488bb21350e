//! Credential source and renewal.
//!
//! The listener treats a token as an opaque string with an expiry. A
//! [`TokenProvider`] issues tokens; the [`TokenRenewer`] fetches a fresh one
//! shortly before the current one expires and broadcasts it, so the control
//! connection can hand it to the relay.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TokenError;

/// How long before expiry a token is renewed.
pub const REFRESH_AHEAD: Duration = Duration::from_secs(4 * 60);

/// Minimum spacing between renewal attempts.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// An issued credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityToken {
    pub token: String,
    pub audience: String,
    pub expires_at: SystemTime,
}

/// Issues tokens for an audience (the listener address).
pub trait TokenProvider: Send + Sync + 'static {
    fn get_token<'a>(
        &'a self,
        audience: &'a str,
        valid_for: Duration,
    ) -> BoxFuture<'a, Result<SecurityToken, TokenError>>;
}

/// Provider handing out a fixed, pre-issued token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
    lifetime: Duration,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            token: token.into(),
            lifetime,
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn get_token<'a>(
        &'a self,
        audience: &'a str,
        _valid_for: Duration,
    ) -> BoxFuture<'a, Result<SecurityToken, TokenError>> {
        let token = SecurityToken {
            token: self.token.clone(),
            audience: audience.to_string(),
            expires_at: SystemTime::now() + self.lifetime,
        };
        async move { Ok(token) }.boxed()
    }
}

/// Fetches listener tokens and renews them before they expire.
pub(crate) struct TokenRenewer {
    provider: Arc<dyn TokenProvider>,
    audience: String,
    valid_for: Duration,
    renewed: broadcast::Sender<SecurityToken>,
    timer: Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
}

impl TokenRenewer {
    pub(crate) fn new(
        provider: Arc<dyn TokenProvider>,
        audience: impl Into<String>,
        valid_for: Duration,
    ) -> Self {
        let (renewed, _) = broadcast::channel(4);
        Self {
            provider,
            audience: audience.into(),
            valid_for,
            renewed,
            timer: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Receives every token fetched by the renewal timer.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SecurityToken> {
        self.renewed.subscribe()
    }

    /// Fetches a token and (re)starts the renewal timer for it.
    pub(crate) async fn get_token(&self) -> Result<SecurityToken, TokenError> {
        if self.closed.is_cancelled() {
            return Err(TokenError::Closed);
        }
        let token = self
            .provider
            .get_token(&self.audience, self.valid_for)
            .await?;
        self.schedule(&token);
        Ok(token)
    }

    /// Stops the renewal timer. Idempotent.
    pub(crate) fn close(&self) {
        self.closed.cancel();
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }

    fn schedule(&self, token: &SecurityToken) {
        let provider = self.provider.clone();
        let audience = self.audience.clone();
        let valid_for = self.valid_for;
        let renewed = self.renewed.clone();
        let closed = self.closed.clone();
        let first_delay = renew_delay(token.expires_at);

        let handle = tokio::spawn(async move {
            let mut delay = first_delay;
            loop {
                tokio::select! {
                    _ = closed.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                match provider.get_token(&audience, valid_for).await {
                    Ok(token) => {
                        debug!(audience = %audience, "listener token renewed");
                        delay = renew_delay(token.expires_at);
                        // No subscribers is fine: nobody is online to tell.
                        let _ = renewed.send(token);
                    }
                    Err(e) => {
                        warn!(audience = %audience, error = %e, "token renewal failed");
                        delay = MIN_REFRESH_INTERVAL;
                    }
                }
            }
        });

        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
        if self.closed.is_cancelled()
            && let Some(handle) = timer.take()
        {
            handle.abort();
        }
    }
}

impl Drop for TokenRenewer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Time to wait before renewing a token that expires at `expires_at`.
fn renew_delay(expires_at: SystemTime) -> Duration {
    let remaining = expires_at
        .duration_since(SystemTime::now())
        .unwrap_or_default();
    remaining
        .saturating_sub(REFRESH_AHEAD)
        .max(MIN_REFRESH_INTERVAL)
}
