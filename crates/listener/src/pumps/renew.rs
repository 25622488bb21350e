//! Forwards renewed listener tokens to the relay.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tunnelrelay_protocol::Command;

use crate::control::ControlConnection;
use crate::token::SecurityToken;
use crate::transport::Transport;

/// Sends a `renewToken` command for every token the renewer issues.
///
/// Failures are logged only: a token that never reached the relay shows up
/// later as an authorization failure on reconnect.
pub(crate) async fn renew_pump<T: Transport>(
    control: Arc<ControlConnection<T>>,
    mut renewed: broadcast::Receiver<SecurityToken>,
) {
    let shutdown = control.shutdown_token().clone();
    loop {
        let token = tokio::select! {
            _ = shutdown.cancelled() => break,
            token = renewed.recv() => token,
        };

        let token = match token {
            Ok(token) => token,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "renewed tokens skipped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let command = Command::renew_token(token.token);
        if let Err(e) = control.send_command(&command, &shutdown).await {
            warn!(listener = %control.tracking(), error = %e, "failed to send renewed token");
        } else {
            debug!(listener = %control.tracking(), "renewed token sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use url::Url;

    use super::*;
    use crate::testing::{MockTransport, counting_token_provider};
    use crate::types::ListenerOptions;
    use tunnelrelay_protocol::TrackingContext;

    #[tokio::test(start_paused = true)]
    async fn renewed_token_is_sent_to_relay() {
        let (transport, mut peers) = MockTransport::new();
        let (status, _events) = broadcast::channel(16);
        let options = ListenerOptions {
            token_validity: Duration::from_secs(5 * 60),
            ..ListenerOptions::default()
        };
        let control = ControlConnection::new(
            transport,
            Url::parse("sb://contoso.example.net/ep").unwrap(),
            TrackingContext::new("sb://contoso.example.net/ep"),
            options,
            counting_token_provider(Duration::from_secs(5 * 60)),
            status,
            Box::new(|_| {}),
        );

        control.open(&CancellationToken::new()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        // The first token expires in five minutes; renewal fires a minute in.
        let sent = tokio::time::timeout(Duration::from_secs(120), peer.next_sent())
            .await
            .expect("renewal should be sent")
            .unwrap();
        assert_eq!(
            Command::decode(&sent).unwrap(),
            Command::renew_token("token-2")
        );

        control.close(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renewal_send_keeps_pump_running() {
        let (transport, mut peers) = MockTransport::new();
        let (status, _events) = broadcast::channel(16);
        let options = ListenerOptions {
            token_validity: Duration::from_secs(5 * 60),
            ..ListenerOptions::default()
        };
        let control = ControlConnection::new(
            transport,
            Url::parse("sb://contoso.example.net/ep").unwrap(),
            TrackingContext::new("sb://contoso.example.net/ep"),
            options,
            counting_token_provider(Duration::from_secs(5 * 60)),
            status,
            Box::new(|_| {}),
        );

        control.open(&CancellationToken::new()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        // First renewal, a minute in, hits a broken socket.
        peer.set_fail_sends(true);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(peer.failed_sends(), 1);
        assert!(control.status().is_online);

        // The next renewal goes through.
        peer.set_fail_sends(false);
        let sent = tokio::time::timeout(Duration::from_secs(120), peer.next_sent())
            .await
            .expect("later renewal should be sent")
            .unwrap();
        assert_eq!(
            Command::decode(&sent).unwrap(),
            Command::renew_token("token-3")
        );

        control.close(&CancellationToken::new()).await.unwrap();
    }
}
