//! Echo server behind a relay listener.
//!
//! Opens a listener on the configured address and echoes every message
//! received on each relayed connection.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tunnelrelay_listener::{
    BoxError, Listener, RendezvousContext, StaticTokenProvider, WsRelayedStream, WsTransport,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting relay echo");

    // wss:// needs a process-wide TLS provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = config::EchoConfig::load(path.as_deref())?;
    if config.address.is_empty() {
        anyhow::bail!("no listener address configured");
    }

    let tokens = Arc::new(StaticTokenProvider::new(
        config.token.clone(),
        config.token_lifetime(),
    ));
    let listener = Arc::new(Listener::new(&config.address, tokens, WsTransport::new())?);
    listener.set_options(config.listener_options())?;

    if let Some(header) = config.required_header.clone() {
        listener.set_accept_handler(move |ctx: Arc<RendezvousContext>| {
            let header = header.clone();
            async move {
                let present = ctx
                    .connect_headers()
                    .keys()
                    .any(|name| name.eq_ignore_ascii_case(&header));
                if !present {
                    ctx.set_status_code(401);
                    ctx.set_status_description(format!("missing {header} header"));
                }
                Ok::<_, BoxError>(present)
            }
        });
    }

    let mut events = listener.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event, "listener status"),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    listener.open().await?;
    info!(listener = %listener, "listening");

    let accept_loop = {
        let listener = listener.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept_connection().await {
                    Ok(Some(stream)) => {
                        tokio::spawn(echo(stream));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    listener.close().await?;
    let _ = accept_loop.await;
    Ok(())
}

/// Sends every data message back to the client until it closes.
async fn echo(stream: WsRelayedStream) {
    let (mut sink, mut source) = stream.into_inner().split();
    while let Some(message) = source.next().await {
        match message {
            Ok(message @ (Message::Binary(_) | Message::Text(_))) => {
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "echo write failed");
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "relayed connection failed");
                break;
            }
        }
    }
    let _ = sink.close().await;
}
