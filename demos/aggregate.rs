//! Watches several WebSocket feeds through one composite connection state.
//!
//! Each endpoint gets its own [`ConnectionClient`]; a [`ConnectionAggregator`] reports
//! whether the feeds are up as a whole. An optional subscription message is sent to every
//! endpoint and replayed after each reconnect.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,resilient_ws=debug cargo run --example aggregate -- wss://a.example/ws wss://b.example/ws
//! ```
//!
//! Optionally subscribe and log to a file:
//! ```sh
//! SUBSCRIBE='{"type":"subscribe"}' LOG_FILE=aggregate.log cargo run --example aggregate -- wss://a.example/ws
//! ```

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use resilient_ws::error::{BoxError, Error};
use resilient_ws::ws::config::{Config, ReconnectAttempts};
use resilient_ws::ws::{Command, Connection as _, ConnectionClient, Handler, MessageKind};
use resilient_ws::{ConnectionAggregator, ConnectionState};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

struct Printer {
    endpoint: String,
}

impl Handler for Printer {
    fn on_message(&self, message: &[u8], kind: MessageKind) -> Result<(), BoxError> {
        match kind {
            MessageKind::Text => {
                let text = std::str::from_utf8(message)?;
                info!(endpoint = %self.endpoint, %text, "message");
            }
            _ => info!(endpoint = %self.endpoint, len = message.len(), "binary message"),
        }
        Ok(())
    }

    fn on_error(&self, error: &Error) {
        warn!(endpoint = %self.endpoint, %error, "connection error");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let endpoints: Vec<String> = std::env::args().skip(1).collect();
    if endpoints.is_empty() {
        anyhow::bail!("usage: aggregate <endpoint>...");
    }
    let subscribe = std::env::var("SUBSCRIBE").ok();

    let config = Config::builder()
        .reconnect_attempts(ReconnectAttempts::Limited(20))
        .reconnect_interval(Duration::from_secs(1))
        .max_reconnect_interval(Duration::from_secs(30))
        .backoff_multiplier(2.0)
        .build();

    let aggregator = ConnectionAggregator::new();
    let mut clients = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let handler = Arc::new(Printer {
            endpoint: endpoint.clone(),
        });
        let client = ConnectionClient::new(&endpoint, config.clone(), handler)?;
        aggregator.add(Arc::new(client.clone()));
        clients.push(client);
    }

    aggregator.add_state_listener(Arc::new(|state: ConnectionState| {
        info!(%state, "feeds changed state");
    }));

    if let Err(e) = aggregator.connect(None).await {
        error!(error = %e, "not every feed connected");
    }

    if let Some(subscribe) = subscribe {
        for client in &clients {
            client
                .send_command(Command::text(subscribe.clone()).with_subscription_id(1))
                .await?;
        }
    }

    let mut states = aggregator.state_receiver();
    while states.changed().await.is_ok() {
        if *states.borrow() == ConnectionState::Failed {
            error!("every feed gave up");
            break;
        }
    }

    aggregator.disconnect()?;
    Ok(())
}
