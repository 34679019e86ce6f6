//! Resilient WebSocket client.
//!
//! # Architecture
//!
//! - [`ConnectionClient`]: owns the connect / receive / reconnect cycle of one endpoint
//! - [`Handler`]: application callbacks for messages, errors and connection hooks
//! - [`Command`]: outbound message, optionally stored for replay after reconnects
//! - [`Transport`]: seam to the wire, implemented by [`WebSocketTransport`]
//!
//! # Example
//!
//! ```rust, no_run
//! use std::sync::Arc;
//!
//! use resilient_ws::error::{BoxError, Error};
//! use resilient_ws::ws::config::{Config, ReconnectAttempts};
//! use resilient_ws::ws::{Connection as _, ConnectionClient, Handler, MessageKind};
//!
//! struct Feed;
//!
//! impl Handler for Feed {
//!     fn on_message(&self, message: &[u8], _kind: MessageKind) -> Result<(), BoxError> {
//!         let _event: serde_json::Value = serde_json::from_slice(message)?;
//!         Ok(())
//!     }
//!
//!     fn on_error(&self, _error: &Error) {}
//! }
//!
//! # async fn run() -> resilient_ws::Result<()> {
//! let config = Config::builder()
//!     .reconnect_attempts(ReconnectAttempts::Limited(5))
//!     .build();
//! let client = ConnectionClient::new("wss://example.com/feed", config, Arc::new(Feed))?;
//! client.connect(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub(crate) mod receive;
pub mod registry;
pub mod traits;
pub mod transport;

pub use connection::ConnectionClient;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use registry::Command;
pub use traits::*;
pub use transport::{Frame, FrameSink, FrameStream, MessageKind, Transport, WebSocketTransport};
