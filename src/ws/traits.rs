//! Core traits for the connection client and its collaborators.

use async_trait::async_trait;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_util::sync::CancellationToken;

use super::transport::MessageKind;
use crate::Result;
use crate::error::{BoxError, Error};
use crate::state::{ConnectionState, ListenerId, StateListener};

/// Minimal capability set of a connection, enough for it to be aggregated.
///
/// Implemented by [`ConnectionClient`](super::ConnectionClient) and by anything else an
/// [`ConnectionAggregator`](crate::aggregator::ConnectionAggregator) should observe.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Start a connect cycle. Resolves once the connection is established or the
    /// attempt budget is exhausted.
    async fn connect(&self, cancel: Option<CancellationToken>) -> Result<()>;

    /// End the active cycle. Does not wait for the socket to close.
    fn disconnect(&self) -> Result<()>;

    fn state(&self) -> ConnectionState;

    /// Register `listener` for state changes.
    ///
    /// Listeners run inline on the task performing the transition, in transition order.
    /// They must not block, and must not call mutating operations of the notifying object.
    fn add_state_listener(&self, listener: StateListener) -> ListenerId;

    /// Returns whether a listener with `id` was registered.
    fn remove_state_listener(&self, id: ListenerId) -> bool;

    /// Address of the underlying connection. Handles that share one connection (clones of
    /// a client, for instance) must return the same address.
    fn identity(&self) -> *const () {
        std::ptr::from_ref(self).cast()
    }
}

/// Transformation applied to each reassembled message before dispatch (e.g. decompression).
pub trait Preprocessor: Send + Sync {
    /// Write the transformed `input` into `output` and return the number of bytes written.
    fn process(&self, input: &[u8], output: &mut [u8]) -> std::result::Result<usize, BoxError>;
}

/// Application callbacks of a [`ConnectionClient`](super::ConnectionClient).
///
/// # Example
///
/// ```
/// use resilient_ws::error::{BoxError, Error};
/// use resilient_ws::ws::{Handler, MessageKind};
///
/// struct Printer;
///
/// impl Handler for Printer {
///     fn on_message(&self, message: &[u8], kind: MessageKind) -> Result<(), BoxError> {
///         let text = std::str::from_utf8(message)?;
///         assert_eq!(kind, MessageKind::Text);
///         let _ = text;
///         Ok(())
///     }
///
///     fn on_error(&self, _error: &Error) {}
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one complete message. [`MessageKind::Text`] payloads are UTF-8.
    ///
    /// Errors (and panics) are counted as parsing errors; they never stop the receive loop.
    fn on_message(&self, message: &[u8], kind: MessageKind) -> std::result::Result<(), BoxError>;

    /// Report an error that was handled internally.
    fn on_error(&self, error: &Error);

    fn preprocessor(&self) -> Option<&dyn Preprocessor> {
        None
    }

    /// Called with the upgrade request of every connect attempt, before the handshake.
    fn on_socket_created(&self, request: &mut Request) -> std::result::Result<(), BoxError> {
        _ = request;
        Ok(())
    }

    /// Called after the handshake and before the connection is declared established.
    /// Sending is already possible here. An error fails the attempt.
    async fn on_connected(&self, reconnect: bool) -> std::result::Result<(), BoxError> {
        _ = reconnect;
        Ok(())
    }
}

/// Hook run before a stored command is replayed, e.g. to refresh credentials.
#[async_trait]
pub trait PreSendHook: Send + Sync {
    async fn before_resend(
        &self,
        subscription_id: i64,
        cancel: CancellationToken,
    ) -> std::result::Result<(), BoxError>;
}
