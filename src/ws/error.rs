#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::io;

use tokio_tungstenite::tungstenite::error::ProtocolError;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// I/O error raised by a transport implementation
    Io(io::Error),
    /// WebSocket connection was closed
    ConnectionClosed,
    /// Operation timed out
    Timeout,
    /// Received or asked to send an invalid message
    InvalidMessage(String),
}

impl WsError {
    /// Whether the error means the underlying connection is gone for good, so retrying
    /// reads on the same socket is pointless.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        use tokio_tungstenite::tungstenite::Error as Tungstenite;

        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => is_fatal_io(e),
            Self::Connection(
                Tungstenite::ConnectionClosed
                | Tungstenite::AlreadyClosed
                | Tungstenite::Protocol(ProtocolError::ResetWithoutClosingHandshake),
            ) => true,
            Self::Connection(Tungstenite::Io(e)) => is_fatal_io(e),
            _ => false,
        }
    }
}

fn is_fatal_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Io(e) => write!(f, "WebSocket transport I/O error: {e}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::Timeout => write!(f, "WebSocket operation timed out"),
            Self::InvalidMessage(msg) => write!(f, "Invalid WebSocket message: {msg}"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, WsError::Connection(e))
    }
}

/// Whether `error` wraps a fatal [`WsError`].
pub(crate) fn is_fatal(error: &crate::error::Error) -> bool {
    error.downcast_ref::<WsError>().is_some_and(WsError::is_fatal)
}

#[cfg(test)]
mod tests {
    use tokio_tungstenite::tungstenite::Error as Tungstenite;

    use super::*;

    #[test]
    fn closed_connections_are_fatal() {
        assert!(WsError::ConnectionClosed.is_fatal(), "closed");
        assert!(
            WsError::Connection(Tungstenite::ConnectionClosed).is_fatal(),
            "tungstenite closed"
        );
        assert!(
            WsError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_fatal(),
            "reset"
        );
    }

    #[test]
    fn transient_errors_are_not_fatal() {
        assert!(!WsError::Timeout.is_fatal(), "timeout");
        assert!(
            !WsError::Io(io::Error::from(io::ErrorKind::WouldBlock)).is_fatal(),
            "would block"
        );
        assert!(
            !WsError::InvalidMessage("bad utf-8".to_owned()).is_fatal(),
            "invalid message"
        );
    }

    #[test]
    fn fatal_detection_through_crate_error() {
        let error: crate::error::Error = WsError::ConnectionClosed.into();
        assert!(is_fatal(&error), "wrapped closed error is fatal");

        let error = crate::error::Error::invalid_operation("nope");
        assert!(!is_fatal(&error), "non transport errors are not fatal");
    }
}
