//! Transport seam between the connection state machine and the wire.
//!
//! [`WebSocketTransport`] is the production implementation on top of
//! `tokio-tungstenite`; tests plug in scripted transports.

#![expect(
    clippy::module_name_repetitions,
    reason = "Transport types include the module name for clarity when used outside this module"
)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};

use super::config::Config;
use super::error::WsError;
use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Payload type of a message.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum_macros::Display)]
pub enum MessageKind {
    /// UTF-8 text
    #[default]
    Text,
    /// Opaque bytes
    Binary,
}

/// One fragment of a message as read from the transport.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    /// Kind of the message this fragment belongs to. Only the first fragment's kind is used.
    pub kind: MessageKind,
    /// Set on the last fragment of a message
    pub end_of_message: bool,
}

impl Frame {
    #[must_use]
    pub fn new(payload: Bytes, kind: MessageKind, end_of_message: bool) -> Self {
        Self {
            payload,
            kind,
            end_of_message,
        }
    }

    /// A complete single-fragment text message.
    #[must_use]
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::new(Bytes::from(text.into()), MessageKind::Text, true)
    }

    /// A complete single-fragment binary message.
    #[must_use]
    pub fn binary<B: Into<Bytes>>(payload: B) -> Self {
        Self::new(payload.into(), MessageKind::Binary, true)
    }
}

/// Write half of an established connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, payload: Bytes, kind: MessageKind) -> Result<()>;

    /// Perform the closing handshake.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of an established connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Read the next data frame. `Ok(None)` means the peer closed the connection.
    ///
    /// Must be cancel safe: dropping the future must not lose a data frame.
    async fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Establishes connections for one endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(
        &self,
        request: Request,
        config: &Config,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}

/// [`Transport`] backed by `tokio-tungstenite`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        request: Request,
        config: &Config,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let ws_config = WebSocketConfig::default().read_buffer_size(config.receive_buffer_size);
        let (ws_stream, _) = connect_async_with_config(request, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        Ok((Box::new(WebSocketSink(write)), Box::new(WebSocketReader(read))))
    }
}

struct WebSocketSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, payload: Bytes, kind: MessageKind) -> Result<()> {
        let message = match kind {
            MessageKind::Text => Message::Text(
                Utf8Bytes::try_from(payload)
                    .map_err(|e| WsError::InvalidMessage(e.to_string()))?,
            ),
            MessageKind::Binary => Message::Binary(payload),
        };
        self.0.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.0.close().await?;
        Ok(())
    }
}

struct WebSocketReader(SplitStream<WsStream>);

#[async_trait]
impl FrameStream for WebSocketReader {
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            // tungstenite reassembles continuation frames itself, so every data message
            // arrives as a single final fragment
            match self.0.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Frame::new(Bytes::from(text), MessageKind::Text, true)));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Frame::new(data, MessageKind::Binary, true)));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite; raw frames are never surfaced
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}
