use std::panic::{self, AssertUnwindSafe};

use bytes::BytesMut;
use tokio_util::sync::CancellationToken;

use super::config::Config;
use super::error::is_fatal;
use super::traits::Handler;
use super::transport::{Frame, FrameStream, MessageKind};
use crate::error::Error;

/// Handler failures tolerated before the loop starts treating the next network error as fatal.
pub(crate) const PARSING_ERROR_THRESHOLD: u32 = 100;
/// Read failures tolerated within one loop lifetime.
pub(crate) const NETWORK_ERROR_THRESHOLD: u32 = 10;

/// Why a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// The cycle's cancellation scope was cancelled
    Cancelled,
    /// The peer closed the connection
    Closed,
    /// Too many read failures
    NetworkErrors,
    /// A transport-level fatal error
    Fatal,
}

/// Reads frames from one connection and dispatches complete messages to a [`Handler`].
pub(crate) struct ReceiveLoop<'h> {
    handler: &'h dyn Handler,
    message: BytesMut,
    kind: Option<MessageKind>,
    output: Vec<u8>,
    parsing_errors: u32,
    network_errors: u32,
}

impl<'h> ReceiveLoop<'h> {
    pub(crate) fn new(handler: &'h dyn Handler, config: &Config) -> Self {
        let output = if handler.preprocessor().is_some() {
            vec![0; config.uncompressed_buffer_size]
        } else {
            Vec::new()
        };

        Self {
            handler,
            message: BytesMut::with_capacity(config.receive_buffer_size),
            kind: None,
            output,
            parsing_errors: 0,
            network_errors: 0,
        }
    }

    pub(crate) async fn run(
        &mut self,
        stream: &mut dyn FrameStream,
        cancel: &CancellationToken,
    ) -> LoopExit {
        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => return LoopExit::Cancelled,
                frame = stream.next_frame() => frame,
            };

            match frame {
                Ok(Some(frame)) => self.on_frame(frame),
                Ok(None) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Connection closed by peer");
                    return LoopExit::Closed;
                }
                Err(e) => {
                    if let Some(exit) = self.on_read_error(&e, cancel) {
                        return exit;
                    }
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        let kind = *self.kind.get_or_insert(frame.kind);
        self.message.extend_from_slice(&frame.payload);

        if !frame.end_of_message {
            return;
        }
        self.kind = None;

        if self.message.is_empty() {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(len = self.message.len(), %kind, "Received message");

        let result = dispatch(self.handler, &self.message, &mut self.output, kind);
        self.message.clear();

        if let Err(e) = result {
            self.on_parsing_error(&e);
        }
    }

    fn on_parsing_error(&mut self, error: &Error) {
        self.parsing_errors = self.parsing_errors.saturating_add(1);

        #[cfg(feature = "tracing")]
        tracing::warn!(count = self.parsing_errors, %error, "Failed to handle message");
        self.handler.on_error(error);

        if self.parsing_errors == PARSING_ERROR_THRESHOLD {
            #[cfg(feature = "tracing")]
            tracing::error!(
                threshold = PARSING_ERROR_THRESHOLD,
                "Parsing error threshold reached, the next network error ends the receive loop"
            );
        }
    }

    fn on_read_error(&mut self, error: &Error, cancel: &CancellationToken) -> Option<LoopExit> {
        if cancel.is_cancelled() {
            // Reads fail while the socket is torn down on purpose
            return Some(LoopExit::Cancelled);
        }

        if is_fatal(error) {
            #[cfg(feature = "tracing")]
            tracing::warn!(%error, "Fatal transport error");
            self.handler.on_error(error);
            return Some(LoopExit::Fatal);
        }

        self.network_errors = self.network_errors.saturating_add(1);

        #[cfg(feature = "tracing")]
        tracing::warn!(count = self.network_errors, %error, "Failed to read from connection");
        self.handler.on_error(error);

        if self.network_errors >= NETWORK_ERROR_THRESHOLD
            || self.parsing_errors >= PARSING_ERROR_THRESHOLD
        {
            #[cfg(feature = "tracing")]
            tracing::error!(
                network_errors = self.network_errors,
                parsing_errors = self.parsing_errors,
                "Error threshold reached, leaving receive loop"
            );
            return Some(LoopExit::NetworkErrors);
        }

        None
    }

    #[cfg(test)]
    pub(crate) fn parsing_errors(&self) -> u32 {
        self.parsing_errors
    }

    #[cfg(test)]
    pub(crate) fn network_errors(&self) -> u32 {
        self.network_errors
    }
}

fn dispatch(
    handler: &dyn Handler,
    message: &[u8],
    output: &mut [u8],
    kind: MessageKind,
) -> crate::Result<()> {
    let payload = match handler.preprocessor() {
        Some(preprocessor) => {
            let len = preprocessor
                .process(message, output)
                .map_err(Error::handler)?;
            let capacity = output.len();
            output.get(..len).ok_or_else(|| {
                Error::handler(
                    format!("preprocessor reported {len} bytes for a {capacity} byte buffer")
                        .into(),
                )
            })?
        }
        None => message,
    };

    match panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(payload, kind))) {
        Ok(result) => result.map_err(Error::handler),
        Err(_) => Err(Error::handler("message handler panicked".into())),
    }
}
