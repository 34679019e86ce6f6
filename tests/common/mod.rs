#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Helpers are shared by several test binaries that each use a subset"
)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use resilient_ws::error::{BoxError, Error, Kind};
use resilient_ws::state::ConnectionState;
use resilient_ws::ws::config::{Config, ReconnectAttempts};
use resilient_ws::ws::{
    Connection, Frame, FrameSink, FrameStream, Handler, MessageKind, Transport, WsError,
};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::Request;

pub const ENDPOINT: &str = "ws://feed.test/stream";
pub const WAIT: Duration = Duration::from_secs(5);

/// Config with short delays so reconnect paths finish quickly.
#[must_use]
pub fn fast_config(attempts: ReconnectAttempts) -> Config {
    Config::builder()
        .reconnect_attempts(attempts)
        .reconnect_interval(Duration::from_millis(10))
        .resend_interval(Duration::from_millis(10))
        .resend_timeout(Duration::from_millis(20))
        .disconnect_timeout(Duration::from_secs(1))
        .build()
}

/// Outcome of one scripted connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Accept,
    Fail,
}

enum Incoming {
    Frame(Frame),
    Error(Error),
    Close,
}

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<Attempt>>,
    attempts: AtomicUsize,
    requests: Mutex<Vec<Request>>,
    peers: Mutex<Vec<Peer>>,
    sent: Mutex<Vec<String>>,
    /// `begin:<payload>` / `end:<payload>` markers around every write
    writes: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

/// In-memory transport. Each connect attempt takes the next [`Attempt`] from the script;
/// an exhausted script fails every further attempt.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new(script: &[Attempt]) -> Self {
        let transport = Self::default();
        transport.script(script);
        transport
    }

    pub fn script(&self, attempts: &[Attempt]) {
        self.shared
            .script
            .lock()
            .unwrap()
            .extend(attempts.iter().copied());
    }

    #[must_use]
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Text payloads written by the client, across all connections.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.shared.sent.lock().unwrap().clone()
    }

    #[must_use]
    pub fn writes(&self) -> Vec<String> {
        self.shared.writes.lock().unwrap().clone()
    }

    /// Header value of `name` on the upgrade request of attempt `index`.
    #[must_use]
    pub fn request_header(&self, index: usize, name: &str) -> Option<String> {
        self.shared.requests.lock().unwrap()[index]
            .headers()
            .get(name)
            .map(|value| value.to_str().unwrap().to_owned())
    }

    /// Remote end of accepted connection `index`.
    #[must_use]
    pub fn peer(&self, index: usize) -> Peer {
        self.shared.peers.lock().unwrap()[index].clone()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.shared.peers.lock().unwrap().len()
    }

    /// Poll until `predicate` holds on this transport.
    pub async fn wait_until<F: Fn(&Self) -> bool>(&self, predicate: F) {
        timeout(WAIT, async {
            while !predicate(self) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        request: Request,
        _config: &Config,
    ) -> resilient_ws::Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        self.shared.requests.lock().unwrap().push(request);

        let attempt = self
            .shared
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::Fail);
        if attempt == Attempt::Fail {
            let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
            return Err(WsError::Io(refused).into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.shared.peers.lock().unwrap().push(Peer {
            tx,
            closed: Arc::clone(&closed),
        });

        let sink = ScriptedSink {
            shared: Arc::clone(&self.shared),
            closed,
        };
        Ok((Box::new(sink), Box::new(ScriptedStream { rx })))
    }
}

/// Server side of one scripted connection.
#[derive(Clone)]
pub struct Peer {
    tx: mpsc::UnboundedSender<Incoming>,
    closed: Arc<AtomicBool>,
}

impl Peer {
    pub fn push(&self, frame: Frame) {
        drop(self.tx.send(Incoming::Frame(frame)));
    }

    pub fn push_text(&self, text: &str) {
        self.push(Frame::text(text));
    }

    /// A read failure that is not fatal on its own.
    pub fn push_transient_error(&self) {
        drop(self.tx.send(Incoming::Error(WsError::Timeout.into())));
    }

    /// The connection breaks without a closing handshake.
    pub fn drop_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
        drop(self.tx.send(Incoming::Error(WsError::ConnectionClosed.into())));
    }

    /// The peer closes the connection gracefully.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        drop(self.tx.send(Incoming::Close));
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedSink {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for ScriptedSink {
    async fn send(&mut self, payload: Bytes, _kind: MessageKind) -> resilient_ws::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WsError::ConnectionClosed.into());
        }

        let text = String::from_utf8_lossy(&payload).into_owned();
        self.shared
            .writes
            .lock()
            .unwrap()
            .push(format!("begin:{text}"));
        // Give concurrent writers a chance to interleave
        tokio::task::yield_now().await;
        self.shared.writes.lock().unwrap().push(format!("end:{text}"));
        self.shared.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&mut self) -> resilient_ws::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedStream {
    rx: mpsc::UnboundedReceiver<Incoming>,
}

#[async_trait]
impl FrameStream for ScriptedStream {
    async fn next_frame(&mut self) -> resilient_ws::Result<Option<Frame>> {
        match self.rx.recv().await {
            Some(Incoming::Frame(frame)) => Ok(Some(frame)),
            Some(Incoming::Error(error)) => Err(error),
            Some(Incoming::Close) => Ok(None),
            // Every peer handle is gone; keep the connection open
            None => std::future::pending().await,
        }
    }
}

/// Handler recording everything it is called with.
#[derive(Default)]
pub struct Recorder {
    pub messages: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<Kind>>,
    pub connected: Mutex<Vec<bool>>,
    /// Number of upcoming `on_connected` calls that fail
    pub failing_hooks: AtomicUsize,
    /// Header added to every upgrade request
    pub header: Option<(&'static str, &'static str)>,
}

impl Recorder {
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<Kind> {
        self.errors.lock().unwrap().clone()
    }

    #[must_use]
    pub fn connected(&self) -> Vec<bool> {
        self.connected.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler for Recorder {
    fn on_message(&self, message: &[u8], _kind: MessageKind) -> Result<(), BoxError> {
        let text = std::str::from_utf8(message)?;
        if text == "poison" {
            return Err("poisoned message".into());
        }
        self.messages.lock().unwrap().push(text.to_owned());
        Ok(())
    }

    fn on_error(&self, error: &Error) {
        self.errors.lock().unwrap().push(error.kind());
    }

    fn on_socket_created(&self, request: &mut Request) -> Result<(), BoxError> {
        if let Some((name, value)) = self.header {
            request.headers_mut().insert(name, value.parse()?);
        }
        Ok(())
    }

    async fn on_connected(&self, reconnect: bool) -> Result<(), BoxError> {
        self.connected.lock().unwrap().push(reconnect);
        let failing = self.failing_hooks.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_hooks.store(failing - 1, Ordering::SeqCst);
            return Err("post-connect hook failed".into());
        }
        Ok(())
    }
}

/// Every state a connection publishes, in order.
#[must_use]
pub fn record_states(connection: &dyn Connection) -> Arc<Mutex<Vec<ConnectionState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    connection.add_state_listener(Arc::new(move |state: ConnectionState| {
        sink.lock().unwrap().push(state);
    }));
    states
}

pub async fn wait_for_state(
    receiver: &mut watch::Receiver<ConnectionState>,
    expected: ConnectionState,
) {
    timeout(WAIT, receiver.wait_for(|state| *state == expected))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {expected}"))
        .unwrap();
}
