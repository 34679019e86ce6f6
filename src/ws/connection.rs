#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use backoff::backoff::Backoff as _;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::config::Config;
use super::receive::ReceiveLoop;
use super::registry::{Command, ResendRegistry};
use super::traits::{Connection, Handler};
use super::transport::{FrameSink, FrameStream, MessageKind, Transport, WebSocketTransport};
use crate::Result;
use crate::error::Error;
use crate::state::{AttemptBudget, ConnectionState, Event, ListenerId, StateCell, StateListener};

/// Resilient client for one WebSocket endpoint.
///
/// The client handles all connection concerns for the application:
/// - Establishing the connection, retrying failed attempts under a [`ReconnectAttempts`] budget
/// - Pumping inbound messages to a [`Handler`], reassembling fragments on the way
/// - Reconnecting after unexpected drops, and replaying persistent commands afterwards
/// - Publishing every [`ConnectionState`] change to registered listeners
///
/// Connect, disconnect and state observation come from the [`Connection`] trait.
///
/// Cloning is cheap and every clone drives the same connection. Once the last clone is
/// dropped the active cycle is cancelled and the client cannot be reused.
///
/// Concurrent [`send`](Self::send) calls are safe: each frame is written whole while holding
/// the cycle's writer lock.
///
/// [`ReconnectAttempts`]: super::config::ReconnectAttempts
///
/// # Example
///
/// ```rust, no_run
/// use std::sync::Arc;
///
/// use resilient_ws::error::{BoxError, Error};
/// use resilient_ws::ws::config::Config;
/// use resilient_ws::ws::{Command, Connection as _, ConnectionClient, Handler, MessageKind};
///
/// struct Printer;
///
/// impl Handler for Printer {
///     fn on_message(&self, message: &[u8], _kind: MessageKind) -> Result<(), BoxError> {
///         let _text = std::str::from_utf8(message)?;
///         Ok(())
///     }
///
///     fn on_error(&self, _error: &Error) {}
/// }
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = ConnectionClient::new("wss://example.com/ws", Config::default(), Arc::new(Printer))?;
///     client.connect(None).await?;
///
///     // Replayed after every reconnect until unsubscribed with id -1
///     client
///         .send_command(Command::text(r#"{"op":"subscribe","channel":"trades"}"#).with_subscription_id(1))
///         .await?;
///
///     client.disconnect()?;
///     Ok(())
/// }
/// ```
pub struct ConnectionClient<T: Transport = WebSocketTransport> {
    handle: Arc<Handle<T>>,
}

impl<T: Transport> Clone for ConnectionClient<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<T: Transport> fmt::Debug for ConnectionClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionClient")
            .field("endpoint", &self.inner().endpoint.as_str())
            .field("state", &self.inner().state.get())
            .finish_non_exhaustive()
    }
}

/// Disposes the client when the last user-facing clone goes away. Background tasks hold the
/// inner state directly, so they never keep the handle alive.
struct Handle<T: Transport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Transport> Drop for Handle<T> {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

struct ClientInner<T: Transport> {
    endpoint: Url,
    config: Config,
    transport: T,
    handler: Arc<dyn Handler>,
    state: StateCell,
    /// Commands replayed after a reconnect
    registry: ResendRegistry,
    /// The active `connect` call, if any
    session: Mutex<Option<Session>>,
    /// Retries left for the active `connect` call
    budget: Mutex<AttemptBudget>,
    disposed: AtomicBool,
}

struct Session {
    /// Cancellation supplied to `connect`; every cycle token derives from it
    parent: Option<CancellationToken>,
    cycle: Arc<Cycle>,
}

/// One attempt-and-hold period, bounded by its own cancellation scope.
struct Cycle {
    token: CancellationToken,
    /// Cancelled once the cycle's connection is gone. Writes and resend passes of the cycle
    /// end with it; a new cycle never inherits them.
    closed: CancellationToken,
    /// Set when the application asked for the cycle to end
    requested: AtomicBool,
    writer: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
}

impl Cycle {
    fn new(parent: Option<&CancellationToken>) -> Self {
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        Self {
            closed: token.child_token(),
            token,
            requested: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    fn stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst) || self.token.is_cancelled()
    }

    fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.token.cancel();
    }
}

impl ConnectionClient<WebSocketTransport> {
    /// Create a client for `endpoint` (e.g. `wss://...`). No connection is made until
    /// [`Connection::connect`] is called.
    pub fn new(endpoint: &str, config: Config, handler: Arc<dyn Handler>) -> Result<Self> {
        Self::with_transport(endpoint, config, handler, WebSocketTransport)
    }
}

impl<T: Transport> ConnectionClient<T> {
    /// Create a client that establishes its connections through `transport`.
    pub fn with_transport(
        endpoint: &str,
        config: Config,
        handler: Arc<dyn Handler>,
        transport: T,
    ) -> Result<Self> {
        if endpoint.trim().is_empty() {
            return Err(Error::invalid_operation("endpoint must not be empty"));
        }
        let endpoint = Url::parse(endpoint)?;
        let budget = AttemptBudget::new(config.reconnect_attempts);

        let inner = Arc::new(ClientInner {
            endpoint,
            config,
            transport,
            handler,
            state: StateCell::new(),
            registry: ResendRegistry::default(),
            session: Mutex::new(None),
            budget: Mutex::new(budget),
            disposed: AtomicBool::new(false),
        });

        Ok(Self {
            handle: Arc::new(Handle { inner }),
        })
    }

    fn inner(&self) -> &Arc<ClientInner<T>> {
        &self.handle.inner
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner().endpoint
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner().config
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner().state.get().is_connected()
    }

    /// Subscribe to connection state changes.
    ///
    /// Unlike listeners, the receiver only keeps the latest state, which suits async
    /// consumers waiting for a particular state.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner().state.receiver()
    }

    /// Serialize `request` as JSON and send it as a one-off text message.
    pub async fn send<R: Serialize + ?Sized>(&self, request: &R) -> Result<()> {
        self.send_command(Command::json(request)?).await
    }

    /// Send `command`, recording or removing replay registrations by its subscription id.
    ///
    /// Fails with [`Kind::InvalidOperation`](crate::error::Kind::InvalidOperation) when no
    /// connection is established. Stored commands are only added or removed after the
    /// write succeeded.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        self.inner().send_command(command).await
    }

    /// Replay every stored command now.
    ///
    /// Uses the active cycle's cancellation scope unless `cancel` is given. Failures of
    /// single commands are reported to the handler and do not stop the pass. Returns how
    /// many commands were written.
    ///
    /// The pass is bound to the connection active when it starts and stops if that
    /// connection drops.
    pub async fn resend(&self, cancel: Option<CancellationToken>) -> Result<usize> {
        let inner = self.inner();
        let cycle = inner
            .current_cycle()
            .ok_or_else(|| Error::invalid_operation("no active connection"))?;
        let cancel = cancel.unwrap_or_else(|| cycle.closed.clone());
        inner.resend(&cycle, &cancel).await
    }

    /// Forget the stored commands of `subscription_id` without sending anything.
    /// Returns how many registrations were removed.
    pub fn remove_resend(&self, subscription_id: i64) -> usize {
        self.inner().registry.remove(subscription_id)
    }

    /// Forget every stored command.
    pub fn clear_resend(&self) {
        self.inner().registry.clear();
    }

    /// Subscription ids of the stored commands, in replay order.
    #[must_use]
    pub fn pending_commands(&self) -> Vec<i64> {
        self.inner().registry.ids()
    }

    #[must_use]
    pub fn resend_count(&self) -> usize {
        self.inner().registry.len()
    }

    /// End the active cycle, if any, and refuse any further `connect`.
    pub fn dispose(&self) {
        self.inner().dispose();
    }
}

#[async_trait]
impl<T: Transport> Connection for ConnectionClient<T> {
    async fn connect(&self, cancel: Option<CancellationToken>) -> Result<()> {
        self.inner().connect(cancel).await
    }

    /// Cancel the active cycle and drop all stored commands. The state settles at
    /// `Disconnected` once the socket is released.
    fn disconnect(&self) -> Result<()> {
        self.inner().disconnect()
    }

    fn state(&self) -> ConnectionState {
        self.inner().state.get()
    }

    fn add_state_listener(&self, listener: StateListener) -> ListenerId {
        self.inner().state.listeners().add(listener)
    }

    fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.inner().state.listeners().remove(id)
    }

    fn identity(&self) -> *const () {
        Arc::as_ptr(self.inner()).cast()
    }
}

impl<T: Transport> ClientInner<T> {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_cycle(&self) -> Option<Arc<Cycle>> {
        self.session().as_ref().map(|s| Arc::clone(&s.cycle))
    }

    fn transition(&self, event: Event) -> bool {
        match self.state.apply(event) {
            Some((from, to)) => {
                #[cfg(feature = "tracing")]
                if from != to {
                    tracing::info!(endpoint = %self.endpoint, %from, %to, "Connection state changed");
                }
                #[cfg(not(feature = "tracing"))]
                let _ = (from, to);
                true
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::trace!(endpoint = %self.endpoint, ?event, "Ignoring transition");
                false
            }
        }
    }

    async fn connect(self: &Arc<Self>, cancel: Option<CancellationToken>) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::invalid_operation("client has been disposed"));
        }

        let cycle = {
            let mut session = self.session();
            if !self.transition(Event::Connect) {
                return Err(Error::invalid_operation(format!(
                    "cannot connect while {}",
                    self.state.get()
                )));
            }

            // Registrations from an earlier `connect` are stale; reconnects keep theirs
            self.registry.clear();
            *self.budget.lock().unwrap_or_else(PoisonError::into_inner) =
                AttemptBudget::new(self.config.reconnect_attempts);

            let cycle = Arc::new(Cycle::new(cancel.as_ref()));
            *session = Some(Session {
                parent: cancel,
                cycle: Arc::clone(&cycle),
            });
            cycle
        };

        match self.establish(&cycle, false).await {
            Ok(stream) => {
                tokio::spawn(Arc::clone(self).run(cycle, stream));
                Ok(())
            }
            Err(e) => {
                self.settle(&cycle, Event::ConnectFailed { retry: false });
                Err(e)
            }
        }
    }

    fn disconnect(&self) -> Result<()> {
        let session = self.session();
        let Some(session) = session.as_ref() else {
            return Err(Error::invalid_operation("no active connection"));
        };

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.endpoint, "Disconnect requested");

        session.cycle.request_stop();
        self.transition(Event::Disconnect);
        self.registry.clear();
        Ok(())
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let session = self.session();
        if let Some(session) = session.as_ref() {
            session.cycle.request_stop();
            self.transition(Event::Disconnect);
        }
        self.registry.clear();
    }

    /// Connect, retrying under the attempt budget until it succeeds, the budget runs out,
    /// or the cycle is cancelled.
    async fn establish(&self, cycle: &Cycle, reconnect: bool) -> Result<Box<dyn FrameStream>> {
        let mut backoff = self.config.backoff();
        let mut attempt = 0_u32;

        loop {
            attempt = attempt.saturating_add(1);

            let error = match self.attempt(cycle, reconnect).await {
                Ok(stream) => {
                    if self.transition(Event::Connected) {
                        return Ok(stream);
                    }
                    // A disconnect won the race against the handshake
                    self.release(cycle).await;
                    return Err(Error::cancelled());
                }
                Err(e) => e,
            };

            if cycle.stop_requested() {
                return Err(Error::cancelled());
            }

            #[cfg(feature = "tracing")]
            tracing::warn!(endpoint = %self.endpoint, attempt, %error, "Unable to connect");
            #[cfg(not(feature = "tracing"))]
            let _ = attempt;
            self.handler.on_error(&error);

            let retry = self
                .budget
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_consume();
            if !retry {
                #[cfg(feature = "tracing")]
                tracing::error!(endpoint = %self.endpoint, attempt, "Reconnect attempts exhausted");
                return Err(error);
            }
            self.transition(Event::ConnectFailed { retry });

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.reconnect_interval);
            tokio::select! {
                () = cycle.token.cancelled() => return Err(Error::cancelled()),
                () = sleep(delay) => {}
            }
        }
    }

    /// One connect attempt: handshake, writer installation and the post-connect hook.
    async fn attempt(&self, cycle: &Cycle, reconnect: bool) -> Result<Box<dyn FrameStream>> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        self.handler
            .on_socket_created(&mut request)
            .map_err(Error::handler)?;

        let (sink, stream) = tokio::select! {
            () = cycle.token.cancelled() => return Err(Error::cancelled()),
            connected = self.transport.connect(request, &self.config) => connected?,
        };
        *cycle.writer.lock().await = Some(sink);

        let hook = tokio::select! {
            () = cycle.token.cancelled() => Err(Error::cancelled()),
            result = self.handler.on_connected(reconnect) => result.map_err(Error::handler),
        };
        if let Err(e) = hook {
            self.release(cycle).await;
            return Err(e);
        }

        Ok(stream)
    }

    /// Receive loop plus reconnect loop of one `connect` call.
    async fn run(self: Arc<Self>, mut cycle: Arc<Cycle>, mut stream: Box<dyn FrameStream>) {
        loop {
            let exit = ReceiveLoop::new(self.handler.as_ref(), &self.config)
                .run(stream.as_mut(), &cycle.token)
                .await;
            cycle.closed.cancel();
            drop(stream);
            self.release(&cycle).await;

            #[cfg(feature = "tracing")]
            tracing::debug!(endpoint = %self.endpoint, ?exit, "Receive loop finished");
            #[cfg(not(feature = "tracing"))]
            let _ = exit;

            let Some(next) = self.begin_reconnect(&cycle) else {
                self.settle(&cycle, Event::Dropped { retry: false });
                return;
            };
            cycle = next;

            match self.establish(&cycle, true).await {
                Ok(next_stream) => {
                    stream = next_stream;
                    self.schedule_resend(&cycle);
                }
                Err(_) => {
                    self.settle(&cycle, Event::ConnectFailed { retry: false });
                    return;
                }
            }
        }
    }

    /// After an exit of the receive loop: start a new cycle unless the exit was requested
    /// or no attempts are left.
    fn begin_reconnect(&self, old: &Arc<Cycle>) -> Option<Arc<Cycle>> {
        let mut session = self.session();
        let current = session
            .as_mut()
            .filter(|s| Arc::ptr_eq(&s.cycle, old))?;

        if old.stop_requested() {
            return None;
        }
        if !self
            .budget
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_consume()
        {
            return None;
        }

        let cycle = Arc::new(Cycle::new(current.parent.as_ref()));
        current.cycle = Arc::clone(&cycle);
        self.transition(Event::Dropped { retry: true });
        Some(cycle)
    }

    /// End the `connect` call that owns `cycle`. A requested stop always ends in
    /// `Disconnected`; otherwise `failure` is applied.
    fn settle(&self, cycle: &Arc<Cycle>, failure: Event) {
        let mut session = self.session();
        if session.as_ref().is_some_and(|s| Arc::ptr_eq(&s.cycle, cycle)) {
            *session = None;
        }

        if cycle.stop_requested() {
            self.transition(Event::Disconnect);
            self.transition(Event::Closed);
        } else {
            self.transition(failure);
        }
    }

    /// Close the cycle's socket, bounded by `disconnect_timeout`. Errors are swallowed.
    async fn release(&self, cycle: &Cycle) {
        let writer = cycle.writer.lock().await.take();
        let Some(mut writer) = writer else {
            return;
        };

        match timeout(self.config.disconnect_timeout, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Error while closing connection");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    endpoint = %self.endpoint,
                    timeout = ?self.config.disconnect_timeout,
                    "Timed out closing connection"
                );
            }
        }
    }

    fn schedule_resend(self: &Arc<Self>, cycle: &Arc<Cycle>) {
        if self.config.disable_auto_resend || self.registry.len() == 0 {
            return;
        }

        let this = Arc::clone(self);
        let cycle = Arc::clone(cycle);
        let delay = self.config.resend_timeout;

        tokio::spawn(async move {
            tokio::select! {
                () = cycle.closed.cancelled() => return,
                () = sleep(delay) => {}
            }
            if let Err(e) = this.resend(&cycle, &cycle.closed).await {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %this.endpoint, error = %e, "Resend pass aborted");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        });
    }

    /// Replay the stored commands on `cycle`. Ends early when `cancel` fires or the
    /// cycle's connection drops.
    async fn resend(&self, cycle: &Cycle, cancel: &CancellationToken) -> Result<usize> {
        let commands = self.registry.snapshot();

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.endpoint, count = commands.len(), "Resending commands");

        let mut sent = 0;
        for (index, command) in commands.iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::cancelled()),
                    () = cycle.closed.cancelled() => return Err(Error::cancelled()),
                    () = sleep(self.config.resend_interval) => {}
                }
            }
            if cancel.is_cancelled() || cycle.closed.is_cancelled() {
                return Err(Error::cancelled());
            }

            if let Some(hook) = &command.pre_send
                && let Err(e) = hook
                    .before_resend(command.subscription_id, cancel.clone())
                    .await
            {
                let error = Error::handler(e);
                #[cfg(feature = "tracing")]
                tracing::warn!(subscription_id = command.subscription_id, %error, "Pre-send hook failed");
                self.handler.on_error(&error);
                continue;
            }

            match Self::write_on(cycle, command.payload.clone(), command.kind).await {
                Ok(()) => {
                    sent += 1;
                    #[cfg(feature = "tracing")]
                    tracing::debug!(subscription_id = command.subscription_id, "Command resent");
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(subscription_id = command.subscription_id, error = %e, "Failed to resend command");
                    self.handler.on_error(&e);
                }
            }
        }

        Ok(sent)
    }

    /// The registry only changes once the write succeeded, so a failed send leaves the
    /// stored commands as they were.
    async fn send_command(&self, command: Command) -> Result<()> {
        let id = command.subscription_id;
        self.write(command.payload.clone(), command.kind).await?;

        if id > 0 {
            self.registry.push(command);
        } else if let Some(subscription_id) = id.checked_neg().filter(|n| *n > 0) {
            let removed = self.registry.remove(subscription_id);
            #[cfg(feature = "tracing")]
            tracing::debug!(subscription_id, removed, "Removed stored commands");
            #[cfg(not(feature = "tracing"))]
            let _ = removed;
        }
        Ok(())
    }

    async fn write(&self, payload: Bytes, kind: MessageKind) -> Result<()> {
        let cycle = self
            .current_cycle()
            .ok_or_else(|| Error::invalid_operation("no active connection"))?;
        Self::write_on(&cycle, payload, kind).await
    }

    /// Write through `cycle`'s socket. Fails once that connection has dropped, even if a
    /// newer cycle is up.
    async fn write_on(cycle: &Cycle, payload: Bytes, kind: MessageKind) -> Result<()> {
        let mut writer = tokio::select! {
            () = cycle.closed.cancelled() => return Err(Error::cancelled()),
            writer = cycle.writer.lock() => writer,
        };
        let sink = writer
            .as_mut()
            .ok_or_else(|| Error::invalid_operation("connection is not established"))?;

        tokio::select! {
            () = cycle.closed.cancelled() => Err(Error::cancelled()),
            result = sink.send(payload, kind) => result,
        }
    }
}
