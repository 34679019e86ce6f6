//! Composite state over several connections.
//!
//! A [`ConnectionAggregator`] observes any number of [`Connection`]s (for example a market
//! data feed and a trading channel) and republishes one composite [`ConnectionState`]
//! derived by [`composite`](crate::state::composite). It is itself a [`Connection`], so
//! aggregators nest.

#![expect(
    clippy::module_name_repetitions,
    reason = "Aggregator types include the module name for clarity when used outside this module"
)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::error::Error;
use crate::state::{self, ConnectionState, ListenerId, Listeners, StateListener};
use crate::ws::Connection;

/// Aggregates the states of several [`Connection`]s into one.
///
/// The composite is recomputed from the last observed state of every child on each child
/// notification, and published only when it changes. Mixed states that no precedence rule
/// covers (e.g. one child connected and another disconnected) keep the previous composite.
///
/// Cloning is cheap; clones share the same set of children.
///
/// # Example
///
/// ```rust, no_run
/// use std::sync::Arc;
///
/// use resilient_ws::aggregator::ConnectionAggregator;
/// use resilient_ws::state::ConnectionState;
/// use resilient_ws::ws::{Connection as _, ConnectionClient};
///
/// # async fn run(market: ConnectionClient, trading: ConnectionClient) -> resilient_ws::Result<()> {
/// let aggregator = ConnectionAggregator::new();
/// aggregator.add(Arc::new(market));
/// aggregator.add(Arc::new(trading));
///
/// aggregator.add_state_listener(Arc::new(|state: ConnectionState| println!("feeds are {state}")));
/// aggregator.connect(None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct ConnectionAggregator {
    inner: Arc<AggregatorInner>,
}

struct AggregatorInner {
    composite: Mutex<Composite>,
    tx: watch::Sender<ConnectionState>,
    listeners: Listeners,
    next_id: AtomicU64,
}

impl Default for AggregatorInner {
    fn default() -> Self {
        let (tx, _) = watch::channel(ConnectionState::default());
        Self {
            composite: Mutex::new(Composite::default()),
            tx,
            listeners: Listeners::default(),
            next_id: AtomicU64::new(0),
        }
    }
}

#[derive(Default)]
struct Composite {
    children: Vec<ConnectionWrapper>,
    state: ConnectionState,
}

/// A child connection with the last state observed from it.
struct ConnectionWrapper {
    id: u64,
    connection: Arc<dyn Connection>,
    last: ConnectionState,
    listener: ListenerId,
}

impl std::fmt::Debug for ConnectionAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let composite = self.inner.lock();
        f.debug_struct("ConnectionAggregator")
            .field("children", &composite.children.len())
            .field("state", &composite.state)
            .finish()
    }
}

impl ConnectionAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start observing `connection`. Returns `false` if it is already observed.
    ///
    /// Connections are compared by [`Connection::identity`], so two clones of one client
    /// count as one connection.
    pub fn add(&self, connection: Arc<dyn Connection>) -> bool {
        let mut composite = self.inner.lock();
        if composite
            .children
            .iter()
            .any(|child| same_connection(&child.connection, &connection))
        {
            return false;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<AggregatorInner> = Arc::downgrade(&self.inner);
        let listener = connection.add_state_listener(Arc::new(move |state: ConnectionState| {
            if let Some(inner) = weak.upgrade() {
                inner.on_child_state(id, state);
            }
        }));

        composite.children.push(ConnectionWrapper {
            id,
            last: connection.state(),
            connection,
            listener,
        });
        self.inner.recompute(&mut composite);
        true
    }

    /// Stop observing `connection`. Returns whether it was observed.
    pub fn remove(&self, connection: &Arc<dyn Connection>) -> bool {
        let mut composite = self.inner.lock();
        let Some(index) = composite
            .children
            .iter()
            .position(|child| same_connection(&child.connection, connection))
        else {
            return false;
        };

        let wrapper = composite.children.remove(index);
        wrapper.connection.remove_state_listener(wrapper.listener);
        self.inner.recompute(&mut composite);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().children.is_empty()
    }

    /// Subscribe to composite state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.tx.subscribe()
    }

    fn children(&self) -> Vec<Arc<dyn Connection>> {
        self.inner
            .lock()
            .children
            .iter()
            .map(|child| Arc::clone(&child.connection))
            .collect()
    }
}

#[async_trait]
impl Connection for ConnectionAggregator {
    /// Connect every child concurrently and wait for all of them.
    ///
    /// A failing child does not cancel its siblings; the first failure (in insertion order)
    /// is returned once all children have finished.
    async fn connect(&self, cancel: Option<CancellationToken>) -> Result<()> {
        let children = self.children();
        if children.is_empty() {
            return Err(Error::invalid_operation("no connections to connect"));
        }

        let results = join_all(children.iter().map(|child| child.connect(cancel.clone()))).await;
        results.into_iter().collect()
    }

    /// Ask every child to disconnect without waiting for any of them to close.
    fn disconnect(&self) -> Result<()> {
        for child in self.children() {
            if let Err(e) = child.disconnect() {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "Child connection refused to disconnect");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.inner.tx.borrow()
    }

    fn add_state_listener(&self, listener: StateListener) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    fn identity(&self) -> *const () {
        Arc::as_ptr(&self.inner).cast()
    }
}

impl Drop for AggregatorInner {
    fn drop(&mut self) {
        let composite = self
            .composite
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for child in composite.children.drain(..) {
            child.connection.remove_state_listener(child.listener);
        }
    }
}

impl AggregatorInner {
    fn lock(&self) -> MutexGuard<'_, Composite> {
        self.composite.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_child_state(&self, id: u64, state: ConnectionState) {
        let mut composite = self.lock();
        let Some(child) = composite.children.iter_mut().find(|child| child.id == id) else {
            return;
        };
        child.last = state;
        self.recompute(&mut composite);
    }

    /// Derive the composite from scratch and publish it if it changed. Runs under the
    /// composite lock so concurrent child notifications publish in a consistent order.
    fn recompute(&self, composite: &mut Composite) {
        let states: Vec<ConnectionState> = composite.children.iter().map(|c| c.last).collect();
        let Some(next) = state::composite(&states) else {
            return;
        };
        if next == composite.state {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(from = %composite.state, to = %next, children = states.len(), "Composite state changed");

        composite.state = next;
        self.tx.send_replace(next);
        self.listeners.notify(next);
    }
}

fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::eq(a.identity(), b.identity())
}
