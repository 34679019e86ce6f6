//! Connection state machine shared by [`ConnectionClient`](crate::ws::ConnectionClient)
//! and [`ConnectionAggregator`](crate::aggregator::ConnectionAggregator).
//!
//! Transitions are expressed as pure functions ([`ConnectionState::on`] and
//! [`composite`]) so that every edge of the state machine can be exercised without
//! sockets or timers. The stateful pieces only apply those functions under a lock and
//! publish the result.

#![expect(
    clippy::module_name_repetitions,
    reason = "State types carry the module name for clarity when re-exported"
)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::ws::config::ReconnectAttempts;

/// Lifecycle state of a connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum_macros::Display)]
pub enum ConnectionState {
    /// No active cycle. Initial state, and the final state after an application disconnect.
    #[default]
    Disconnected,
    /// First connect of a cycle in progress (including its retries)
    Connecting,
    /// Connected on the first attempt sequence after `connect`
    Connected,
    /// Connected again after an unexpected drop; subscriptions are being replayed
    Restored,
    /// Re-establishing the connection after an unexpected drop
    Reconnecting,
    /// Application requested a disconnect that has not completed yet
    Disconnecting,
    /// Attempt budget exhausted
    Failed,
}

impl ConnectionState {
    /// Check if the connection is currently usable for sending.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Restored)
    }

    /// `Disconnected` and `Failed` end a cycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    /// Apply `event` to this state.
    ///
    /// Returns `None` when the event is not valid from this state; callers must
    /// leave the state untouched in that case.
    #[must_use]
    pub const fn on(self, event: Event) -> Option<Self> {
        match (self, event) {
            (Self::Disconnected | Self::Failed, Event::Connect) => Some(Self::Connecting),

            (Self::Connecting, Event::Connected) => Some(Self::Connected),
            (Self::Reconnecting, Event::Connected) => Some(Self::Restored),

            (Self::Connecting | Self::Reconnecting, Event::ConnectFailed { retry: true }) => {
                Some(self)
            }
            (Self::Connecting | Self::Reconnecting, Event::ConnectFailed { retry: false }) => {
                Some(Self::Failed)
            }

            (Self::Connected | Self::Restored, Event::Dropped { retry: true }) => {
                Some(Self::Reconnecting)
            }
            (Self::Connected | Self::Restored, Event::Dropped { retry: false }) => {
                Some(Self::Failed)
            }

            (
                Self::Connecting | Self::Connected | Self::Restored | Self::Reconnecting,
                Event::Disconnect,
            ) => Some(Self::Disconnecting),

            (Self::Disconnecting, Event::Closed) => Some(Self::Disconnected),

            _ => None,
        }
    }
}

/// Inputs that drive [`ConnectionState::on`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Application called `connect`
    Connect,
    /// Handshake and post-connect hook completed
    Connected,
    /// A connect attempt failed; `retry` tells whether the attempt budget allows another one
    ConnectFailed { retry: bool },
    /// The receive loop ended without the application asking for it
    Dropped { retry: bool },
    /// Application called `disconnect` (or disposed the client)
    Disconnect,
    /// The socket of a requested disconnect has been released
    Closed,
}

/// Derive the aggregate state of several connections.
///
/// Returns `None` for mixed states that no rule covers (and for an empty set);
/// the previous composite value is kept in that case.
#[must_use]
pub fn composite(states: &[ConnectionState]) -> Option<ConnectionState> {
    use ConnectionState::{Connected, Disconnected, Failed, Reconnecting, Restored};

    if states.is_empty() {
        return None;
    }

    if states.iter().all(|s| *s == Connected) {
        Some(Connected)
    } else if states.contains(&Reconnecting) {
        Some(Reconnecting)
    } else if states.iter().all(|s| matches!(s, Connected | Restored)) {
        Some(Restored)
    } else if states.iter().all(|s| *s == Failed) {
        Some(Failed)
    } else if states.iter().all(|s| matches!(s, Disconnected | Failed)) {
        Some(Disconnected)
    } else {
        None
    }
}

/// Remaining reconnect attempts for one `connect` call.
///
/// The budget is refilled by `connect` only; a successful reconnect does not refill it,
/// so `Limited(n)` bounds the total number of retries (failed connects and drops alike)
/// over the lifetime of the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptBudget {
    remaining: Option<u32>,
}

impl AttemptBudget {
    #[must_use]
    pub const fn new(attempts: ReconnectAttempts) -> Self {
        let remaining = match attempts {
            ReconnectAttempts::Limited(n) => Some(n),
            ReconnectAttempts::Unlimited => None,
        };
        Self { remaining }
    }

    /// Take one attempt out of the budget. Returns `false` when none is left.
    pub fn try_consume(&mut self) -> bool {
        match &mut self.remaining {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }

    /// `None` means unlimited.
    #[must_use]
    pub const fn remaining(&self) -> Option<u32> {
        self.remaining
    }
}

/// Callback invoked on every state change.
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Handle returned by `add_state_listener`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Explicit observer registry, for implementors of [`Connection`](crate::ws::Connection).
#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, StateListener)>>,
}

impl Listeners {
    pub fn add(&self, listener: StateListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Invoke every listener with `state`. The registry lock is released before the calls
    /// so listeners may add or remove listeners.
    pub fn notify(&self, state: ConnectionState) {
        let snapshot: Vec<StateListener> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(state);
        }
    }
}

/// Current state of one connection plus its publication channels.
///
/// All mutations go through [`StateCell::apply`], which holds the state lock while
/// publishing, so listeners observe transitions in the order they happened.
pub(crate) struct StateCell {
    current: Mutex<ConnectionState>,
    tx: watch::Sender<ConnectionState>,
    listeners: Listeners,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::default());
        Self {
            current: Mutex::new(ConnectionState::default()),
            tx,
            listeners: Listeners::default(),
        }
    }

    /// Reads the published value, so it never waits on a transition in progress and is
    /// safe to call from a listener.
    pub(crate) fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Apply `event` and publish the new state if it differs from the old one.
    ///
    /// Returns the previous and the new state, or `None` if the event was rejected.
    pub(crate) fn apply(&self, event: Event) -> Option<(ConnectionState, ConnectionState)> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *current;
        let next = previous.on(event)?;

        if next != previous {
            *current = next;
            self.tx.send_replace(next);
            self.listeners.notify(next);
        }

        Some((previous, next))
    }

    pub(crate) fn receiver(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub(crate) fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::{
        Connected, Connecting, Disconnected, Disconnecting, Failed, Reconnecting, Restored,
    };
    use super::*;

    #[test]
    fn first_connect_path() {
        let s = Disconnected.on(Event::Connect).unwrap();
        assert_eq!(s, Connecting, "connect starts a cycle");
        assert_eq!(s.on(Event::Connected), Some(Connected));
    }

    #[test]
    fn reconnect_path_ends_restored() {
        let s = Connected.on(Event::Dropped { retry: true }).unwrap();
        assert_eq!(s, Reconnecting, "drop with budget left reconnects");
        assert_eq!(
            s.on(Event::ConnectFailed { retry: true }),
            Some(Reconnecting)
        );
        assert_eq!(s.on(Event::Connected), Some(Restored));
        assert_eq!(
            Restored.on(Event::Dropped { retry: true }),
            Some(Reconnecting)
        );
    }

    #[test]
    fn exhausted_budget_fails() {
        assert_eq!(Connecting.on(Event::ConnectFailed { retry: false }), Some(Failed));
        assert_eq!(
            Reconnecting.on(Event::ConnectFailed { retry: false }),
            Some(Failed)
        );
        assert_eq!(Connected.on(Event::Dropped { retry: false }), Some(Failed));
    }

    #[test]
    fn disconnect_overrides_any_active_state() {
        for state in [Connecting, Connected, Restored, Reconnecting] {
            assert_eq!(
                state.on(Event::Disconnect),
                Some(Disconnecting),
                "{state} should accept disconnect"
            );
        }
        assert_eq!(Disconnecting.on(Event::Closed), Some(Disconnected));
    }

    #[test]
    fn disconnecting_ignores_drops_and_failures() {
        assert_eq!(Disconnecting.on(Event::Dropped { retry: false }), None);
        assert_eq!(Disconnecting.on(Event::ConnectFailed { retry: false }), None);
        assert_eq!(Disconnecting.on(Event::Connected), None);
    }

    #[test]
    fn terminal_states_only_accept_connect() {
        for state in [Disconnected, Failed] {
            assert_eq!(state.on(Event::Connected), None);
            assert_eq!(state.on(Event::Dropped { retry: true }), None);
            assert_eq!(state.on(Event::Disconnect), None);
            assert_eq!(state.on(Event::Closed), None);
            assert_eq!(state.on(Event::Connect), Some(Connecting));
        }
    }

    #[test]
    fn active_states_reject_connect() {
        for state in [Connecting, Connected, Restored, Reconnecting, Disconnecting] {
            assert_eq!(state.on(Event::Connect), None, "{state} must reject connect");
        }
    }

    #[test]
    fn composite_precedence() {
        assert_eq!(composite(&[Connected, Connected]), Some(Connected));
        assert_eq!(composite(&[Connected, Reconnecting]), Some(Reconnecting));
        assert_eq!(composite(&[Failed, Reconnecting]), Some(Reconnecting));
        assert_eq!(composite(&[Connected, Restored]), Some(Restored));
        assert_eq!(composite(&[Connected, Restored, Connected]), Some(Restored));
        assert_eq!(composite(&[Failed, Failed]), Some(Failed));
        assert_eq!(composite(&[Disconnected, Failed]), Some(Disconnected));
        assert_eq!(composite(&[Connected, Disconnected]), None);
        assert_eq!(composite(&[Connecting, Connected]), None);
        assert_eq!(composite(&[]), None);
    }

    #[test]
    fn limited_budget_counts_down() {
        let mut budget = AttemptBudget::new(ReconnectAttempts::Limited(2));
        assert!(budget.try_consume(), "first retry allowed");
        assert!(budget.try_consume(), "second retry allowed");
        assert!(!budget.try_consume(), "third retry rejected");
        assert_eq!(budget.remaining(), Some(0));
    }

    #[test]
    fn zero_budget_never_retries() {
        let mut budget = AttemptBudget::new(ReconnectAttempts::Limited(0));
        assert!(!budget.try_consume(), "no retries configured");
    }

    #[test]
    fn unlimited_budget_never_runs_out() {
        let mut budget = AttemptBudget::new(ReconnectAttempts::Unlimited);
        for _ in 0..1_000 {
            assert!(budget.try_consume(), "unlimited budget");
        }
        assert_eq!(budget.remaining(), None);
    }

    #[test]
    fn state_cell_publishes_changes_in_order() {
        let cell = StateCell::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = cell.listeners().add(Arc::new(move |state: ConnectionState| {
            sink.lock().unwrap().push(state);
        }));

        assert!(cell.apply(Event::Connect).is_some(), "connect accepted");
        assert!(cell.apply(Event::Closed).is_none(), "closed rejected");
        assert!(
            cell.apply(Event::ConnectFailed { retry: true }).is_some(),
            "retry accepted"
        );
        assert!(cell.apply(Event::Connected).is_some(), "connected accepted");

        // Retrying keeps the state, so only two notifications fire.
        assert_eq!(*seen.lock().unwrap(), vec![Connecting, Connected]);
        assert_eq!(*cell.receiver().borrow(), Connected);

        assert!(cell.listeners().remove(id), "listener registered");
        assert!(!cell.listeners().remove(id), "listener already removed");
    }
}
