use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde::Serialize;

use super::traits::PreSendHook;
use super::transport::MessageKind;
use crate::Result;

/// An outbound message plus its replay metadata.
///
/// A positive `subscription_id` marks the command as persistent: it is stored and replayed
/// after every reconnect. A negative id removes the earlier registrations of `-id` (the
/// unsubscribe path) and is itself never stored. `0` is a plain one-off message.
#[derive(Clone)]
pub struct Command {
    pub(crate) payload: Bytes,
    pub(crate) kind: MessageKind,
    pub(crate) subscription_id: i64,
    pub(crate) pre_send: Option<Arc<dyn PreSendHook>>,
}

impl Command {
    #[must_use]
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::new(Bytes::from(text.into()), MessageKind::Text)
    }

    #[must_use]
    pub fn binary<B: Into<Bytes>>(payload: B) -> Self {
        Self::new(payload.into(), MessageKind::Binary)
    }

    /// Serialize `request` as a JSON text message.
    pub fn json<R: Serialize + ?Sized>(request: &R) -> Result<Self> {
        let json = serde_json::to_vec(request)?;
        Ok(Self::new(Bytes::from(json), MessageKind::Text))
    }

    fn new(payload: Bytes, kind: MessageKind) -> Self {
        Self {
            payload,
            kind,
            subscription_id: 0,
            pre_send: None,
        }
    }

    #[must_use]
    pub fn with_subscription_id(mut self, subscription_id: i64) -> Self {
        self.subscription_id = subscription_id;
        self
    }

    #[must_use]
    pub fn with_pre_send(mut self, hook: Arc<dyn PreSendHook>) -> Self {
        self.pre_send = Some(hook);
        self
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn subscription_id(&self) -> i64 {
        self.subscription_id
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("payload_len", &self.payload.len())
            .field("kind", &self.kind)
            .field("subscription_id", &self.subscription_id)
            .field("pre_send", &self.pre_send.is_some())
            .finish()
    }
}

/// Commands eligible for replay, in registration order.
///
/// Registrations with the same id accumulate: each one is replayed independently.
#[derive(Default)]
pub(crate) struct ResendRegistry {
    commands: Mutex<Vec<Command>>,
}

impl ResendRegistry {
    pub(crate) fn push(&self, command: Command) {
        debug_assert!(command.subscription_id > 0, "only persistent commands are stored");
        self.lock().push(command);
    }

    /// Remove every registration of `subscription_id`. Returns how many were removed.
    pub(crate) fn remove(&self, subscription_id: i64) -> usize {
        let mut commands = self.lock();
        let before = commands.len();
        commands.retain(|c| c.subscription_id != subscription_id);
        before - commands.len()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    /// Copy of the current registrations; the lock is not held while replaying.
    pub(crate) fn snapshot(&self) -> Vec<Command> {
        self.lock().clone()
    }

    pub(crate) fn ids(&self) -> Vec<i64> {
        self.lock().iter().map(|c| c.subscription_id).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Command>> {
        // A Vec of commands has no inconsistent intermediate state, so poisoning is recoverable
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn subscribe(id: i64, channel: &str) -> Command {
        Command::json(&json!({ "op": "subscribe", "channel": channel }))
            .unwrap()
            .with_subscription_id(id)
    }

    #[test]
    fn registrations_with_the_same_id_accumulate() {
        let registry = ResendRegistry::default();
        registry.push(subscribe(7, "trades"));
        registry.push(subscribe(7, "book"));
        registry.push(subscribe(8, "ticker"));

        assert_eq!(registry.ids(), vec![7, 7, 8]);
        assert_eq!(registry.remove(7), 2);
        assert_eq!(registry.ids(), vec![8]);
        assert_eq!(registry.remove(7), 0);
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let registry = ResendRegistry::default();
        registry.push(subscribe(1, "trades"));

        let snapshot = registry.snapshot();
        registry.push(subscribe(2, "book"));
        registry.clear();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].subscription_id(), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn json_commands_are_text() {
        let command = subscribe(3, "trades");

        assert_eq!(command.kind(), MessageKind::Text);
        assert_eq!(
            command.payload().as_ref(),
            br#"{"channel":"trades","op":"subscribe"}"#
        );
    }
}
