//! Chat state container: the composition root for store, reducer and
//! reconciler.

use std::sync::Arc;

use chat_sync_core::{
    AddOutcome, Clock, Envelope, Message, MessageStore, ProtocolError, SyncObserver,
    SystemClock, TracingObserver,
};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{ChangeSet, LayeredReducer, OptimisticDraft, OptimisticReconciler};

/// Capacity of the change notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Published once per operation that changed something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// Monotonic counter, one step per published change.
    pub revision: u64,
    /// The message log changed.
    pub messages: bool,
    /// Layer or activity state changed.
    pub layers: bool,
}

/// Owns the message store, the layered reducer and the optimistic
/// reconciler, and applies every update as a single transaction.
///
/// Each public mutator applies its update completely and then notifies
/// subscribers exactly once, independent of how many internal fields moved.
/// Construct one per chat view; instances share nothing.
pub struct ChatState {
    store: MessageStore,
    reducer: LayeredReducer,
    reconciler: OptimisticReconciler,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn SyncObserver>,
    revision: u64,
    notifier: broadcast::Sender<StateChange>,
}

impl Default for ChatState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatState {
    /// Create a state container using the system clock and a logging
    /// observer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_collaborators(Arc::new(SystemClock), Arc::new(TracingObserver))
    }

    /// Create a state container with injected collaborators.
    #[must_use]
    pub fn with_collaborators(clock: Arc<dyn Clock>, observer: Arc<dyn SyncObserver>) -> Self {
        let (notifier, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store: MessageStore::new(),
            reducer: LayeredReducer::new(Arc::clone(&clock), Arc::clone(&observer)),
            reconciler: OptimisticReconciler::new(Arc::clone(&clock), Arc::clone(&observer)),
            clock,
            observer,
            revision: 0,
            notifier,
        }
    }

    /// Apply one envelope.
    ///
    /// A `message` carrying the `localId` of a tracked optimistic entry is
    /// treated as that entry's confirmation. An `error` naming a tracked
    /// `local_id` also fails that entry. Switching or loading a thread drops
    /// tracking for optimistic entries that left the store.
    pub fn handle_event(&mut self, envelope: &Envelope) -> bool {
        let changes = match envelope {
            Envelope::Message(fields) => {
                // an entry that left the store is confirmed through the add path
                let local_id = fields
                    .get("localId")
                    .and_then(Value::as_str)
                    .filter(|id| {
                        self.reconciler
                            .message_id(id)
                            .is_some_and(|message_id| self.store.contains(message_id))
                    })
                    .map(str::to_owned);
                if let Some(local_id) = local_id {
                    let confirmation = Value::Object(fields.clone());
                    if self
                        .reconciler
                        .confirm(&mut self.store, &local_id, &confirmation)
                    {
                        ChangeSet::MESSAGES
                    } else {
                        ChangeSet::NONE
                    }
                } else {
                    self.reducer.handle_event(envelope, &mut self.store)
                }
            }
            Envelope::Error(report) => {
                let mut changes = self.reducer.handle_event(envelope, &mut self.store);
                if let Some(local_id) = &report.local_id {
                    if self.reconciler.is_tracked(local_id)
                        && self
                            .reconciler
                            .reject(&mut self.store, local_id, &report.error_message)
                    {
                        changes = changes.union(ChangeSet::MESSAGES);
                    }
                }
                changes
            }
            Envelope::ThreadSwitch(_) | Envelope::ThreadLoaded(_) => {
                let changes = self.reducer.handle_event(envelope, &mut self.store);
                self.reconciler.prune(&self.store);
                changes
            }
            _ => self.reducer.handle_event(envelope, &mut self.store),
        };
        self.commit(changes)
    }

    /// Decode a raw text frame and apply it. Malformed frames are reported to
    /// the observer and dropped.
    pub fn handle_frame(&mut self, text: &str) -> bool {
        match Envelope::parse(text) {
            Ok(envelope) => self.handle_event(&envelope),
            Err(e) => {
                self.report_protocol_error(&e);
                false
            }
        }
    }

    /// Hand a frame that failed to decode elsewhere to the observer.
    pub fn report_protocol_error(&self, error: &ProtocolError) {
        self.observer.protocol_error(error);
    }

    /// Add a server-side message directly.
    pub fn add_message(&mut self, msg: Message) -> AddOutcome {
        let outcome = self.store.add(msg);
        self.commit(ChangeSet::MESSAGES);
        outcome
    }

    /// Insert an optimistic entry. Returns its local id.
    pub fn add_optimistic(&mut self, draft: OptimisticDraft) -> String {
        let local_id = self.reconciler.add_optimistic(&mut self.store, draft);
        self.commit(ChangeSet::MESSAGES);
        local_id
    }

    /// Merge a server confirmation into an optimistic entry.
    pub fn confirm(&mut self, local_id: &str, server_fields: &Value) -> bool {
        let applied = self
            .reconciler
            .confirm(&mut self.store, local_id, server_fields);
        self.commit_if(applied)
    }

    /// Mark an optimistic entry as failed.
    pub fn reject(&mut self, local_id: &str, reason: &str) -> bool {
        let applied = self.reconciler.reject(&mut self.store, local_id, reason);
        self.commit_if(applied)
    }

    /// Return a failed entry to pending.
    pub fn retry(&mut self, local_id: &str) -> bool {
        let applied = self.reconciler.retry(&mut self.store, local_id);
        self.commit_if(applied)
    }

    /// Edit an entry that is not yet confirmed.
    pub fn edit(&mut self, local_id: &str, content: &str) -> bool {
        let applied = self.reconciler.edit(&mut self.store, local_id, content);
        self.commit_if(applied)
    }

    /// Give up on a failed entry.
    pub fn abandon(&mut self, local_id: &str) -> bool {
        // the entry itself is unchanged; nothing to publish
        self.reconciler.abandon(&self.store, local_id)
    }

    /// Clear all three layers.
    pub fn reset_layers(&mut self) {
        self.reducer.reset_layers();
        self.commit(ChangeSet::LAYERS);
    }

    /// Remove every message. Optimistic entries stop being tracked.
    pub fn clear(&mut self) {
        self.store.clear();
        self.reconciler.prune(&self.store);
        self.commit(ChangeSet::MESSAGES);
    }

    fn commit_if(&mut self, applied: bool) -> bool {
        if applied {
            self.commit(ChangeSet::MESSAGES)
        } else {
            false
        }
    }

    fn commit(&mut self, changes: ChangeSet) -> bool {
        if !changes.any() {
            return false;
        }
        self.revision += 1;
        // no subscribers is fine
        let _ = self.notifier.send(StateChange {
            revision: self.revision,
            messages: changes.messages,
            layers: changes.layers,
        });
        true
    }

    /// All messages in order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    /// Get a message by id.
    #[must_use]
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.store.get(id)
    }

    #[must_use]
    pub const fn store(&self) -> &MessageStore {
        &self.store
    }

    #[must_use]
    pub const fn layers(&self) -> &LayeredReducer {
        &self.reducer
    }

    #[must_use]
    pub const fn reconciler(&self) -> &OptimisticReconciler {
        &self.reconciler
    }

    /// Current time according to the injected clock.
    #[must_use]
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Number of changes published so far.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Get a receiver for change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.notifier.subscribe()
    }

    /// Stream of change notifications. Lagged notifications are skipped.
    #[must_use]
    pub fn changes(&self) -> futures::stream::BoxStream<'static, StateChange> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }
}
