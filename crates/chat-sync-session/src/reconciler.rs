//! Optimistic entries and their reconciliation with server confirmations.
//!
//! An entry moves `pending -> confirmed` (terminal), or
//! `pending -> failed -> pending` for as long as the caller keeps retrying.
//! None of the operations return errors: requests that cannot be applied are
//! no-ops reported to the [`SyncObserver`].

use std::{collections::HashMap, sync::Arc};

use chat_sync_core::{
    Clock, Message, MessageId, MessageStatus, MessageStore, ReconciliationError, Role,
    SyncObserver, SystemClock, TracingObserver, strip_client_owned,
};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A locally authored entry, before it is inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticDraft {
    /// Generated if absent.
    pub local_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub extra: Map<String, Value>,
}

impl OptimisticDraft {
    /// A user message with a generated local id.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            local_id: None,
            role: Role::User,
            content: content.into(),
            extra: Map::new(),
        }
    }

    /// Use a caller-chosen local id.
    #[must_use]
    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    /// Attach an extra field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone)]
struct TrackedEntry {
    message_id: MessageId,
    edited_at: Option<i64>,
}

/// Tracks optimistic entries by local id until they are confirmed or
/// abandoned.
pub struct OptimisticReconciler {
    tracked: HashMap<String, TrackedEntry>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn SyncObserver>,
}

impl Default for OptimisticReconciler {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(TracingObserver))
    }
}

impl OptimisticReconciler {
    /// Create a reconciler with injected collaborators.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, observer: Arc<dyn SyncObserver>) -> Self {
        Self {
            tracked: HashMap::new(),
            clock,
            observer,
        }
    }

    /// Insert a pending, optimistic entry. Returns its local id.
    ///
    /// The entry is readable from `store` as soon as this returns. A
    /// requested local id that is already in use is reported and replaced
    /// by a generated one, so existing entries are never overwritten.
    pub fn add_optimistic(&mut self, store: &mut MessageStore, draft: OptimisticDraft) -> String {
        let local_id = match draft.local_id {
            Some(id) if store.contains(&id) || self.tracked.contains_key(&id) => {
                self.observer
                    .reconciliation_error(&ReconciliationError::LocalIdTaken(id));
                Uuid::new_v4().to_string()
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let msg = Message {
            id: local_id.clone(),
            role: draft.role,
            content: draft.content,
            created_at: self.clock.now_ms(),
            status: MessageStatus::Pending,
            is_optimistic: true,
            local_id: Some(local_id.clone()),
            server_id: None,
            error: None,
            updated_at: None,
            extra: draft.extra,
        };
        store.add(msg);

        tracing::debug!(local_id = %local_id, "Optimistic entry added");
        self.tracked.insert(
            local_id.clone(),
            TrackedEntry {
                message_id: local_id.clone(),
                edited_at: None,
            },
        );
        local_id
    }

    /// Merge a server confirmation into a pending entry.
    ///
    /// Fields absent from `server_fields` keep their local value. If the
    /// confirmation carries an `updatedAt` older than a local edit, the
    /// locally edited content is kept. A server `id` re-keys the entry.
    pub fn confirm(&mut self, store: &mut MessageStore, local_id: &str, server_fields: &Value) -> bool {
        let result = self.try_confirm(store, local_id, server_fields);
        self.report(result)
    }

    /// Mark a pending entry as failed. The entry stays in the store.
    pub fn reject(&mut self, store: &mut MessageStore, local_id: &str, reason: &str) -> bool {
        let result = self.transition(store, local_id, MessageStatus::Failed, |m| {
            m.error = Some(reason.to_string());
        });
        self.report(result)
    }

    /// Put a failed entry back to pending.
    pub fn retry(&mut self, store: &mut MessageStore, local_id: &str) -> bool {
        let result = self.transition(store, local_id, MessageStatus::Pending, |m| {
            m.is_optimistic = true;
            m.error = None;
        });
        self.report(result)
    }

    /// Edit the content of an entry that is not yet confirmed.
    pub fn edit(&mut self, store: &mut MessageStore, local_id: &str, content: &str) -> bool {
        let now = self.clock.now_ms();
        let result = self.lookup(store, local_id).map(|(message_id, _)| {
            store.update(&message_id, |m| {
                m.content = content.to_string();
                m.updated_at = Some(now);
            });
            if let Some(entry) = self.tracked.get_mut(local_id) {
                entry.edited_at = Some(now);
            }
        });
        self.report(result)
    }

    /// Stop tracking a failed entry. It stays visible as failed.
    pub fn abandon(&mut self, store: &MessageStore, local_id: &str) -> bool {
        let result = self.lookup(store, local_id).and_then(|(_, status)| {
            if status == MessageStatus::Failed {
                self.tracked.remove(local_id);
                Ok(())
            } else {
                Err(ReconciliationError::NotFailed(local_id.to_string()))
            }
        });
        self.report(result)
    }

    /// Whether `local_id` is still awaiting reconciliation.
    #[must_use]
    pub fn is_tracked(&self, local_id: &str) -> bool {
        self.tracked.contains_key(local_id)
    }

    /// Store id of a tracked entry.
    #[must_use]
    pub fn message_id(&self, local_id: &str) -> Option<&str> {
        self.tracked.get(local_id).map(|e| e.message_id.as_str())
    }

    /// Forget tracked entries whose message is no longer in `store`.
    ///
    /// Called after the store is cleared or replaced wholesale.
    pub fn prune(&mut self, store: &MessageStore) {
        let before = self.tracked.len();
        self.tracked
            .retain(|_, entry| store.contains(&entry.message_id));
        let dropped = before - self.tracked.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Pruned optimistic entries no longer in the store");
        }
    }

    /// Local ids of every tracked entry.
    #[must_use]
    pub fn tracked_ids(&self) -> Vec<String> {
        self.tracked.keys().cloned().collect()
    }

    fn try_confirm(
        &mut self,
        store: &mut MessageStore,
        local_id: &str,
        server_fields: &Value,
    ) -> Result<(), ReconciliationError> {
        let (message_id, status) = self.lookup(store, local_id)?;
        if !status.can_transition_to(MessageStatus::Confirmed) {
            return Err(ReconciliationError::InvalidTransition {
                local_id: local_id.to_string(),
                from: status,
                to: MessageStatus::Confirmed,
            });
        }

        let Value::Object(fields) = server_fields else {
            return Err(ReconciliationError::MalformedConfirmation {
                local_id: local_id.to_string(),
                reason: "confirmation is not an object".into(),
            });
        };

        let mut patch = fields.clone();
        strip_client_owned(&mut patch);

        let edited_at = self.tracked.get(local_id).and_then(|e| e.edited_at);
        let confirmed_at = fields.get("updatedAt").and_then(Value::as_i64);
        if let (Some(edited), Some(confirmed)) = (edited_at, confirmed_at) {
            if confirmed < edited {
                tracing::debug!(local_id, "Confirmation predates local edit, keeping local content");
                patch.remove("content");
                patch.remove("updatedAt");
            }
        }

        let current = store
            .get(&message_id)
            .ok_or_else(|| ReconciliationError::UnknownLocalId(local_id.to_string()))?;
        let mut merged =
            current
                .merged(&patch)
                .map_err(|e| ReconciliationError::MalformedConfirmation {
                    local_id: local_id.to_string(),
                    reason: e.to_string(),
                })?;

        merged.status = MessageStatus::Confirmed;
        merged.is_optimistic = false;
        merged.error = None;
        merged.local_id = Some(local_id.to_string());

        let mut target = merged.id.clone();
        if target != message_id && !store.rekey(&message_id, &target) {
            tracing::warn!(
                local_id,
                server_id = %target,
                "Server id already present, keeping local id"
            );
            merged.server_id.get_or_insert_with(|| target.clone());
            target.clone_from(&message_id);
            merged.id.clone_from(&message_id);
        }
        store.update(&target, |m| *m = merged);

        self.tracked.remove(local_id);
        tracing::debug!(local_id, id = %target, "Optimistic entry confirmed");
        Ok(())
    }

    fn transition<F>(
        &self,
        store: &mut MessageStore,
        local_id: &str,
        to: MessageStatus,
        apply: F,
    ) -> Result<(), ReconciliationError>
    where
        F: FnOnce(&mut Message),
    {
        let (message_id, from) = self.lookup(store, local_id)?;
        if !from.can_transition_to(to) {
            return Err(ReconciliationError::InvalidTransition {
                local_id: local_id.to_string(),
                from,
                to,
            });
        }
        store.update(&message_id, |m| {
            m.status = to;
            apply(m);
        });
        Ok(())
    }

    fn lookup(
        &self,
        store: &MessageStore,
        local_id: &str,
    ) -> Result<(MessageId, MessageStatus), ReconciliationError> {
        self.tracked
            .get(local_id)
            .and_then(|entry| store.get(&entry.message_id))
            .map(|m| (m.id.clone(), m.status))
            .ok_or_else(|| ReconciliationError::UnknownLocalId(local_id.to_string()))
    }

    fn report(&self, result: Result<(), ReconciliationError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                self.observer.reconciliation_error(&e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chat_sync_core::ManualClock;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingObserver {
        errors: Mutex<Vec<ReconciliationError>>,
    }

    impl SyncObserver for RecordingObserver {
        fn reconciliation_error(&self, error: &ReconciliationError) {
            self.errors.lock().unwrap().push(error.clone());
        }
    }

    struct Fixture {
        reconciler: OptimisticReconciler,
        store: MessageStore,
        clock: ManualClock,
        observer: Arc<RecordingObserver>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(1_000);
        let observer = Arc::new(RecordingObserver::default());
        Fixture {
            reconciler: OptimisticReconciler::new(Arc::new(clock.clone()), observer.clone()),
            store: MessageStore::new(),
            clock,
            observer,
        }
    }

    impl Fixture {
        fn add(&mut self, local_id: &str, content: &str) -> String {
            self.reconciler.add_optimistic(
                &mut self.store,
                OptimisticDraft::user(content).with_local_id(local_id),
            )
        }

        fn errors(&self) -> Vec<ReconciliationError> {
            self.observer.errors.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_add_optimistic_is_visible_immediately() {
        let mut f = fixture();
        let id = f.add("L1", "hi");

        assert_eq!(id, "L1");
        let msg = f.store.get("L1").unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.is_optimistic);
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.created_at, 1_000);
        assert!(f.reconciler.is_tracked("L1"));
    }

    #[test]
    fn test_generated_local_id() {
        let mut f = fixture();
        let id = f
            .reconciler
            .add_optimistic(&mut f.store, OptimisticDraft::user("x"));

        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(f.store.get(&id).unwrap().local_id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_confirm_scenario() {
        let mut f = fixture();
        f.add("L1", "hi");

        assert!(f.reconciler.confirm(&mut f.store, "L1", &json!({"serverId": "S1"})));

        let msg = f.store.get("L1").unwrap();
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.server_id.as_deref(), Some("S1"));
        assert!(!msg.is_optimistic);
        assert_eq!(msg.status, MessageStatus::Confirmed);
        assert!(!f.reconciler.is_tracked("L1"));
        assert!(f.errors().is_empty());
    }

    #[test]
    fn test_confirm_preserves_local_fields() {
        let mut f = fixture();
        f.reconciler.add_optimistic(
            &mut f.store,
            OptimisticDraft::user("hi")
                .with_local_id("L1")
                .with_field("threadId", json!("t1")),
        );

        f.reconciler.confirm(
            &mut f.store,
            "L1",
            &json!({"createdAt": 42, "tokens": 3, "isOptimistic": true, "status": "failed"}),
        );

        let msg = f.store.get("L1").unwrap();
        assert_eq!(msg.created_at, 42);
        assert_eq!(msg.extra_field("threadId"), Some(&json!("t1")));
        assert_eq!(msg.extra_field("tokens"), Some(&json!(3)));
        assert_eq!(msg.role, Role::User);
        assert!(!msg.is_optimistic);
        assert_eq!(msg.status, MessageStatus::Confirmed);
    }

    #[test]
    fn test_confirm_with_server_id_rekeys() {
        let mut f = fixture();
        f.add("L1", "hi");

        f.reconciler.confirm(&mut f.store, "L1", &json!({"id": "S1"}));

        assert!(f.store.get("L1").is_none());
        let msg = f.store.get("S1").unwrap();
        assert_eq!(msg.local_id.as_deref(), Some("L1"));
        assert_eq!(msg.content, "hi");
        assert_eq!(f.store.len(), 1);
    }

    #[test]
    fn test_confirm_with_taken_server_id_keeps_local_id() {
        let mut f = fixture();
        f.store.add(Message::new("S1", Role::User, "echo", 0));
        f.add("L1", "hi");

        assert!(f.reconciler.confirm(&mut f.store, "L1", &json!({"id": "S1"})));

        let msg = f.store.get("L1").unwrap();
        assert_eq!(msg.server_id.as_deref(), Some("S1"));
        assert_eq!(msg.status, MessageStatus::Confirmed);
        assert_eq!(f.store.get("S1").unwrap().content, "echo");
    }

    #[test]
    fn test_unknown_local_id_is_reported() {
        let mut f = fixture();

        assert!(!f.reconciler.confirm(&mut f.store, "ghost", &json!({})));
        assert!(!f.reconciler.reject(&mut f.store, "ghost", "x"));
        assert!(!f.reconciler.retry(&mut f.store, "ghost"));

        assert_eq!(
            f.errors(),
            vec![
                ReconciliationError::UnknownLocalId("ghost".into()),
                ReconciliationError::UnknownLocalId("ghost".into()),
                ReconciliationError::UnknownLocalId("ghost".into()),
            ]
        );
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_malformed_confirmation_leaves_entry_pending() {
        let mut f = fixture();
        f.add("L1", "hi");

        assert!(!f.reconciler.confirm(&mut f.store, "L1", &json!("nope")));
        assert!(!f.reconciler.confirm(&mut f.store, "L1", &json!({"content": 5})));

        let msg = f.store.get("L1").unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.content, "hi");
        assert!(f.reconciler.is_tracked("L1"));
        assert_eq!(f.errors().len(), 2);
        assert!(matches!(
            f.errors()[0],
            ReconciliationError::MalformedConfirmation { .. }
        ));
    }

    #[test]
    fn test_reject_then_retry_then_confirm() {
        let mut f = fixture();
        f.add("L1", "hi");

        assert!(f.reconciler.reject(&mut f.store, "L1", "network down"));
        let msg = f.store.get("L1").unwrap();
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.error.as_deref(), Some("network down"));

        // a failed entry cannot be confirmed directly
        assert!(!f.reconciler.confirm(&mut f.store, "L1", &json!({})));

        assert!(f.reconciler.retry(&mut f.store, "L1"));
        let msg = f.store.get("L1").unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.is_optimistic);
        assert!(msg.error.is_none());

        assert!(f.reconciler.confirm(&mut f.store, "L1", &json!({})));
        assert_eq!(f.store.get("L1").unwrap().status, MessageStatus::Confirmed);
    }

    #[test]
    fn test_confirmed_is_terminal() {
        let mut f = fixture();
        f.add("L1", "hi");
        f.reconciler.confirm(&mut f.store, "L1", &json!({}));

        assert!(!f.reconciler.reject(&mut f.store, "L1", "late"));
        assert!(!f.reconciler.retry(&mut f.store, "L1"));
        assert_eq!(f.store.get("L1").unwrap().status, MessageStatus::Confirmed);
    }

    #[test]
    fn test_invalid_transitions_are_reported() {
        let mut f = fixture();
        f.add("L1", "hi");

        assert!(!f.reconciler.retry(&mut f.store, "L1"));
        assert_eq!(
            f.errors(),
            vec![ReconciliationError::InvalidTransition {
                local_id: "L1".into(),
                from: MessageStatus::Pending,
                to: MessageStatus::Pending,
            }]
        );
    }

    #[test]
    fn test_stale_confirmation_keeps_later_local_edit() {
        let mut f = fixture();
        f.add("L1", "first draft");
        f.clock.set(2_000);
        assert!(f.reconciler.edit(&mut f.store, "L1", "second draft"));

        f.reconciler.confirm(
            &mut f.store,
            "L1",
            &json!({"content": "first draft", "updatedAt": 1_500, "serverId": "S1"}),
        );

        let msg = f.store.get("L1").unwrap();
        assert_eq!(msg.content, "second draft");
        assert_eq!(msg.updated_at, Some(2_000));
        assert_eq!(msg.server_id.as_deref(), Some("S1"));
        assert_eq!(msg.status, MessageStatus::Confirmed);
    }

    #[test]
    fn test_newer_confirmation_wins_over_local_edit() {
        let mut f = fixture();
        f.add("L1", "draft");
        f.clock.set(2_000);
        f.reconciler.edit(&mut f.store, "L1", "edited");

        f.reconciler.confirm(
            &mut f.store,
            "L1",
            &json!({"content": "server copy", "updatedAt": 3_000}),
        );

        let msg = f.store.get("L1").unwrap();
        assert_eq!(msg.content, "server copy");
        assert_eq!(msg.updated_at, Some(3_000));
    }

    #[test]
    fn test_taken_local_id_never_overwrites() {
        let mut f = fixture();
        f.store.add(Message::new("S1", Role::Assistant, "server copy", 0));

        let id = f.add("S1", "mine");

        assert_ne!(id, "S1");
        assert_eq!(f.store.len(), 2);
        assert_eq!(f.store.get("S1").unwrap().content, "server copy");
        assert!(!f.store.get("S1").unwrap().is_optimistic);
        assert_eq!(f.store.get(&id).unwrap().content, "mine");
        assert!(f.reconciler.is_tracked(&id));
        assert!(!f.reconciler.is_tracked("S1"));
        assert_eq!(
            f.errors(),
            vec![ReconciliationError::LocalIdTaken("S1".into())]
        );
    }

    #[test]
    fn test_reused_pending_local_id_keeps_first_entry() {
        let mut f = fixture();
        f.add("L1", "first");
        let second = f.add("L1", "second");

        assert_ne!(second, "L1");
        assert_eq!(f.store.get("L1").unwrap().content, "first");
        assert_eq!(f.reconciler.tracked_ids().len(), 2);
        assert_eq!(f.errors().len(), 1);
    }

    #[test]
    fn test_prune_drops_entries_missing_from_store() {
        let mut f = fixture();
        f.add("L1", "a");
        f.add("L2", "b");
        f.store.clear();
        f.add("L3", "c");

        f.reconciler.prune(&f.store);

        assert_eq!(f.reconciler.tracked_ids(), vec!["L3".to_string()]);
    }

    #[test]
    fn test_abandon_only_failed_entries() {
        let mut f = fixture();
        f.add("L1", "hi");

        assert!(!f.reconciler.abandon(&f.store, "L1"));
        assert_eq!(
            f.errors(),
            vec![ReconciliationError::NotFailed("L1".into())]
        );

        f.reconciler.reject(&mut f.store, "L1", "nope");
        assert!(f.reconciler.abandon(&f.store, "L1"));
        assert!(!f.reconciler.is_tracked("L1"));

        let msg = f.store.get("L1").unwrap();
        assert_eq!(msg.status, MessageStatus::Failed);
    }
}
