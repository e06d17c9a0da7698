//! Layered reducer for streaming agent-run events.
//!
//! A backend run is observed at three resolutions:
//! - fast: who is running and which tools fired
//! - medium: the current thought and the accumulating partial answer
//! - slow: completed sub-agents and the final report

use std::sync::Arc;

use chat_sync_core::{
    Clock, Envelope, Message, MessageStore, ProtocolError, Role, SyncObserver, SystemClock,
    TracingObserver, strip_client_owned,
    envelope::{
        AgentCompleted, AgentProgress, AgentStarted, AgentStatus, AgentThinking, ErrorReport,
        MessageUpdate, ThreadLoaded,
    },
};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Highest-frequency, lowest-detail view of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FastLayer {
    pub agent_name: String,
    /// Tools in the order they started. Repeats are kept.
    pub active_tools: Vec<String>,
    pub timestamp: Option<f64>,
    pub run_id: Option<String>,
}

/// Mid-frequency view of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediumLayer {
    pub thought: String,
    /// Only ever appended to within a run.
    pub partial_content: String,
    pub step_number: u32,
    pub total_steps: u32,
    pub agent_name: String,
}

/// A sub-agent that finished during the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedAgent {
    pub agent_name: String,
    pub duration: f64,
    pub result: Value,
    pub metrics: Value,
}

/// Low-frequency, most detailed view of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowLayer {
    pub completed_agents: Vec<CompletedAgent>,
    pub final_report: Option<Value>,
    pub total_duration: Option<f64>,
}

/// Presence-style agent signals that live outside any single run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActivity {
    pub status: Option<AgentStatus>,
    pub typing: bool,
    pub progress: Option<AgentProgress>,
}

/// Which parts of the state an update touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub layers: bool,
    pub messages: bool,
}

impl ChangeSet {
    pub const NONE: Self = Self {
        layers: false,
        messages: false,
    };
    pub const LAYERS: Self = Self {
        layers: true,
        messages: false,
    };
    pub const MESSAGES: Self = Self {
        layers: false,
        messages: true,
    };
    pub const ALL: Self = Self {
        layers: true,
        messages: true,
    };

    /// Whether anything changed.
    #[must_use]
    pub const fn any(self) -> bool {
        self.layers || self.messages
    }

    /// Union of two change sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            layers: self.layers || other.layers,
            messages: self.messages || other.messages,
        }
    }
}

/// Folds envelopes into layer state and the message log.
///
/// Envelopes must be fed in arrival order. Every rule is either a reset, an
/// append, or a last-write-wins replace, so no look-ahead is ever needed.
pub struct LayeredReducer {
    processing: bool,
    current_run_id: Option<String>,
    fast: Option<FastLayer>,
    medium: Option<MediumLayer>,
    slow: Option<SlowLayer>,
    activity: AgentActivity,
    thread_id: Option<String>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn SyncObserver>,
}

impl Default for LayeredReducer {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(TracingObserver))
    }
}

impl LayeredReducer {
    /// Create a reducer with injected collaborators.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, observer: Arc<dyn SyncObserver>) -> Self {
        Self {
            processing: false,
            current_run_id: None,
            fast: None,
            medium: None,
            slow: None,
            activity: AgentActivity::default(),
            thread_id: None,
            clock,
            observer,
        }
    }

    /// Apply one envelope.
    ///
    /// Unknown envelope types are ignored. A `message` or `message_update`
    /// whose fields do not form a valid message is dropped and reported to
    /// the observer.
    pub fn handle_event(&mut self, envelope: &Envelope, store: &mut MessageStore) -> ChangeSet {
        match envelope {
            Envelope::AgentStarted(started) => self.on_agent_started(started),
            Envelope::ToolExecuting(tool) => {
                let fast = self.fast.get_or_insert_with(FastLayer::default);
                fast.active_tools.push(tool.tool_name.clone());
                if tool.timestamp.is_some() {
                    fast.timestamp = tool.timestamp;
                }
                ChangeSet::LAYERS
            }
            Envelope::AgentThinking(thinking) => self.on_agent_thinking(thinking),
            Envelope::PartialResult(partial) => {
                self.medium
                    .get_or_insert_with(MediumLayer::default)
                    .partial_content
                    .push_str(&partial.content);
                ChangeSet::LAYERS
            }
            Envelope::AgentCompleted(completed) => self.on_agent_completed(completed),
            Envelope::FinalReport(report) => {
                let slow = self.slow.get_or_insert_with(SlowLayer::default);
                slow.final_report = Some(report.report.clone());
                slow.total_duration = Some(report.total_duration);
                self.processing = false;
                ChangeSet::LAYERS
            }
            Envelope::Error(report) => self.on_error(report, store),
            Envelope::Message(fields) => self.on_message(fields, store),
            Envelope::MessageUpdate(update) => self.on_message_update(update, store),
            Envelope::ThreadSwitch(switch) => {
                tracing::debug!(thread_id = %switch.thread_id, "Switching thread");
                store.clear();
                self.reset_layers();
                self.thread_id = Some(switch.thread_id.clone());
                ChangeSet::ALL
            }
            Envelope::ThreadLoaded(loaded) => self.on_thread_loaded(loaded, store),
            Envelope::AgentStatus(status) => {
                self.activity.status = Some(status.clone());
                ChangeSet::LAYERS
            }
            Envelope::AgentTyping(typing) => {
                self.activity.typing = typing.is_typing;
                ChangeSet::LAYERS
            }
            Envelope::AgentProgress(progress) => {
                self.activity.progress = Some(progress.clone());
                ChangeSet::LAYERS
            }
            Envelope::Unknown { kind, .. } => {
                tracing::trace!(kind = %kind, "Ignoring unrecognized envelope");
                ChangeSet::NONE
            }
        }
    }

    /// Clear all three layers and end any run in progress.
    pub fn reset_layers(&mut self) {
        self.fast = None;
        self.medium = None;
        self.slow = None;
        self.current_run_id = None;
        self.processing = false;
    }

    fn on_agent_started(&mut self, started: &AgentStarted) -> ChangeSet {
        tracing::debug!(run_id = %started.run_id, agent = %started.agent_name, "Run started");
        self.reset_layers();
        self.processing = true;
        self.current_run_id = Some(started.run_id.clone());
        self.fast = Some(FastLayer {
            agent_name: started.agent_name.clone(),
            active_tools: Vec::new(),
            timestamp: started.timestamp,
            run_id: Some(started.run_id.clone()),
        });
        ChangeSet::LAYERS
    }

    fn on_agent_thinking(&mut self, thinking: &AgentThinking) -> ChangeSet {
        let medium = self.medium.get_or_insert_with(MediumLayer::default);
        medium.thought.clone_from(&thinking.thought);
        medium.step_number = thinking.step_number;
        medium.total_steps = thinking.total_steps;
        medium.agent_name.clone_from(&thinking.agent_name);
        ChangeSet::LAYERS
    }

    fn on_agent_completed(&mut self, completed: &AgentCompleted) -> ChangeSet {
        self.slow
            .get_or_insert_with(SlowLayer::default)
            .completed_agents
            .push(CompletedAgent {
                agent_name: completed.agent_name.clone(),
                duration: completed.duration,
                result: completed.result.clone(),
                metrics: completed.metrics.clone(),
            });
        ChangeSet::LAYERS
    }

    fn on_error(&mut self, report: &ErrorReport, store: &mut MessageStore) -> ChangeSet {
        tracing::warn!(code = ?report.error_code, "Backend error: {}", report.error_message);
        self.processing = false;

        let mut msg = Message::new(
            Uuid::new_v4().to_string(),
            Role::Error,
            report.error_message.clone(),
            self.clock.now_ms(),
        );
        if let Some(code) = &report.error_code {
            msg.extra.insert("errorCode".into(), Value::from(code.clone()));
        }
        store.add(msg);
        ChangeSet::ALL
    }

    fn on_message(&self, fields: &Map<String, Value>, store: &mut MessageStore) -> ChangeSet {
        match serde_json::from_value::<Message>(Value::Object(fields.clone())) {
            Ok(mut msg) => {
                msg.is_optimistic = false;
                if msg.created_at == 0 {
                    msg.created_at = self.clock.now_ms();
                }
                if let Some(existing) = store.get(&msg.id) {
                    // optimistic entries only change through the reconciler
                    if existing.is_optimistic {
                        tracing::debug!(id = %msg.id, "Ignoring server copy of an optimistic entry");
                        return ChangeSet::NONE;
                    }
                    if msg.status != existing.status
                        && !existing.status.can_transition_to(msg.status)
                    {
                        msg.status = existing.status;
                        msg.error.clone_from(&existing.error);
                    }
                    if msg.local_id.is_none() {
                        msg.local_id.clone_from(&existing.local_id);
                    }
                }
                store.add(msg);
                ChangeSet::MESSAGES
            }
            Err(source) => {
                self.observer.protocol_error(&ProtocolError::Payload {
                    kind: "message".into(),
                    source,
                });
                ChangeSet::NONE
            }
        }
    }

    fn on_message_update(&self, update: &MessageUpdate, store: &mut MessageStore) -> ChangeSet {
        let Some(current) = store.get(&update.id) else {
            tracing::debug!(id = %update.id, "Update for unknown message");
            return ChangeSet::NONE;
        };

        let mut fields = update.fields.clone();
        strip_client_owned(&mut fields);
        match current.merged(&fields) {
            Ok(mut merged) => {
                merged.id.clone_from(&update.id);
                store.update(&update.id, |m| *m = merged);
                ChangeSet::MESSAGES
            }
            Err(source) => {
                self.observer.protocol_error(&ProtocolError::Payload {
                    kind: "message_update".into(),
                    source,
                });
                ChangeSet::NONE
            }
        }
    }

    fn on_thread_loaded(&mut self, loaded: &ThreadLoaded, store: &mut MessageStore) -> ChangeSet {
        tracing::debug!(
            thread_id = %loaded.thread_id,
            count = loaded.messages.len(),
            "Thread loaded"
        );
        store.replace_all(loaded.messages.iter().cloned());
        self.thread_id = Some(loaded.thread_id.clone());
        ChangeSet::MESSAGES
    }

    /// Whether a run is in progress.
    #[must_use]
    pub const fn processing(&self) -> bool {
        self.processing
    }

    /// Id of the latest run.
    #[must_use]
    pub fn current_run_id(&self) -> Option<&str> {
        self.current_run_id.as_deref()
    }

    #[must_use]
    pub const fn fast_layer(&self) -> Option<&FastLayer> {
        self.fast.as_ref()
    }

    #[must_use]
    pub const fn medium_layer(&self) -> Option<&MediumLayer> {
        self.medium.as_ref()
    }

    #[must_use]
    pub const fn slow_layer(&self) -> Option<&SlowLayer> {
        self.slow.as_ref()
    }

    #[must_use]
    pub const fn activity(&self) -> &AgentActivity {
        &self.activity
    }

    /// Thread the store currently reflects.
    #[must_use]
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use chat_sync_core::{ManualClock, MessageStatus};
    use proptest::prelude::*;

    use super::*;

    fn reducer() -> LayeredReducer {
        LayeredReducer::new(Arc::new(ManualClock::new(5_000)), Arc::new(TracingObserver))
    }

    fn env(json: &str) -> Envelope {
        Envelope::parse(json).unwrap()
    }

    fn started(agent: &str, run: &str) -> Envelope {
        env(&format!(
            r#"{{"type":"agent_started","payload":{{"agent_name":"{agent}","run_id":"{run}","timestamp":1}}}}"#
        ))
    }

    fn tool(name: &str) -> Envelope {
        Envelope::ToolExecuting(chat_sync_core::envelope::ToolExecuting {
            tool_name: name.into(),
            agent_name: None,
            timestamp: None,
        })
    }

    fn partial(content: &str) -> Envelope {
        Envelope::PartialResult(chat_sync_core::envelope::PartialResult {
            content: content.into(),
        })
    }

    #[test]
    fn test_agent_started_scenario() {
        let mut r = reducer();
        let mut store = MessageStore::new();

        let changes = r.handle_event(&started("A", "r1"), &mut store);

        assert_eq!(changes, ChangeSet::LAYERS);
        assert!(r.processing());
        assert_eq!(r.current_run_id(), Some("r1"));
        let fast = r.fast_layer().unwrap();
        assert_eq!(fast.agent_name, "A");
        assert_eq!(fast.run_id.as_deref(), Some("r1"));
        assert_eq!(fast.timestamp, Some(1.0));
        assert!(fast.active_tools.is_empty());
    }

    #[test]
    fn test_agent_started_resets_previous_run() {
        let mut r = reducer();
        let mut store = MessageStore::new();

        r.handle_event(&started("A", "r1"), &mut store);
        r.handle_event(&tool("search"), &mut store);
        r.handle_event(&partial("half an ans"), &mut store);
        r.handle_event(
            &env(r#"{"type":"agent_completed","payload":{"agent_name":"sub","duration":1.5}}"#),
            &mut store,
        );

        r.handle_event(&started("B", "r2"), &mut store);

        assert_eq!(r.current_run_id(), Some("r2"));
        assert_eq!(r.fast_layer().unwrap().agent_name, "B");
        assert!(r.fast_layer().unwrap().active_tools.is_empty());
        assert!(r.medium_layer().is_none());
        assert!(r.slow_layer().is_none());
    }

    #[test]
    fn test_thinking_replaces_but_keeps_partial_content() {
        let mut r = reducer();
        let mut store = MessageStore::new();

        r.handle_event(&partial("Hello"), &mut store);
        r.handle_event(
            &env(r#"{"type":"agent_thinking","payload":{"thought":"one","step_number":1,"total_steps":3,"agent_name":"A"}}"#),
            &mut store,
        );
        r.handle_event(
            &env(r#"{"type":"agent_thinking","payload":{"thought":"two","step_number":2,"total_steps":4,"agent_name":"B"}}"#),
            &mut store,
        );
        r.handle_event(&partial(", world"), &mut store);

        let medium = r.medium_layer().unwrap();
        assert_eq!(medium.thought, "two");
        assert_eq!(medium.step_number, 2);
        assert_eq!(medium.total_steps, 4);
        assert_eq!(medium.agent_name, "B");
        assert_eq!(medium.partial_content, "Hello, world");
    }

    #[test]
    fn test_completed_agents_and_final_report() {
        let mut r = reducer();
        let mut store = MessageStore::new();

        r.handle_event(&started("lead", "r1"), &mut store);
        r.handle_event(
            &env(r#"{"type":"agent_completed","payload":{"agent_name":"a","duration":1.0,"result":"ok","metrics":{"tokens":3}}}"#),
            &mut store,
        );
        r.handle_event(
            &env(r#"{"type":"agent_completed","payload":{"agent_name":"b","duration":2.0}}"#),
            &mut store,
        );
        r.handle_event(
            &env(r#"{"type":"final_report","payload":{"report":{"summary":"done"},"total_duration":3.5}}"#),
            &mut store,
        );

        assert!(!r.processing());
        let slow = r.slow_layer().unwrap();
        let names: Vec<_> = slow.completed_agents.iter().map(|a| a.agent_name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(slow.completed_agents[0].metrics["tokens"], 3);
        assert_eq!(slow.final_report.as_ref().unwrap()["summary"], "done");
        assert_eq!(slow.total_duration, Some(3.5));
    }

    #[test]
    fn test_error_appends_error_message() {
        let mut r = reducer();
        let mut store = MessageStore::new();

        r.handle_event(&started("A", "r1"), &mut store);
        let changes = r.handle_event(
            &env(r#"{"type":"error","payload":{"error_message":"boom","error_code":"E42"}}"#),
            &mut store,
        );

        assert_eq!(changes, ChangeSet::ALL);
        assert!(!r.processing());
        assert_eq!(store.len(), 1);
        let msg = &store.messages()[0];
        assert_eq!(msg.role, Role::Error);
        assert_eq!(msg.content, "boom");
        assert_eq!(msg.created_at, 5_000);
        assert_eq!(msg.extra_field("errorCode"), Some(&Value::from("E42")));
    }

    #[test]
    fn test_unknown_type_is_a_no_op() {
        let mut r = reducer();
        let mut store = MessageStore::new();
        r.handle_event(&started("A", "r1"), &mut store);
        let before_fast = r.fast_layer().cloned();

        let changes = r.handle_event(
            &env(r#"{"type":"brand_new_event","payload":{"x":1}}"#),
            &mut store,
        );

        assert_eq!(changes, ChangeSet::NONE);
        assert_eq!(r.fast_layer().cloned(), before_fast);
        assert!(store.is_empty());
    }

    #[test]
    fn test_server_message_and_update() {
        let mut r = reducer();
        let mut store = MessageStore::new();

        r.handle_event(
            &env(r#"{"type":"message","payload":{"id":"m1","role":"assistant","content":"hi","createdAt":7}}"#),
            &mut store,
        );
        r.handle_event(
            &env(r#"{"type":"message_update","payload":{"id":"m1","content":"hi there","edited":true}}"#),
            &mut store,
        );

        let msg = store.get("m1").unwrap();
        assert_eq!(msg.content, "hi there");
        assert_eq!(msg.created_at, 7);
        assert_eq!(msg.status, MessageStatus::Confirmed);
        assert_eq!(msg.extra_field("edited"), Some(&Value::Bool(true)));

        let changes = r.handle_event(
            &env(r#"{"type":"message_update","payload":{"id":"nope","content":"x"}}"#),
            &mut store,
        );
        assert_eq!(changes, ChangeSet::NONE);
    }

    #[test]
    fn test_repeated_message_id_is_deduplicated() {
        let mut r = reducer();
        let mut store = MessageStore::new();
        let frame = r#"{"type":"message","payload":{"id":"m1","role":"assistant","content":"hi"}}"#;

        r.handle_event(&env(frame), &mut store);
        r.handle_event(&env(frame), &mut store);

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_cannot_rewrite_reconciliation_state() {
        let mut r = reducer();
        let mut store = MessageStore::new();
        r.handle_event(
            &env(r#"{"type":"message","payload":{"id":"S1","role":"user","content":"hi","localId":"L1"}}"#),
            &mut store,
        );

        r.handle_event(
            &env(r#"{"type":"message_update","payload":{"id":"S1","status":"pending","isOptimistic":true,"localId":"L9","error":"boom","content":"hi!"}}"#),
            &mut store,
        );

        let msg = store.get("S1").unwrap();
        assert_eq!(msg.content, "hi!");
        assert_eq!(msg.status, MessageStatus::Confirmed);
        assert!(!msg.is_optimistic);
        assert_eq!(msg.local_id.as_deref(), Some("L1"));
        assert!(msg.error.is_none());
    }

    #[test]
    fn test_repeated_message_keeps_confirmed_status() {
        let mut r = reducer();
        let mut store = MessageStore::new();
        r.handle_event(
            &env(r#"{"type":"message","payload":{"id":"S1","role":"user","content":"hi","localId":"L1"}}"#),
            &mut store,
        );

        let changes = r.handle_event(
            &env(r#"{"type":"message","payload":{"id":"S1","role":"user","content":"hi again","status":"failed","error":"late"}}"#),
            &mut store,
        );

        assert_eq!(changes, ChangeSet::MESSAGES);
        let msg = store.get("S1").unwrap();
        assert_eq!(msg.content, "hi again");
        assert_eq!(msg.status, MessageStatus::Confirmed);
        assert!(msg.error.is_none());
        assert_eq!(msg.local_id.as_deref(), Some("L1"));
    }

    #[test]
    fn test_server_message_leaves_optimistic_entry_alone() {
        let mut r = reducer();
        let mut store = MessageStore::new();
        let mut pending = Message::new("L1", Role::User, "draft", 1);
        pending.status = MessageStatus::Pending;
        pending.is_optimistic = true;
        pending.local_id = Some("L1".into());
        store.add(pending);

        let changes = r.handle_event(
            &env(r#"{"type":"message","payload":{"id":"L1","role":"user","content":"server"}}"#),
            &mut store,
        );

        assert_eq!(changes, ChangeSet::NONE);
        let msg = store.get("L1").unwrap();
        assert_eq!(msg.content, "draft");
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.is_optimistic);
    }

    #[test]
    fn test_malformed_message_is_dropped() {
        let mut r = reducer();
        let mut store = MessageStore::new();

        let changes = r.handle_event(
            &env(r#"{"type":"message","payload":{"content":"no id or role"}}"#),
            &mut store,
        );

        assert_eq!(changes, ChangeSet::NONE);
        assert!(store.is_empty());
    }

    #[test]
    fn test_thread_switch_and_load() {
        let mut r = reducer();
        let mut store = MessageStore::new();
        store.add(Message::new("old", Role::User, "x", 0));
        r.handle_event(&started("A", "r1"), &mut store);

        r.handle_event(
            &env(r#"{"type":"thread_switch","payload":{"thread_id":"t2"}}"#),
            &mut store,
        );
        assert!(store.is_empty());
        assert!(r.fast_layer().is_none());
        assert!(!r.processing());
        assert_eq!(r.thread_id(), Some("t2"));

        r.handle_event(
            &env(r#"{"type":"thread_loaded","payload":{"thread_id":"t2","messages":[
                {"id":"a","role":"user","content":"1"},
                {"id":"b","role":"assistant","content":"2"}
            ]}}"#),
            &mut store,
        );
        assert_eq!(store.len(), 2);
        assert_eq!(store.messages()[1].content, "2");
    }

    #[test]
    fn test_activity_signals() {
        let mut r = reducer();
        let mut store = MessageStore::new();

        r.handle_event(
            &env(r#"{"type":"agent_status","payload":{"agent_name":"A","status":"busy"}}"#),
            &mut store,
        );
        r.handle_event(
            &env(r#"{"type":"agent_typing","payload":{"is_typing":true}}"#),
            &mut store,
        );
        r.handle_event(
            &env(r#"{"type":"agent_progress","payload":{"progress":0.4,"message":"indexing"}}"#),
            &mut store,
        );

        let activity = r.activity();
        assert_eq!(activity.status.as_ref().unwrap().status, "busy");
        assert!(activity.typing);
        assert_eq!(activity.progress.as_ref().unwrap().progress, 0.4);
    }

    proptest! {
        #[test]
        fn prop_active_tools_preserve_arrival_order(
            tools in proptest::collection::vec("[a-z]{1,6}", 0..20)
        ) {
            let mut r = reducer();
            let mut store = MessageStore::new();
            r.handle_event(&started("A", "r1"), &mut store);
            for name in &tools {
                r.handle_event(&tool(name), &mut store);
            }
            let fast = r.fast_layer().unwrap();
            prop_assert_eq!(&fast.active_tools, &tools);
        }

        #[test]
        fn prop_partial_content_is_concatenation(
            chunks in proptest::collection::vec(".{0,8}", 0..20)
        ) {
            let mut r = reducer();
            let mut store = MessageStore::new();
            r.handle_event(&started("A", "r1"), &mut store);
            let mut seen_len = 0;
            for chunk in &chunks {
                r.handle_event(&partial(chunk), &mut store);
                let len = r.medium_layer().unwrap().partial_content.len();
                prop_assert!(len >= seen_len);
                seen_len = len;
            }
            let expected: String = chunks.concat();
            let actual = r.medium_layer().map(|m| m.partial_content.clone()).unwrap_or_default();
            prop_assert_eq!(actual, expected);
        }
    }
}
