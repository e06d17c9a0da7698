//! Chat entries and their confirmation status.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of a message in the store.
pub type MessageId = String;

/// Wire fields owned by the client's reconciliation state. Server patches
/// never write them.
pub const CLIENT_OWNED_FIELDS: [&str; 4] = ["status", "isOptimistic", "localId", "error"];

/// Remove [`CLIENT_OWNED_FIELDS`] from a server patch.
pub fn strip_client_owned(fields: &mut Map<String, Value>) {
    for key in CLIENT_OWNED_FIELDS {
        fields.remove(key);
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Written by the local user.
    User,
    /// Produced by the backend agent.
    Assistant,
    /// System notice.
    System,
    /// Error surfaced by the backend.
    Error,
    /// Any role this client does not know about.
    #[serde(other)]
    Other,
}

/// Confirmation status of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Created locally, waiting on the server.
    Pending,
    /// Acknowledged by the server. Terminal.
    #[default]
    Confirmed,
    /// The server (or the transport) refused it.
    Failed,
}

impl MessageStatus {
    /// Whether `self -> next` is a legal transition.
    ///
    /// Only `pending -> confirmed`, `pending -> failed` and
    /// `failed -> pending` are allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed | Self::Failed) | (Self::Failed, Self::Pending)
        )
    }
}

/// A chat entry.
///
/// Fields the client does not model explicitly are kept in [`Message::extra`]
/// so that merges never lose server data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Creation time, Unix epoch milliseconds.
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub is_optimistic: bool,
    /// Client-side id for optimistic entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Failure reason while `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time of the last edit, Unix epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// A confirmed, non-optimistic message.
    #[must_use]
    pub fn new(
        id: impl Into<MessageId>,
        role: Role,
        content: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            created_at,
            status: MessageStatus::Confirmed,
            is_optimistic: false,
            local_id: None,
            server_id: None,
            error: None,
            updated_at: None,
            extra: Map::new(),
        }
    }

    /// Merge `fields` onto a copy of this message (RFC 7396 merge patch).
    ///
    /// Fields absent from `fields` keep their current value; a `null` field
    /// removes an optional value.
    ///
    /// # Errors
    /// Returns the decode error if the merged object is no longer a valid
    /// message, e.g. `content` was given a non-string value.
    pub fn merged(&self, fields: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        let mut doc = serde_json::to_value(self)?;
        json_patch::merge(&mut doc, &Value::Object(fields.clone()));
        serde_json::from_value(doc)
    }

    /// Look up a field not modelled on the struct.
    #[must_use]
    pub fn extra_field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use MessageStatus::{Confirmed, Failed, Pending};

        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Confirmed.can_transition_to(Pending));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Confirmed));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_unknown_fields_are_kept() {
        let json = r#"{"id":"m1","role":"assistant","content":"hey","threadId":"t9"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();

        assert_eq!(msg.status, MessageStatus::Confirmed);
        assert!(!msg.is_optimistic);
        assert_eq!(msg.extra_field("threadId"), Some(&Value::from("t9")));

        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back["threadId"], "t9");
        assert_eq!(back["isOptimistic"], false);
    }

    #[test]
    fn test_merged_preserves_absent_fields() {
        let mut original = Message::new("m1", Role::User, "hi", 10);
        original.local_id = Some("L1".into());

        let mut fields = Map::new();
        fields.insert("serverId".into(), Value::from("S1"));
        fields.insert("reactions".into(), serde_json::json!(["+1"]));

        let merged = original.merged(&fields).unwrap();
        assert_eq!(merged.content, "hi");
        assert_eq!(merged.created_at, 10);
        assert_eq!(merged.local_id.as_deref(), Some("L1"));
        assert_eq!(merged.server_id.as_deref(), Some("S1"));
        assert_eq!(merged.extra_field("reactions"), Some(&serde_json::json!(["+1"])));
    }

    #[test]
    fn test_merged_rejects_bad_shapes() {
        let original = Message::new("m1", Role::User, "hi", 10);
        let mut fields = Map::new();
        fields.insert("content".into(), Value::from(42));
        assert!(original.merged(&fields).is_err());
    }

    #[test]
    fn test_strip_client_owned() {
        let mut fields = serde_json::json!({
            "status": "pending",
            "isOptimistic": true,
            "localId": "L9",
            "error": "x",
            "content": "kept",
        });
        let Value::Object(map) = &mut fields else {
            unreachable!()
        };
        strip_client_owned(map);
        assert_eq!(map.len(), 1);
        assert_eq!(map["content"], "kept");
    }

    #[test]
    fn test_unknown_role() {
        let msg: Message = serde_json::from_str(r#"{"id":"m1","role":"tool"}"#).unwrap();
        assert_eq!(msg.role, Role::Other);
        assert_eq!(msg.content, "");
    }
}
