//! Non-fatal errors absorbed inside the sync core.
//!
//! Neither of these ever crosses the public boundary as a `Result`; they are
//! logged and handed to a [`SyncObserver`](crate::SyncObserver).

use thiserror::Error;

use crate::MessageStatus;

/// A frame that could not be turned into an [`Envelope`](crate::Envelope).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Invalid payload for {kind}: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A reconciliation request that could not be applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error("No tracked optimistic entry with local id {0}")]
    UnknownLocalId(String),
    #[error("Entry {local_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        local_id: String,
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("Local id {0} is already in use")]
    LocalIdTaken(String),
    #[error("Entry {0} can only be abandoned after it failed")]
    NotFailed(String),
    #[error("Malformed confirmation for {local_id}: {reason}")]
    MalformedConfirmation { local_id: String, reason: String },
}
