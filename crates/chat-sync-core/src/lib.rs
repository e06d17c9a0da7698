//! Core data model for real-time chat synchronization.
//!
//! This crate provides the fundamental building blocks:
//! - `Message` - A chat entry with its confirmation status
//! - `Envelope` - Typed wire events received from the backend
//! - `MessageStore` - Ordered, id-indexed log of messages
//! - `Clock` and `SyncObserver` collaborator traits

pub mod envelope;
pub mod error;
pub mod message;
pub mod msg_store;
pub mod traits;

pub use envelope::Envelope;
pub use error::{ProtocolError, ReconciliationError};
pub use message::{
    CLIENT_OWNED_FIELDS, Message, MessageId, MessageStatus, Role, strip_client_owned,
};
pub use msg_store::{AddOutcome, MessageStore};
pub use traits::{Clock, ManualClock, SyncObserver, SystemClock, TracingObserver};
