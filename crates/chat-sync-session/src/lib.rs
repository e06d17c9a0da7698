//! Streaming-state reduction and optimistic reconciliation for chat sync.
//!
//! Provides:
//! - `LayeredReducer` - Fast/medium/slow views of an in-flight agent run
//! - `OptimisticReconciler` - Local-first entries resolved by server confirmation
//! - `ChatState` - Explicitly constructed container with notify-once updates

pub mod reconciler;
pub mod reducer;
pub mod state;

pub use reconciler::{OptimisticDraft, OptimisticReconciler};
pub use reducer::{
    AgentActivity, ChangeSet, CompletedAgent, FastLayer, LayeredReducer, MediumLayer, SlowLayer,
};
pub use state::{ChatState, StateChange};
