//! Connection layer for chat sync.
//!
//! Provides:
//! - `ConnectionManager` - Sans-IO socket lifecycle with reconnect backoff
//! - `ReconnectPolicy` / `ClientConfig` - Serde-loadable configuration
//! - `ClientMessage` - Outgoing wire protocol
//! - `ChatClient` - WebSocket event loop feeding a `ChatState` (feature: websocket)

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod client;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use backoff::{FixedJitter, JitterSource, RandomJitter, ReconnectPolicy};
pub use config::ClientConfig;
pub use connection::{
    CloseInfo, ConnectionHandler, ConnectionManager, ConnectionState, Connector, Scheduler,
    Socket, SocketId, TimerToken,
};
pub use error::{ConfigError, ConnectionError, SendError, TerminalError, UnsentMessage};
pub use protocol::ClientMessage;

#[cfg(feature = "websocket")]
pub use client::{ChatClient, ConnectionEvent};
#[cfg(feature = "websocket")]
pub use websocket::{DriverEvent, SocketEvent, TokioScheduler, WsConnector};
