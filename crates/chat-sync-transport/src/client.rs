//! Chat client: the event loop that ties a live connection to a
//! [`ChatState`].

use chat_sync_core::{Envelope, ProtocolError};
use chat_sync_session::{ChatState, OptimisticDraft};
use tokio::sync::{mpsc, watch};

use crate::{
    ClientConfig, ClientMessage, ConfigError, ConnectionError, SendError, TerminalError,
    UnsentMessage,
    connection::{CloseInfo, ConnectionHandler, ConnectionManager, ConnectionState},
    websocket::{DriverEvent, SocketEvent, TokioScheduler, WsConnector},
};

/// Connection callback, queued for the client loop.
#[derive(Debug)]
pub enum ConnectionEvent {
    Status(ConnectionState),
    Opened,
    Envelope(Envelope),
    ProtocolError(ProtocolError),
    Closed(CloseInfo),
    Error(ConnectionError),
    Reconnecting(u32),
    Terminal(TerminalError),
}

/// Forwards manager callbacks into a channel.
struct ChannelHandler {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelHandler {
    fn forward(&self, event: ConnectionEvent) {
        // receiver lives as long as the client
        let _ = self.tx.send(event);
    }
}

impl ConnectionHandler for ChannelHandler {
    fn on_status(&mut self, state: ConnectionState) {
        self.forward(ConnectionEvent::Status(state));
    }

    fn on_open(&mut self) {
        self.forward(ConnectionEvent::Opened);
    }

    fn on_message(&mut self, envelope: Envelope) {
        self.forward(ConnectionEvent::Envelope(envelope));
    }

    fn on_protocol_error(&mut self, error: ProtocolError) {
        self.forward(ConnectionEvent::ProtocolError(error));
    }

    fn on_close(&mut self, info: &CloseInfo) {
        self.forward(ConnectionEvent::Closed(info.clone()));
    }

    fn on_error(&mut self, error: &ConnectionError) {
        self.forward(ConnectionEvent::Error(error.clone()));
    }

    fn on_reconnect(&mut self, attempt: u32) {
        self.forward(ConnectionEvent::Reconnecting(attempt));
    }

    fn on_terminal(&mut self, error: &TerminalError) {
        self.forward(ConnectionEvent::Terminal(error.clone()));
    }
}

/// A reconnecting chat connection feeding a [`ChatState`].
///
/// Socket and timer events are queued on one channel and handled one at a
/// time by [`step`](Self::step). Caller actions (`send_chat`, `retry`, ...)
/// run between steps, so nothing here needs a lock.
pub struct ChatClient {
    config: ClientConfig,
    manager: ConnectionManager<WsConnector, TokioScheduler>,
    driver: mpsc::UnboundedReceiver<DriverEvent>,
    callbacks_tx: mpsc::UnboundedSender<ConnectionEvent>,
    callbacks: mpsc::UnboundedReceiver<ConnectionEvent>,
    state: ChatState,
    status: watch::Sender<ConnectionState>,
}

impl ChatClient {
    /// Create a client with a fresh [`ChatState`].
    ///
    /// # Errors
    /// Returns error if the config is invalid.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        Self::with_state(config, ChatState::new())
    }

    /// Create a client around an existing state container.
    ///
    /// # Errors
    /// Returns error if the config is invalid.
    pub fn with_state(config: ClientConfig, state: ChatState) -> Result<Self, ConfigError> {
        config.validate()?;

        let (driver_tx, driver) = mpsc::unbounded_channel();
        let (callbacks_tx, callbacks) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            WsConnector::new(driver_tx.clone()),
            TokioScheduler::new(driver_tx),
            config.reconnect,
        );
        let (status, _) = watch::channel(ConnectionState::Closed);

        Ok(Self {
            config,
            manager,
            driver,
            callbacks_tx,
            callbacks,
            state,
            status,
        })
    }

    /// Open the connection. A no-op if already connecting or open.
    pub fn connect(&mut self) {
        let handler = ChannelHandler {
            tx: self.callbacks_tx.clone(),
        };
        self.manager.connect(self.config.url.clone(), Box::new(handler));
        self.drain_callbacks();
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&mut self) {
        self.manager.disconnect();
        self.drain_callbacks();
    }

    /// Wait for the next socket or timer event and apply it.
    ///
    /// # Errors
    /// Returns the [`TerminalError`] once reconnect attempts are exhausted,
    /// and keeps returning it until [`connect`](Self::connect) is called.
    pub async fn step(&mut self) -> Result<(), TerminalError> {
        if let Some(error) = self.manager.terminal_error() {
            return Err(error.clone());
        }
        // The connector and scheduler hold senders, so this never yields None.
        if let Some(event) = self.driver.recv().await {
            self.dispatch(event);
        }
        match self.manager.terminal_error() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Run until reconnect attempts are exhausted.
    pub async fn run(&mut self) -> TerminalError {
        loop {
            if let Err(error) = self.step().await {
                return error;
            }
        }
    }

    /// Send a raw client message.
    ///
    /// # Errors
    /// Fails immediately unless the connection is open.
    pub fn send(&mut self, message: &ClientMessage) -> Result<(), SendError> {
        self.manager.send_json(message)
    }

    /// Add a user message optimistically and send it.
    ///
    /// The message is visible in [`state`](Self::state) before this returns.
    /// Returns its local id.
    ///
    /// # Errors
    /// If the send fails the entry is marked failed and stays in the store;
    /// the error carries its local id for a later [`retry`](Self::retry).
    pub fn send_chat(&mut self, content: impl Into<String>) -> Result<String, UnsentMessage> {
        let content = content.into();
        let local_id = self
            .state
            .add_optimistic(OptimisticDraft::user(content.clone()));
        self.transmit(&local_id, content)?;
        Ok(local_id)
    }

    /// Put a failed message back to pending and send it again.
    ///
    /// Returns `false` if `local_id` is not a failed tracked entry.
    ///
    /// # Errors
    /// If the send fails the entry is marked failed again.
    pub fn retry(&mut self, local_id: &str) -> Result<bool, UnsentMessage> {
        if !self.state.retry(local_id) {
            return Ok(false);
        }
        let content = self
            .state
            .reconciler()
            .message_id(local_id)
            .and_then(|id| self.state.message(id))
            .map(|msg| msg.content.clone())
            .unwrap_or_default();
        self.transmit(local_id, content)?;
        Ok(true)
    }

    /// Ask the server to switch threads. Later chat messages carry the new
    /// thread id.
    ///
    /// # Errors
    /// Fails immediately unless the connection is open.
    pub fn switch_thread(&mut self, thread_id: impl Into<String>) -> Result<(), SendError> {
        let thread_id = thread_id.into();
        self.send(&ClientMessage::SwitchThread {
            thread_id: thread_id.clone(),
        })?;
        self.config.thread_id = Some(thread_id);
        Ok(())
    }

    fn transmit(&mut self, local_id: &str, content: String) -> Result<(), UnsentMessage> {
        let request =
            ClientMessage::send_message(local_id, content, self.config.thread_id.clone());
        if let Err(source) = self.manager.send_json(&request) {
            tracing::warn!(local_id, "Message not sent: {source}");
            self.state.reject(local_id, &source.to_string());
            return Err(UnsentMessage {
                local_id: local_id.to_string(),
                source,
            });
        }
        Ok(())
    }

    fn dispatch(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Timer(token) => self.manager.on_timer(token),
            DriverEvent::Socket { id, event } => match event {
                SocketEvent::Opened => self.manager.on_socket_open(id),
                SocketEvent::Text(text) => self.manager.on_socket_message(id, &text),
                SocketEvent::Error(error) => self.manager.on_socket_error(id, error),
                SocketEvent::Closed(info) => self.manager.on_socket_closed(id, info),
            },
        }
        self.drain_callbacks();
    }

    fn drain_callbacks(&mut self) {
        while let Ok(event) = self.callbacks.try_recv() {
            match event {
                ConnectionEvent::Envelope(envelope) => {
                    self.state.handle_event(&envelope);
                }
                ConnectionEvent::ProtocolError(error) => {
                    self.state.report_protocol_error(&error);
                }
                ConnectionEvent::Status(state) => {
                    self.status.send_replace(state);
                }
                ConnectionEvent::Reconnecting(attempt) => {
                    tracing::debug!(attempt, "Reconnect attempt started");
                }
                ConnectionEvent::Terminal(error) => {
                    tracing::error!("Connection lost for good: {error}");
                }
                ConnectionEvent::Opened | ConnectionEvent::Closed(_) | ConnectionEvent::Error(_) => {}
            }
        }
    }

    /// Current connection status.
    #[must_use]
    pub const fn status(&self) -> ConnectionState {
        self.manager.status()
    }

    /// Watch connection status changes.
    #[must_use]
    pub fn status_updates(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    #[must_use]
    pub const fn state(&self) -> &ChatState {
        &self.state
    }

    pub const fn state_mut(&mut self) -> &mut ChatState {
        &mut self.state
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chat_sync_core::MessageStatus;

    use super::*;
    use crate::ReconnectPolicy;

    fn quick_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay_ms: 10,
            max_delay_ms: 20,
            jitter_window_ms: 0,
            max_attempts,
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(ChatClient::new(ClientConfig::new("http://localhost/ws")).is_err());
    }

    #[test]
    fn test_send_chat_while_closed_keeps_failed_entry() {
        let mut client = ChatClient::new(ClientConfig::new("ws://127.0.0.1:9/ws")).unwrap();

        let err = client.send_chat("hello").unwrap_err();
        assert!(matches!(
            err.source,
            SendError::NotOpen(ConnectionState::Closed)
        ));

        let msg = client
            .state()
            .messages()
            .iter()
            .find(|m| m.local_id.as_deref() == Some(err.local_id.as_str()))
            .unwrap();
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.status, MessageStatus::Failed);
        assert!(msg.error.is_some());

        // retrying while still closed fails again, entry stays
        let retry = client.retry(&err.local_id);
        assert!(retry.is_err());
        assert_eq!(client.state().messages().len(), 1);
    }

    #[test]
    fn test_retry_unknown_id_is_noop() {
        let mut client = ChatClient::new(ClientConfig::new("ws://127.0.0.1:9/ws")).unwrap();
        assert!(!client.retry("nope").unwrap());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let mut config = ClientConfig::new("ws://127.0.0.1:9/ws");
        config.reconnect = quick_policy(2);
        let mut client = ChatClient::new(config).unwrap();
        let mut status = client.status_updates();

        client.connect();
        let error = tokio::time::timeout(Duration::from_secs(10), client.run())
            .await
            .unwrap();

        assert_eq!(error, TerminalError::AttemptsExhausted { attempts: 2 });
        assert_eq!(client.status(), ConnectionState::Closed);
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), ConnectionState::Closed);

        // the error sticks until the next connect
        assert!(client.step().await.is_err());
    }
}
