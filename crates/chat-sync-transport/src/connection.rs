//! Connection manager: one live socket, reconnect with backoff.
//!
//! The manager is a synchronous state machine. It does no I/O of its own:
//! sockets come from a [`Connector`], timers from a [`Scheduler`], and the
//! driver feeds socket and timer events back in through the `on_*` methods.
//! This keeps the whole reconnect policy testable with a virtual clock.

use std::{fmt, time::Duration};

use chat_sync_core::{Envelope, ProtocolError};
use serde::{Deserialize, Serialize};

use crate::{
    ConnectionError, JitterSource, RandomJitter, ReconnectPolicy, SendError, TerminalError,
};

/// Connection status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// A socket is being opened.
    Connecting,
    /// The socket is open; `send` is allowed.
    Open,
    /// No socket. A reconnect may be pending.
    #[default]
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        })
    }
}

/// Identifies one socket for the lifetime of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub u64);

/// Identifies one scheduled timer for the lifetime of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// Why a socket closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code from the peer, if one was received.
    pub code: Option<u16>,
    pub reason: String,
    /// Closed by `disconnect()`.
    pub intentional: bool,
}

impl CloseInfo {
    /// A closure this client did not ask for.
    #[must_use]
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
            intentional: false,
        }
    }

    /// A closure requested through `disconnect()`.
    #[must_use]
    pub fn intentional() -> Self {
        Self {
            code: None,
            reason: "disconnect requested".into(),
            intentional: true,
        }
    }
}

/// A live socket owned by the manager.
pub trait Socket: Send {
    /// Queue a text frame.
    fn send(&mut self, text: String) -> Result<(), ConnectionError>;

    /// Start closing. No further events for this socket are expected to
    /// matter; the manager ignores them.
    fn close(&mut self);
}

/// Opens sockets.
pub trait Connector: Send {
    /// Begin opening a socket to `url`.
    ///
    /// The connector reports `open`, `message`, `error` and `close` events for
    /// the socket back to the manager tagged with `id`. An `Err` means the
    /// attempt failed before any socket existed.
    fn open(&mut self, url: &str, id: SocketId) -> Result<Box<dyn Socket>, ConnectionError>;
}

/// Schedules reconnect timers.
pub trait Scheduler: Send {
    /// Call back `on_timer(token)` after `delay`.
    fn schedule(&mut self, delay: Duration, token: TimerToken);

    /// Cancel a timer. Cancelling a timer that already fired is harmless.
    fn cancel(&mut self, token: TimerToken);
}

/// Connection lifecycle callbacks. All methods default to no-ops.
pub trait ConnectionHandler: Send {
    /// Status changed. Fires CONNECTING -> OPEN -> CLOSED for each cycle.
    fn on_status(&mut self, _state: ConnectionState) {}

    /// The socket opened.
    fn on_open(&mut self) {}

    /// A frame decoded into an envelope.
    fn on_message(&mut self, _envelope: Envelope) {}

    /// A frame arrived that did not decode. It has been dropped.
    fn on_protocol_error(&mut self, _error: ProtocolError) {}

    /// The socket closed.
    fn on_close(&mut self, _info: &CloseInfo) {}

    /// Transport error on the live socket.
    fn on_error(&mut self, _error: &ConnectionError) {}

    /// A reconnect attempt (1-based) is starting now.
    fn on_reconnect(&mut self, _attempt: u32) {}

    /// Reconnect attempts are exhausted.
    fn on_terminal(&mut self, _error: &TerminalError) {}
}

/// Keeps at most one socket alive and reconnects after unintended closures.
pub struct ConnectionManager<C, S>
where
    C: Connector,
    S: Scheduler,
{
    connector: C,
    scheduler: S,
    policy: ReconnectPolicy,
    jitter: Box<dyn JitterSource>,
    state: ConnectionState,
    url: Option<String>,
    handler: Option<Box<dyn ConnectionHandler>>,
    socket: Option<(SocketId, Box<dyn Socket>)>,
    next_socket: u64,
    pending_timer: Option<TimerToken>,
    next_timer: u64,
    attempts: u32,
    intentional_close: bool,
    terminal: Option<TerminalError>,
}

impl<C, S> ConnectionManager<C, S>
where
    C: Connector,
    S: Scheduler,
{
    /// Create a manager with random jitter.
    #[must_use]
    pub fn new(connector: C, scheduler: S, policy: ReconnectPolicy) -> Self {
        Self::with_jitter(connector, scheduler, policy, Box::new(RandomJitter))
    }

    /// Create a manager with an injected jitter source.
    #[must_use]
    pub fn with_jitter(
        connector: C,
        scheduler: S,
        policy: ReconnectPolicy,
        jitter: Box<dyn JitterSource>,
    ) -> Self {
        Self {
            connector,
            scheduler,
            policy,
            jitter,
            state: ConnectionState::Closed,
            url: None,
            handler: None,
            socket: None,
            next_socket: 0,
            pending_timer: None,
            next_timer: 0,
            attempts: 0,
            intentional_close: false,
            terminal: None,
        }
    }

    /// Open a connection to `url`.
    ///
    /// A no-op while CONNECTING or OPEN. While CLOSED with a reconnect
    /// pending, the url and handler are swapped in and the pending backoff
    /// continues with its attempt count. Otherwise this starts a fresh
    /// lifecycle and clears the attempt counter and terminal condition.
    pub fn connect(&mut self, url: impl Into<String>, handler: Box<dyn ConnectionHandler>) {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            tracing::debug!(state = %self.state, "connect() ignored, connection already active");
            return;
        }
        let url = url.into();
        if self.pending_timer.is_some() {
            tracing::debug!(url = %url, attempts = self.attempts, "Reconnect pending, resuming backoff");
            self.url = Some(url);
            self.handler = Some(handler);
            return;
        }
        tracing::info!(url = %url, "Connecting");

        self.url = Some(url);
        self.handler = Some(handler);
        self.intentional_close = false;
        self.attempts = 0;
        self.terminal = None;
        self.open_socket();
    }

    /// Close the connection on purpose.
    ///
    /// Moves to CLOSED immediately, cancels any pending reconnect and
    /// suppresses further attempts until the next `connect`.
    pub fn disconnect(&mut self) {
        tracing::info!("Disconnecting");
        self.intentional_close = true;
        self.cancel_reconnect();

        if let Some((_, mut socket)) = self.socket.take() {
            socket.close();
        }
        if self.state != ConnectionState::Closed {
            self.set_state(ConnectionState::Closed);
            self.with_handler(|h| h.on_close(&CloseInfo::intentional()));
        }
    }

    /// Send a text frame. Fails immediately unless OPEN.
    ///
    /// # Errors
    /// Returns [`SendError::NotOpen`] if the connection is not open, or the
    /// socket's error if the frame could not be queued.
    pub fn send(&mut self, text: impl Into<String>) -> Result<(), SendError> {
        if self.state != ConnectionState::Open {
            return Err(SendError::NotOpen(self.state));
        }
        let Some((_, socket)) = self.socket.as_mut() else {
            return Err(SendError::NotOpen(self.state));
        };
        socket.send(text.into())?;
        Ok(())
    }

    /// Serialize `data` as JSON and send it.
    ///
    /// # Errors
    /// Same as [`send`](Self::send), plus encoding failures.
    pub fn send_json<T: Serialize>(&mut self, data: &T) -> Result<(), SendError> {
        if self.state != ConnectionState::Open {
            return Err(SendError::NotOpen(self.state));
        }
        let text = serde_json::to_string(data)?;
        self.send(text)
    }

    /// The socket finished opening.
    pub fn on_socket_open(&mut self, id: SocketId) {
        if !self.is_current(id) || self.state != ConnectionState::Connecting {
            tracing::debug!(?id, "Ignoring open from stale socket");
            return;
        }
        tracing::info!(?id, "Connection open");
        self.attempts = 0;
        self.set_state(ConnectionState::Open);
        self.with_handler(|h| h.on_open());
    }

    /// A text frame arrived.
    ///
    /// Frames that do not decode are dropped and handed to
    /// [`ConnectionHandler::on_protocol_error`].
    pub fn on_socket_message(&mut self, id: SocketId, text: &str) {
        if !self.is_current(id) {
            return;
        }
        match Envelope::parse(text) {
            Ok(envelope) => self.with_handler(|h| h.on_message(envelope)),
            Err(e) => {
                tracing::warn!(?id, "Dropping frame: {e}");
                self.with_handler(|h| h.on_protocol_error(e));
            }
        }
    }

    /// The socket reported an error. Treated as an unintended closure.
    pub fn on_socket_error(&mut self, id: SocketId, error: ConnectionError) {
        if !self.is_current(id) {
            return;
        }
        tracing::warn!(?id, "Socket error: {error}");
        self.with_handler(|h| h.on_error(&error));
        if let Some((_, mut socket)) = self.socket.take() {
            socket.close();
        }
        self.closed_unexpectedly(&CloseInfo::abnormal(error.to_string()));
    }

    /// The socket closed.
    pub fn on_socket_closed(&mut self, id: SocketId, info: CloseInfo) {
        if !self.is_current(id) {
            return;
        }
        self.socket = None;
        tracing::info!(?id, code = ?info.code, reason = %info.reason, "Connection closed");
        self.closed_unexpectedly(&info);
    }

    /// A timer handed to the scheduler fired.
    pub fn on_timer(&mut self, token: TimerToken) {
        if self.pending_timer != Some(token) {
            tracing::debug!(?token, "Ignoring stale timer");
            return;
        }
        self.pending_timer = None;
        if self.intentional_close {
            return;
        }
        let attempt = self.attempts;
        tracing::info!(attempt, "Reconnecting");
        self.with_handler(|h| h.on_reconnect(attempt));
        self.open_socket();
    }

    fn open_socket(&mut self) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let id = SocketId(self.next_socket);
        self.next_socket += 1;

        self.set_state(ConnectionState::Connecting);
        match self.connector.open(&url, id) {
            Ok(socket) => self.socket = Some((id, socket)),
            Err(error) => {
                tracing::warn!(?id, "Failed to open socket: {error}");
                self.with_handler(|h| h.on_error(&error));
                self.closed_unexpectedly(&CloseInfo::abnormal(error.to_string()));
            }
        }
    }

    fn closed_unexpectedly(&mut self, info: &CloseInfo) {
        self.set_state(ConnectionState::Closed);
        self.with_handler(|h| h.on_close(info));
        if !self.intentional_close {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.attempts >= self.policy.max_attempts {
            let error = TerminalError::AttemptsExhausted {
                attempts: self.attempts,
            };
            tracing::error!("{error}");
            self.with_handler(|h| h.on_terminal(&error));
            self.terminal = Some(error);
            return;
        }

        let jitter = self.jitter.sample(self.policy.jitter_window_ms);
        let delay = self.policy.delay_for(self.attempts, jitter);
        self.attempts += 1;

        let token = TimerToken(self.next_timer);
        self.next_timer += 1;
        self.pending_timer = Some(token);

        tracing::info!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.scheduler.schedule(delay, token);
    }

    fn cancel_reconnect(&mut self) {
        if let Some(token) = self.pending_timer.take() {
            tracing::debug!(?token, "Cancelling pending reconnect");
            self.scheduler.cancel(token);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "Connection state");
        self.state = state;
        self.with_handler(|h| h.on_status(state));
    }

    fn with_handler<F>(&mut self, f: F)
    where
        F: FnOnce(&mut dyn ConnectionHandler),
    {
        if let Some(handler) = self.handler.as_deref_mut() {
            f(handler);
        }
    }

    fn is_current(&self, id: SocketId) -> bool {
        self.socket.as_ref().is_some_and(|(current, _)| *current == id)
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts since the last successful open.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Set once reconnect attempts are exhausted, until the next `connect`.
    #[must_use]
    pub const fn terminal_error(&self) -> Option<&TerminalError> {
        self.terminal.as_ref()
    }

    /// Whether a reconnect timer is pending.
    #[must_use]
    pub const fn reconnect_pending(&self) -> bool {
        self.pending_timer.is_some()
    }

    /// URL of the last `connect`.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    #[must_use]
    pub const fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
