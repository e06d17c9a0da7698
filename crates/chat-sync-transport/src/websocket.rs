//! WebSocket connector and tokio timer scheduler.
//!
//! Both report back to the owning event loop through one mpsc channel of
//! [`DriverEvent`]s, so the connection manager only ever sees one event at a
//! time.

use std::{collections::HashMap, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{
    ConnectionError,
    connection::{CloseInfo, Connector, Scheduler, Socket, SocketId, TimerToken},
};

/// An event for the connection manager.
#[derive(Debug)]
pub enum DriverEvent {
    /// Something happened on a socket.
    Socket { id: SocketId, event: SocketEvent },
    /// A reconnect timer fired.
    Timer(TimerToken),
}

/// Socket lifecycle event.
#[derive(Debug)]
pub enum SocketEvent {
    Opened,
    Text(String),
    Error(ConnectionError),
    Closed(CloseInfo),
}

enum Outgoing {
    Text(String),
    Close,
}

/// Opens sockets with `tokio-tungstenite`, one task per socket.
#[derive(Clone)]
pub struct WsConnector {
    events: mpsc::UnboundedSender<DriverEvent>,
}

impl WsConnector {
    /// Create a connector that reports to `events`.
    #[must_use]
    pub const fn new(events: mpsc::UnboundedSender<DriverEvent>) -> Self {
        Self { events }
    }
}

impl Connector for WsConnector {
    fn open(&mut self, url: &str, id: SocketId) -> Result<Box<dyn Socket>, ConnectionError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| ConnectionError::Open {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_socket(url.to_string(), id, rx, self.events.clone()));
        Ok(Box::new(WsSocket { outgoing: tx }))
    }
}

/// Write half of a socket task.
struct WsSocket {
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl Socket for WsSocket {
    fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| ConnectionError::SocketGone)
    }

    fn close(&mut self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

async fn run_socket(
    url: String,
    id: SocketId,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<DriverEvent>,
) {
    let emit = |event: SocketEvent| {
        let _ = events.send(DriverEvent::Socket { id, event });
    };

    // the manager may close the socket before the handshake finishes
    let handshake = connect_async(url.as_str());
    tokio::pin!(handshake);
    let stream = loop {
        tokio::select! {
            result = &mut handshake => match result {
                Ok((stream, _response)) => break stream,
                Err(e) => {
                    emit(SocketEvent::Error(ConnectionError::Open {
                        url: url.clone(),
                        reason: e.to_string(),
                    }));
                    return;
                }
            },
            out = outgoing.recv() => match out {
                Some(Outgoing::Text(_)) => {
                    tracing::warn!(?id, "Dropping frame queued before the handshake finished");
                }
                Some(Outgoing::Close) | None => {
                    tracing::debug!(?id, "Handshake abandoned");
                    return;
                }
            },
        }
    };
    tracing::debug!(?id, "WebSocket handshake complete");
    emit(SocketEvent::Opened);

    let (mut sink, mut stream) = stream.split();
    loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        emit(SocketEvent::Error(ConnectionError::Transport(e.to_string())));
                        return;
                    }
                }
                // Closed by the manager, or the socket handle was dropped.
                Some(Outgoing::Close) | None => {
                    let _ = sink.close().await;
                    return;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => emit(SocketEvent::Text(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => emit(SocketEvent::Text(text)),
                    Err(_) => tracing::warn!(?id, "Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let info = CloseInfo {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame.map(|f| f.reason.as_str().to_owned()).unwrap_or_default(),
                        intentional: false,
                    };
                    emit(SocketEvent::Closed(info));
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(SocketEvent::Error(ConnectionError::Transport(e.to_string())));
                    return;
                }
                None => {
                    emit(SocketEvent::Closed(CloseInfo::abnormal("stream ended")));
                    return;
                }
            },
        }
    }
}

/// Runs reconnect timers as tokio tasks.
pub struct TokioScheduler {
    events: mpsc::UnboundedSender<DriverEvent>,
    timers: HashMap<TimerToken, JoinHandle<()>>,
}

impl TokioScheduler {
    /// Create a scheduler that reports to `events`.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<DriverEvent>) -> Self {
        Self {
            events,
            timers: HashMap::new(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration, token: TimerToken) {
        self.timers.retain(|_, handle| !handle.is_finished());

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(?token, "No tokio runtime, reconnect timer dropped");
            return;
        };
        let events = self.events.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(DriverEvent::Timer(token));
        });
        self.timers.insert(token, handle);
    }

    fn cancel(&mut self, token: TimerToken) {
        if let Some(handle) = self.timers.remove(&token) {
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}
