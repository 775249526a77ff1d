//! WebSocket session client.
//!
//! Connects to a collab server, performs the join handshake, and exposes the
//! server's event stream as typed [`SessionEvent`]s over a channel. Send
//! helpers cover every client event.

use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use futures_util::StreamExt;

use crate::protocol::{ChatPayload, ClientEvent, CursorPos, ProtocolError, ServerEvent};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Transport established and join handshake sent.
    Connected,
    /// Transport closed (server rejection, network loss, or local close).
    Disconnected,
    /// A server event for the joined room.
    Event(ServerEvent),
}

/// The session client.
pub struct CollabClient {
    server_url: String,
    room_id: String,
    credential: String,

    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SessionEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SessionEvent>,
}

impl CollabClient {
    /// Create a client for one room. `credential` is the bearer token
    /// presented in the join handshake.
    pub fn new(
        server_url: impl Into<String>,
        room_id: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            credential: credential.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Connect and send the join handshake.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;
        let (ws_stream, _) = match ws_result {
            Ok(ok) => ok,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            use futures_util::SinkExt;
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            // Channel dropped: close the socket so the server's reconciler
            // runs promptly instead of waiting for transport timeout.
            let _ = ws_writer
                .send(tokio_tungstenite::tungstenite::Message::Close(None))
                .await;
        });

        // Handshake first; the server processes nothing else before it.
        let join = ClientEvent::Join {
            room_id: self.room_id.clone(),
            credential: self.credential.clone(),
        };
        self.send(&join).await?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SessionEvent::Connected).await;

        // Reader task: surface server events to the application.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerEvent::decode(&bytes) {
                            Ok(event) => {
                                let _ = event_tx.send(SessionEvent::Event(event)).await;
                            }
                            Err(e) => {
                                log::warn!("Undecodable server frame: {e}");
                            }
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                        break;
                    }
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SessionEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Encode and queue one event for the writer task.
    async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let encoded = event.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Replace the room's code buffer.
    pub async fn send_code_change(&self, code: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::CodeChange {
            room_id: self.room_id.clone(),
            code: code.into(),
        })
        .await
    }

    /// Change the room's language tag.
    pub async fn send_language_change(
        &self,
        language: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::LanguageChange {
            room_id: self.room_id.clone(),
            language: language.into(),
        })
        .await
    }

    /// Send a chat message with a caller-declared timestamp.
    pub async fn send_chat(
        &self,
        text: impl Into<String>,
        timestamp: u64,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Chat {
            room_id: self.room_id.clone(),
            message: ChatPayload {
                text: text.into(),
                timestamp,
            },
        })
        .await
    }

    /// Send an ephemeral cursor position.
    pub async fn send_cursor(&self, line: u32, column: u32) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Cursor {
            room_id: self.room_id.clone(),
            position: CursorPos { line, column },
        })
        .await
    }

    /// Request an immutable snapshot of the room's current state.
    pub async fn request_snapshot(&self) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::RequestSnapshot {
            room_id: self.room_id.clone(),
        })
        .await
    }

    /// Close the connection from this side.
    pub async fn disconnect(&mut self) {
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The room this client joined.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
