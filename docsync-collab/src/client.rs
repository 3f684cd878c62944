//! WebSocket client for the realtime server.
//!
//! Provides:
//! - Connection lifecycle (connect, welcome handshake, close)
//! - Calls with one ack future per call id
//! - Typed helpers for the ten storage operations
//! - A stream of change notifications from other peers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bson::{oid::ObjectId, Document};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::mediator::{ChangeEvent, Operation};
use crate::outcome::Outcome;
use crate::protocol::{encode_call, ClientMessage, ProtocolError, ServerMessage};

/// Notifications buffered before the reader starts dropping them.
const EVENT_BUFFER: usize = 1024;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Ack, ProtocolError>>>>>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Reply to one call.
#[derive(Debug, Clone)]
pub struct Ack {
    pub outcome: Outcome,
    pub received_at: Instant,
}

/// A change event received from the server.
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    pub channel: String,
    pub event: ChangeEvent,
    pub received_at: Instant,
}

/// The realtime client.
///
/// Frames are written by a dedicated writer task; a reader task resolves
/// pending calls and forwards change events.
pub struct RealtimeClient {
    peer_id: Uuid,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    next_id: AtomicU64,
    pending: Pending,
    outgoing_tx: mpsc::Sender<Message>,
    event_rx: Option<mpsc::Receiver<ChangeNotice>>,
}

impl RealtimeClient {
    /// Connect and wait for the server's welcome frame.
    pub async fn connect(url: impl Into<String>) -> Result<Self, ProtocolError> {
        let server_url = url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(server_url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let peer_id = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str())? {
                    ServerMessage::Welcome { peer_id } => break peer_id,
                    other => return Err(ProtocolError::UnexpectedMessage(format!("{other:?}"))),
                },
                Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::ConnectionClosed),
                Some(Err(e)) => return Err(e.into()),
                _ => {}
            }
        };
        log::debug!("Connected to {server_url} as peer {peer_id}");

        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        // Writer task: forward outgoing channel to WebSocket
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: resolve acks and forward change events
        let reader_state = Arc::clone(&state);
        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(frame) => Self::route(frame, &reader_pending, &event_tx).await,
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: dropping the senders fails every pending call
            *reader_state.write().await = ConnectionState::Disconnected;
            reader_pending.lock().await.clear();
        });

        Ok(Self {
            peer_id,
            server_url,
            state,
            next_id: AtomicU64::new(1),
            pending,
            outgoing_tx,
            event_rx: Some(event_rx),
        })
    }

    async fn route(frame: ServerMessage, pending: &Pending, event_tx: &mpsc::Sender<ChangeNotice>) {
        let received_at = Instant::now();
        match frame {
            ServerMessage::Ack { id, outcome } => {
                let result = Outcome::from_json(outcome).map(|outcome| Ack { outcome, received_at });
                if let Some(waiter) = pending.lock().await.remove(&id) {
                    let _ = waiter.send(result);
                }
            }
            ServerMessage::Failure { id: Some(id), message } => {
                if let Some(waiter) = pending.lock().await.remove(&id) {
                    let _ = waiter.send(Err(ProtocolError::Rejected(message)));
                }
            }
            ServerMessage::Failure { id: None, message } => {
                log::warn!("Server rejected a frame: {message}");
            }
            ServerMessage::Event { channel, payload } => match ChangeEvent::from_json(payload) {
                Ok(event) => {
                    let notice = ChangeNotice { channel, event, received_at };
                    if event_tx.try_send(notice).is_err() {
                        log::warn!("Change notification buffer full, dropping event");
                    }
                }
                Err(e) => log::warn!("Dropping malformed change event: {e}"),
            },
            ServerMessage::Welcome { .. } => log::warn!("Ignoring repeated welcome frame"),
        }
    }

    /// Send a raw call and wait for its ack.
    pub async fn call(&self, event: impl Into<String>, args: Vec<Value>) -> Result<Ack, ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = ClientMessage::Call {
            id,
            event: event.into(),
            args,
        }
        .encode()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if *self.state.read().await == ConnectionState::Disconnected {
                return Err(ProtocolError::ConnectionClosed);
            }
            pending.insert(id, tx);
        }

        if self.outgoing_tx.send(Message::Text(frame.into())).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ProtocolError::ConnectionClosed);
        }
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Send a typed operation and wait for its ack.
    pub async fn execute(&self, operation: &Operation) -> Result<Ack, ProtocolError> {
        let (event, args) = encode_call(operation);
        self.call(event, args).await
    }

    pub async fn insert_one(&self, collection: &str, document: Document) -> Result<Ack, ProtocolError> {
        self.execute(&Operation::InsertOne {
            collection: collection.to_string(),
            document,
        })
        .await
    }

    pub async fn find(
        &self,
        collection: &str,
        filter: Option<Document>,
        options: Option<Document>,
    ) -> Result<Ack, ProtocolError> {
        self.execute(&Operation::Find {
            collection: collection.to_string(),
            filter,
            options,
        })
        .await
    }

    pub async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        options: Option<Document>,
    ) -> Result<Ack, ProtocolError> {
        self.execute(&Operation::FindOne {
            collection: collection.to_string(),
            filter,
            options,
        })
        .await
    }

    pub async fn find_one_with_id(&self, collection: &str, id: ObjectId) -> Result<Ack, ProtocolError> {
        self.execute(&Operation::FindOneWithId {
            collection: collection.to_string(),
            id,
        })
        .await
    }

    pub async fn update_one(&self, collection: &str, filter: Document, update: Document) -> Result<Ack, ProtocolError> {
        self.execute(&Operation::UpdateOne {
            collection: collection.to_string(),
            filter,
            update,
        })
        .await
    }

    pub async fn update_one_with_id(&self, collection: &str, id: ObjectId, update: Document) -> Result<Ack, ProtocolError> {
        self.execute(&Operation::UpdateOneWithId {
            collection: collection.to_string(),
            id,
            update,
        })
        .await
    }

    pub async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        replacement: Document,
    ) -> Result<Ack, ProtocolError> {
        self.execute(&Operation::ReplaceOne {
            collection: collection.to_string(),
            filter,
            replacement,
        })
        .await
    }

    pub async fn replace_one_with_id(
        &self,
        collection: &str,
        id: ObjectId,
        replacement: Document,
    ) -> Result<Ack, ProtocolError> {
        self.execute(&Operation::ReplaceOneWithId {
            collection: collection.to_string(),
            id,
            replacement,
        })
        .await
    }

    pub async fn delete_one(&self, collection: &str, filter: Document) -> Result<Ack, ProtocolError> {
        self.execute(&Operation::DeleteOne {
            collection: collection.to_string(),
            filter,
        })
        .await
    }

    pub async fn delete_one_with_id(&self, collection: &str, id: ObjectId) -> Result<Ack, ProtocolError> {
        self.execute(&Operation::DeleteOneWithId {
            collection: collection.to_string(),
            id,
        })
        .await
    }

    /// Take the change notification receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ChangeNotice>> {
        self.event_rx.take()
    }

    /// Send a close frame. Pending calls fail once the server hangs up.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(Message::Close(None))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Peer id assigned by the server.
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
