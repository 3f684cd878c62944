//! WebSocket server for the persistent-connection binding.
//!
//! Architecture:
//! ```text
//! Client A ──┐  call                          ack (caller only)
//!             ├───────► Mediator ── StorageAdapter ──► Client A
//! Client B ──┘              │
//!                           │ change (successful mutations)
//!                           ▼
//!                    BroadcastGroup ──► Client B, Client C, ... (never A)
//! ```
//!
//! Each call runs in its own task. The ack is written and flushed on the
//! caller's socket before the change is published, so the caller always
//! observes its ack before any peer observes the event.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, PeerInfo};
use crate::mediator::{Mediated, Mediator};
use crate::protocol::{decode_call, ClientMessage, ServerMessage};

type BoxError = Box<dyn Error + Send + Sync>;
type WsSink = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per peer before a lagging peer starts dropping
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub acks_sent: u64,
    pub change_events: u64,
}

/// State shared by every connection task.
#[derive(Clone)]
struct Shared {
    mediator: Arc<Mediator>,
    broadcast: Arc<BroadcastGroup>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The realtime server.
pub struct RealtimeServer {
    config: ServerConfig,
    shared: Shared,
}

impl RealtimeServer {
    pub fn new(config: ServerConfig, mediator: Arc<Mediator>) -> Self {
        let broadcast = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        Self {
            config,
            shared: Shared {
                mediator,
                broadcast,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Realtime server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let sink: WsSink = Arc::new(Mutex::new(ws_sender));

        let peer = PeerInfo::new(Some(addr));
        let peer_id = peer.peer_id;
        let mut broadcast_rx = shared.broadcast.add_peer(peer).await;
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Peer {peer_id} connected from {addr}");

        let result = async {
            send(&sink, &ServerMessage::Welcome { peer_id }).await?;

            loop {
                tokio::select! {
                    // Incoming WebSocket frame
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                Self::dispatch(text.as_str(), peer_id, &shared, &sink).await?;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                log::warn!("Ignoring binary frame from {addr}");
                            }
                            Some(Ok(Message::Ping(data))) => {
                                sink.lock().await.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }
                    // Outgoing change event
                    envelope = broadcast_rx.recv() => {
                        match envelope {
                            Ok(envelope) => {
                                // Don't echo back to the originator
                                if envelope.origin == peer_id {
                                    continue;
                                }
                                sink.lock().await.send(Message::Text(envelope.frame.clone().into())).await?;
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Peer {peer_id} lagged by {n} change events");
                                shared.broadcast.record_dropped(n);
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        // Cleanup runs whether the loop ended cleanly or on an I/O error
        shared.broadcast.remove_peer(&peer_id).await;
        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Peer {peer_id} disconnected");
        result
    }

    /// Decode one text frame and spawn its call.
    async fn dispatch(text: &str, peer_id: Uuid, shared: &Shared, sink: &WsSink) -> Result<(), BoxError> {
        match ClientMessage::decode(text) {
            Ok(ClientMessage::Call { id, event, args }) => {
                shared.stats.write().await.total_calls += 1;
                let shared = shared.clone();
                let sink = Arc::clone(sink);
                tokio::spawn(async move {
                    if let Err(e) = Self::handle_call(peer_id, id, event, args, shared, sink).await {
                        log::error!("Call {id} from peer {peer_id} failed: {e}");
                    }
                });
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to decode frame from peer {peer_id}: {e}");
                send(sink, &ServerMessage::Failure { id: None, message: e.to_string() }).await
            }
        }
    }

    /// Run one call: mediate, ack the caller, then fan out the change.
    async fn handle_call(
        peer_id: Uuid,
        call_id: u64,
        event: String,
        args: Vec<Value>,
        shared: Shared,
        sink: WsSink,
    ) -> Result<(), BoxError> {
        let operation = match decode_call(&event, args) {
            Ok(operation) => operation,
            Err(e) => {
                log::warn!("Rejected call {call_id} from peer {peer_id}: {e}");
                shared.stats.write().await.rejected_calls += 1;
                return send(&sink, &ServerMessage::Failure { id: Some(call_id), message: e.to_string() }).await;
            }
        };

        log::debug!("Peer {peer_id} call {call_id}: {} on '{}'", operation.method(), operation.collection());
        let Mediated { outcome, change } = shared.mediator.execute(operation).await;

        // The mutation is committed; peers hear about it even if the caller is gone
        match send(&sink, &ServerMessage::Ack { id: call_id, outcome: outcome.to_json() }).await {
            Ok(()) => shared.stats.write().await.acks_sent += 1,
            Err(e) => log::warn!("Failed to ack call {call_id} to peer {peer_id}: {e}"),
        }

        if let Some(change) = change {
            let targets = shared.broadcast.publish(peer_id, &change).await?;
            shared.stats.write().await.change_events += 1;
            log::debug!("Published {} on {} to {targets} peers", change.event.method, change.channel);
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.shared.broadcast
    }

    pub fn mediator(&self) -> &Arc<Mediator> {
        &self.shared.mediator
    }
}

/// Encode and write one frame; `SinkExt::send` flushes before returning.
async fn send(sink: &WsSink, msg: &ServerMessage) -> Result<(), BoxError> {
    let text = msg.encode()?;
    sink.lock().await.send(Message::Text(text.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageAdapter;

    fn mediator() -> Arc<Mediator> {
        Arc::new(Mediator::new(Arc::new(StorageAdapter::in_memory())))
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3001");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            broadcast_capacity: 512,
        };
        let server = RealtimeServer::new(config, mediator());
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(server.broadcast().capacity(), 512);
    }

    #[tokio::test]
    async fn test_initial_stats() {
        let server = RealtimeServer::new(ServerConfig::default(), mediator());
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.broadcast().peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_run_fails_on_bad_address() {
        let config = ServerConfig {
            bind_addr: "not-an-address".to_string(),
            ..ServerConfig::default()
        };
        let server = RealtimeServer::new(config, mediator());
        assert!(server.run().await.is_err());
    }
}
