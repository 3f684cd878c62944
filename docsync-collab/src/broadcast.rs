//! Change-event fan-out to every connected peer except the originator.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! peer gets an independent receiver buffering up to `capacity` frames;
//! lagging peers drop the oldest frames instead of stalling the sender.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::mediator::Change;
use crate::protocol::{ProtocolError, ServerMessage};

/// A connected peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: Instant,
}

impl PeerInfo {
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self::with_id(Uuid::new_v4(), remote_addr)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            peer_id,
            remote_addr,
            connected_at: Instant::now(),
        }
    }
}

/// An encoded event frame tagged with the peer that caused it.
#[derive(Debug)]
pub struct Envelope {
    pub origin: Uuid,
    /// Pre-encoded `{"type":"event",...}` text frame
    pub frame: String,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the publish hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// The single group every connected peer belongs to.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    peers: Arc<RwLock<HashMap<Uuid, PeerInfo>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register a peer and hand back its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Envelope>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Publish a change on behalf of `origin`.
    ///
    /// The frame is encoded once and shared by every receiver. Returns the
    /// number of registered peers other than `origin` that it targets.
    pub async fn publish(&self, origin: Uuid, change: &Change) -> Result<usize, ProtocolError> {
        let frame = ServerMessage::Event {
            channel: change.channel.clone(),
            payload: change.event.to_json(),
        }
        .encode()?;

        let targets = self
            .peers
            .read()
            .await
            .keys()
            .filter(|id| **id != origin)
            .count();

        // No receivers is not an error: nobody is listening yet.
        let _ = self.sender.send(Arc::new(Envelope { origin, frame }));
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(targets)
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
