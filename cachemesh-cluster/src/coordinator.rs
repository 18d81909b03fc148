// Bridge between local cache mutations and the peer message flow
// Outbound broadcasts fan out to active peers, either queued per peer for a
// dispatch worker (async) or awaited inline (sync); inbound messages are
// applied to the cache manager after loop suppression

use crate::membership::ClusterMembership;
use crate::protocol::ClusterMessage;
use crate::sender::MessageSender;
use bytes::Bytes;
use cachemesh_cache::CacheManager;
use cachemesh_core::types::{unix_millis, PeerAddress};
use cachemesh_core::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Fire-and-forget dispatch through per-peer queues when true
    pub async_dispatch: bool,
    /// Queued messages per destination before dispatches are dropped
    pub queue_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            async_dispatch: true,
            queue_capacity: 1024,
        }
    }
}

pub struct ClusterCoordinator {
    node_id: String,
    manager: Arc<CacheManager>,
    membership: Arc<ClusterMembership>,
    sender: Arc<MessageSender>,
    config: CoordinatorConfig,
    version: AtomicU64,
    /// One ordered dispatch queue per destination
    queues: DashMap<PeerAddress, mpsc::Sender<ClusterMessage>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterCoordinator {
    pub fn new(
        node_id: impl Into<String>,
        manager: Arc<CacheManager>,
        membership: Arc<ClusterMembership>,
        sender: Arc<MessageSender>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            manager,
            membership,
            sender,
            config,
            version: AtomicU64::new(0),
            queues: DashMap::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Abort the dispatch workers; queued messages are discarded
    pub fn stop(&self) {
        self.queues.clear();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker.abort();
        }
    }

    /// Broadcast an invalidation for one key, or the whole cache when None
    pub async fn broadcast_invalidation(&self, cache_name: &str, key: Option<&str>) {
        let message = ClusterMessage::Invalidation {
            cache_name: cache_name.to_string(),
            key: key.map(|k| k.to_string()),
            origin_node_id: self.node_id.clone(),
            version: self.next_version(),
            timestamp: unix_millis(),
        };
        self.broadcast(message).await;
    }

    /// Broadcast a replicated value; `version` is the entry's local version
    pub async fn broadcast_replication(
        &self,
        cache_name: &str,
        key: &str,
        value: Bytes,
        ttl: Duration,
        version: u64,
    ) {
        self.version.fetch_max(version, Ordering::SeqCst);
        let message = ClusterMessage::Replication {
            cache_name: cache_name.to_string(),
            key: key.to_string(),
            value: value.to_vec(),
            ttl_ms: ttl.as_millis() as u64,
            origin_node_id: self.node_id.clone(),
            version,
            timestamp: unix_millis(),
        };
        self.broadcast(message).await;
    }

    async fn broadcast(&self, message: ClusterMessage) {
        let peers = self.membership.active_peers();
        if peers.is_empty() {
            debug!(tag = message.tag(), "no active peers; broadcast skipped");
            return;
        }

        if self.config.async_dispatch {
            for peer in peers {
                self.dispatch(peer, message.clone());
            }
        } else {
            let sends = peers.into_iter().map(|peer| {
                let sender = Arc::clone(&self.sender);
                let message = message.clone();
                async move {
                    if let Err(e) = sender.send(&peer, &message).await {
                        warn!(peer = %peer, "broadcast failed: {}", e);
                    }
                }
            });
            futures::future::join_all(sends).await;
        }
    }

    /// Enqueue onto the peer's ordered queue, starting its worker on first use
    fn dispatch(&self, peer: PeerAddress, message: ClusterMessage) {
        let tx = {
            let entry = self.queues.entry(peer.clone()).or_insert_with(|| {
                let (tx, mut rx) = mpsc::channel::<ClusterMessage>(self.config.queue_capacity);
                let sender = Arc::clone(&self.sender);
                let worker_peer = peer.clone();
                let handle = tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        if let Err(e) = sender.send(&worker_peer, &message).await {
                            warn!(peer = %worker_peer, "broadcast dispatch failed: {}", e);
                        }
                    }
                });
                self.workers.lock().push(handle);
                tx
            });
            entry.clone()
        };

        if tx.try_send(message).is_err() {
            warn!(peer = %peer, "dispatch queue full; dropping broadcast");
        }
    }

    /// Apply one inbound message; self-originated messages are dropped
    pub async fn handle_message(&self, message: ClusterMessage) -> Result<()> {
        if message.origin() == self.node_id {
            debug!(tag = message.tag(), "dropping self-originated message");
            return Ok(());
        }

        match message {
            ClusterMessage::Heartbeat { node_id, timestamp } => {
                self.membership.record_inbound_heartbeat(&node_id, timestamp);
                Ok(())
            }
            ClusterMessage::Invalidation {
                cache_name,
                key,
                origin_node_id,
                ..
            } => {
                match &key {
                    Some(key) => {
                        self.manager.invalidate(&cache_name, key)?;
                    }
                    None => {
                        self.manager.invalidate_all(&cache_name)?;
                    }
                }
                debug!(
                    cache = %cache_name,
                    key = key.as_deref().unwrap_or("<all>"),
                    from = %origin_node_id,
                    "applied remote invalidation"
                );
                Ok(())
            }
            ClusterMessage::Replication {
                cache_name,
                key,
                value,
                ttl_ms,
                origin_node_id,
                version,
                ..
            } => {
                let applied = self.manager.apply_remote(
                    &cache_name,
                    &key,
                    Bytes::from(value),
                    Duration::from_millis(ttl_ms),
                    &origin_node_id,
                    version,
                )?;
                debug!(
                    cache = %cache_name,
                    key = %key,
                    from = %origin_node_id,
                    applied,
                    "processed remote replication"
                );
                Ok(())
            }
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}
