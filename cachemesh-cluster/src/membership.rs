// Peer membership and failure detection
// Periodic heartbeats through the sender plus a staleness reaper; peers are
// never removed from the known set, only marked unhealthy

use crate::breaker::BreakerState;
use crate::protocol::ClusterMessage;
use crate::sender::MessageSender;
use cachemesh_core::types::{unix_millis, PeerAddress};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct PeerState {
    last_heartbeat: Option<Instant>,
    last_heartbeat_unix_ms: Option<u64>,
    consecutive_failures: u32,
    healthy: bool,
}

impl PeerState {
    fn new() -> Self {
        Self {
            last_heartbeat: None,
            last_heartbeat_unix_ms: None,
            consecutive_failures: 0,
            healthy: false,
        }
    }
}

/// Per-peer view for the admin surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub address: PeerAddress,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_heartbeat_unix_ms: Option<u64>,
    pub breaker: Option<BreakerState>,
}

/// Tracks the peer set and drives liveness
pub struct ClusterMembership {
    node_id: String,
    config: MembershipConfig,
    peers: DashMap<PeerAddress, PeerState>,
    /// Last inbound heartbeat per remote node id
    inbound: DashMap<String, u64>,
    sender: Arc<MessageSender>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterMembership {
    pub fn new(
        node_id: impl Into<String>,
        peers: Vec<PeerAddress>,
        sender: Arc<MessageSender>,
        config: MembershipConfig,
    ) -> Self {
        let peer_map = DashMap::new();
        for peer in peers {
            peer_map.insert(peer, PeerState::new());
        }
        Self {
            node_id: node_id.into(),
            config,
            peers: peer_map,
            inbound: DashMap::new(),
            sender,
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn known_peers(&self) -> Vec<PeerAddress> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    /// Healthy subset of the known peers
    pub fn active_peers(&self) -> Vec<PeerAddress> {
        self.peers
            .iter()
            .filter(|e| self.peer_is_healthy(e.key(), e.value()))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn is_peer_healthy(&self, peer: &PeerAddress) -> bool {
        self.peers
            .get(peer)
            .map(|state| self.peer_is_healthy(peer, state.value()))
            .unwrap_or(false)
    }

    fn peer_is_healthy(&self, peer: &PeerAddress, state: &PeerState) -> bool {
        if !state.healthy {
            return false;
        }
        let fresh = state
            .last_heartbeat
            .map(|at| at.elapsed() <= self.config.heartbeat_timeout)
            .unwrap_or(false);
        let circuit_open = self.sender.breaker_state(peer) == Some(BreakerState::Open);
        fresh && !circuit_open
    }

    pub fn last_heartbeat_times(&self) -> HashMap<PeerAddress, Option<u64>> {
        self.peers
            .iter()
            .map(|e| (e.key().clone(), e.value().last_heartbeat_unix_ms))
            .collect()
    }

    pub fn consecutive_failures(&self) -> HashMap<PeerAddress, u32> {
        self.peers
            .iter()
            .map(|e| (e.key().clone(), e.value().consecutive_failures))
            .collect()
    }

    /// Liveness observed through the inbound message path
    pub fn record_inbound_heartbeat(&self, node_id: &str, timestamp: u64) {
        debug!(from = node_id, timestamp, "inbound heartbeat");
        self.inbound.insert(node_id.to_string(), timestamp);
    }

    pub fn inbound_heartbeats(&self) -> HashMap<String, u64> {
        self.inbound
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.peers
            .iter()
            .map(|e| PeerSnapshot {
                address: e.key().clone(),
                healthy: self.peer_is_healthy(e.key(), e.value()),
                consecutive_failures: e.value().consecutive_failures,
                last_heartbeat_unix_ms: e.value().last_heartbeat_unix_ms,
                breaker: self.sender.breaker_state(e.key()),
            })
            .collect()
    }

    /// Start the heartbeat loop and the staleness reaper
    pub fn start(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.lock();
        if shutdown.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        *shutdown = Some(tx);

        let me = Arc::clone(self);
        let heartbeat_rx = rx.clone();
        let heartbeat = tokio::spawn(async move { me.run_heartbeat_loop(heartbeat_rx).await });

        let me = Arc::clone(self);
        let reaper = tokio::spawn(async move { me.run_reaper_loop(rx).await });

        let mut tasks = self.tasks.lock();
        tasks.push(heartbeat);
        tasks.push(reaper);
        info!(node_id = %self.node_id, peers = self.peers.len(), "cluster membership started");
    }

    async fn run_heartbeat_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.heartbeat_cycle().await,
            }
        }
        debug!("heartbeat loop stopped");
    }

    async fn heartbeat_cycle(&self) {
        let peers = self.known_peers();
        let sends = peers.into_iter().map(|peer| async move {
            let message = ClusterMessage::Heartbeat {
                node_id: self.node_id.clone(),
                timestamp: unix_millis(),
            };
            let outcome = self.sender.send_heartbeat(&peer, &message).await;
            (peer, outcome)
        });

        for (peer, outcome) in futures::future::join_all(sends).await {
            match outcome {
                Ok(()) => self.record_heartbeat_success(&peer),
                Err(e) => {
                    if let Some(mut state) = self.peers.get_mut(&peer) {
                        state.consecutive_failures += 1;
                        debug!(
                            peer = %peer,
                            failures = state.consecutive_failures,
                            "heartbeat failed: {}",
                            e
                        );
                    }
                }
            }
        }
    }

    fn record_heartbeat_success(&self, peer: &PeerAddress) {
        if let Some(mut state) = self.peers.get_mut(peer) {
            state.last_heartbeat = Some(Instant::now());
            state.last_heartbeat_unix_ms = Some(unix_millis());
            state.consecutive_failures = 0;
            if !state.healthy {
                info!(peer = %peer, "peer is healthy");
                state.healthy = true;
            }
        }
    }

    async fn run_reaper_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.reap_stale_peers(),
            }
        }
        debug!("reaper loop stopped");
    }

    fn reap_stale_peers(&self) {
        for mut entry in self.peers.iter_mut() {
            if !entry.healthy {
                continue;
            }
            let stale = entry
                .last_heartbeat
                .map(|at| at.elapsed() > self.config.heartbeat_timeout)
                .unwrap_or(true);
            if stale {
                let peer = entry.key().clone();
                entry.healthy = false;
                warn!(peer = %peer, "peer marked unhealthy");
            }
        }
    }

    /// Stop the loops, waiting up to the grace period before forcing
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.config.shutdown_grace, task)
                .await
                .is_err()
            {
                warn!("membership task did not stop within grace period, aborting");
                abort.abort();
            }
        }
        info!(node_id = %self.node_id, "cluster membership stopped");
    }
}
