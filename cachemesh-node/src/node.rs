// Node assembly
// Builds the cache manager, cluster plumbing and service façade from a
// validated configuration, and drives startup and graceful shutdown

use crate::service::CacheService;
use cachemesh_cache::{CacheManager, CacheStats};
use cachemesh_cluster::{
    ClusterCoordinator, ClusterMembership, CoordinatorConfig, MembershipConfig, MessageReceiver,
    MessageSender, PeerSnapshot, ReceiverConfig, SenderConfig,
};
use cachemesh_core::config::NodeConfig;
use cachemesh_core::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Root object owning every subsystem of one cache node
pub struct CacheNode {
    config: NodeConfig,
    node_id: String,
    manager: Arc<CacheManager>,
    membership: Arc<ClusterMembership>,
    coordinator: Arc<ClusterCoordinator>,
    receiver: Arc<MessageReceiver>,
    service: Arc<CacheService>,
}

impl CacheNode {
    pub fn new(config: NodeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        let node_id = config.effective_node_id();
        let manager = Arc::new(CacheManager::new(node_id.clone()));
        for name in config.caches.keys() {
            manager.configure_cache(name, config.cache_configuration(name));
        }

        let sender = Arc::new(MessageSender::new(SenderConfig::default()));
        let peers = config
            .cluster
            .static_peers()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        let membership = Arc::new(ClusterMembership::new(
            node_id.clone(),
            peers,
            Arc::clone(&sender),
            MembershipConfig {
                heartbeat_interval: config.cluster.heartbeat_interval(),
                heartbeat_timeout: config.cluster.heartbeat_timeout(),
                ..Default::default()
            },
        ));
        let coordinator = Arc::new(ClusterCoordinator::new(
            node_id.clone(),
            Arc::clone(&manager),
            Arc::clone(&membership),
            Arc::clone(&sender),
            CoordinatorConfig {
                async_dispatch: config.cluster.async_broadcast,
                ..Default::default()
            },
        ));
        let receiver = Arc::new(MessageReceiver::new(
            Arc::clone(&coordinator),
            ReceiverConfig::default(),
        ));
        let service = Arc::new(CacheService::new(
            Arc::clone(&manager),
            Arc::clone(&coordinator),
        ));

        Ok(Self {
            config,
            node_id,
            manager,
            membership,
            coordinator,
            receiver,
            service,
        })
    }

    /// Bind the receiver and start cluster coordination
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = self
            .receiver
            .start(self.config.cluster.communication_port)
            .await?;
        self.membership.start();
        info!(node_id = %self.node_id, %addr, "cache node started");
        Ok(addr)
    }

    /// Stop every subsystem, each within its bounded grace period
    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id, "cache node shutting down");
        self.membership.shutdown().await;
        self.receiver.stop().await;
        self.coordinator.stop();
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn service(&self) -> Arc<CacheService> {
        Arc::clone(&self.service)
    }

    pub fn manager(&self) -> Arc<CacheManager> {
        Arc::clone(&self.manager)
    }

    pub fn membership(&self) -> Arc<ClusterMembership> {
        Arc::clone(&self.membership)
    }

    /// Admin surface: per-peer liveness view
    pub fn peer_snapshot(&self) -> Vec<PeerSnapshot> {
        self.membership.snapshot()
    }

    /// Admin surface: per-cache statistics
    pub fn stats_snapshot(&self) -> HashMap<String, CacheStats> {
        self.manager.stats_snapshot()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.receiver.local_addr()
    }
}
