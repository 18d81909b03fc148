// Outbound peer connections
// One lazily-opened connection per destination, serialized by a mutex,
// with bounded retry, exponential backoff, and a per-peer circuit breaker

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::protocol::{self, ClusterMessage};
use cachemesh_core::types::PeerAddress;
use cachemesh_core::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Total attempts per send, including the first
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub breaker: BreakerConfig,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Sends framed messages to peers and reads their ACKs
pub struct MessageSender {
    config: SenderConfig,
    connections: DashMap<PeerAddress, Arc<AsyncMutex<Option<TcpStream>>>>,
    breakers: DashMap<PeerAddress, Mutex<CircuitBreaker>>,
}

impl MessageSender {
    pub fn new(config: SenderConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            breakers: DashMap::new(),
        }
    }

    pub async fn send_heartbeat(&self, peer: &PeerAddress, message: &ClusterMessage) -> Result<()> {
        self.send(peer, message).await
    }

    pub async fn send_invalidation(
        &self,
        peer: &PeerAddress,
        message: &ClusterMessage,
    ) -> Result<()> {
        self.send(peer, message).await
    }

    pub async fn send_replication(
        &self,
        peer: &PeerAddress,
        message: &ClusterMessage,
    ) -> Result<()> {
        self.send(peer, message).await
    }

    /// Send one message and wait for the ACK, subject to the peer's breaker
    pub async fn send(&self, peer: &PeerAddress, message: &ClusterMessage) -> Result<()> {
        let allowed = {
            let breaker = self
                .breakers
                .entry(peer.clone())
                .or_insert_with(|| Mutex::new(CircuitBreaker::new(self.config.breaker.clone())));
            let mut guard = breaker.lock();
            guard.try_acquire(Instant::now())
        };
        if !allowed {
            return Err(Error::CircuitOpen(peer.to_string()));
        }

        let result = self.send_with_retry(peer, message).await;

        if let Some(breaker) = self.breakers.get(peer) {
            let mut guard = breaker.lock();
            match &result {
                Ok(()) => guard.record_success(),
                Err(e) if e.is_transport() => guard.record_failure(Instant::now()),
                Err(_) => {}
            }
        }

        result
    }

    pub fn breaker_state(&self, peer: &PeerAddress) -> Option<BreakerState> {
        self.breakers.get(peer).map(|b| b.lock().state())
    }

    /// Drop any cached connection to the peer
    pub fn disconnect(&self, peer: &PeerAddress) {
        self.connections.remove(peer);
    }

    async fn send_with_retry(&self, peer: &PeerAddress, message: &ClusterMessage) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.try_send(peer, message).await {
                Ok(()) => return Ok(()),
                // Only transport failures are worth another attempt
                Err(e) if e.is_transport() && attempt + 1 < self.config.max_attempts => {
                    let backoff = self.config.backoff_base * 2u32.saturating_pow(attempt);
                    let jitter_cap = (backoff.as_millis() as u64 / 4).max(1);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap));
                    debug!(
                        peer = %peer,
                        attempt = attempt + 1,
                        "send failed, retrying after {:?}: {}",
                        backoff + jitter,
                        e
                    );
                    tokio::time::sleep(backoff + jitter).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_send(&self, peer: &PeerAddress, message: &ClusterMessage) -> Result<()> {
        let slot = {
            let entry = self
                .connections
                .entry(peer.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None)));
            Arc::clone(entry.value())
        };

        // One in-flight exchange per destination
        let mut conn = slot.lock().await;

        if conn.is_none() {
            let stream = timeout(self.config.connect_timeout, TcpStream::connect(peer.as_str()))
                .await
                .map_err(|_| {
                    Error::ClusterCommunication(format!("connect to {} timed out", peer))
                })?
                .map_err(|e| {
                    Error::ClusterCommunication(format!("connect to {} failed: {}", peer, e))
                })?;
            stream.set_nodelay(true).ok();
            debug!(peer = %peer, "opened peer connection");
            *conn = Some(stream);
        }

        let result = match conn.as_mut() {
            Some(stream) => Self::exchange(stream, message, self.config.read_timeout).await,
            None => Err(Error::ClusterCommunication(format!(
                "no connection to {}",
                peer
            ))),
        };

        if result.is_err() {
            // The stream state is unknown after a failure
            *conn = None;
        }
        result
    }

    async fn exchange(
        stream: &mut TcpStream,
        message: &ClusterMessage,
        read_timeout: Duration,
    ) -> Result<()> {
        protocol::write_frame(stream, message).await?;
        timeout(read_timeout, protocol::read_ack(stream))
            .await
            .map_err(|_| Error::ClusterCommunication("ack read timed out".to_string()))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SenderConfig {
        SenderConfig {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(500),
            max_attempts: 2,
            backoff_base: Duration::from_millis(10),
            breaker: BreakerConfig {
                window_size: 4,
                min_calls: 2,
                failure_rate_threshold: 0.5,
                cooldown: Duration::from_secs(30),
            },
        }
    }

    fn heartbeat() -> ClusterMessage {
        ClusterMessage::Heartbeat {
            node_id: "node-1".to_string(),
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn test_send_to_unreachable_peer_fails() {
        let sender = MessageSender::new(fast_config());
        // Port 1 is essentially never listening
        let peer = PeerAddress::parse("127.0.0.1:1").unwrap();
        let result = sender.send(&peer, &heartbeat()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_breaker_opens_after_repeated_failures() {
        let sender = MessageSender::new(fast_config());
        let peer = PeerAddress::parse("127.0.0.1:1").unwrap();

        for _ in 0..2 {
            let _ = sender.send(&peer, &heartbeat()).await;
        }
        assert_eq!(sender.breaker_state(&peer), Some(BreakerState::Open));

        // Short-circuited without touching the network
        let result = sender.send(&peer, &heartbeat()).await;
        assert!(matches!(result, Err(Error::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn test_send_and_ack_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let message = protocol::read_frame(&mut stream).await.unwrap();
            protocol::write_ack(&mut stream).await.unwrap();
            message
        });

        let sender = MessageSender::new(fast_config());
        let peer = PeerAddress::parse(&addr.to_string()).unwrap();
        sender.send(&peer, &heartbeat()).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, heartbeat());
        assert_eq!(sender.breaker_state(&peer), Some(BreakerState::Closed));
    }
}
