// Inbound message listener
// Accept loop on the communication port; each connection is handled on its
// own task so one slow peer cannot stall the loop

use crate::coordinator::ClusterCoordinator;
use crate::protocol;
use cachemesh_core::{Error, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub read_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

struct ReceiverRuntime {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Accepts peer connections and dispatches their messages to the coordinator
pub struct MessageReceiver {
    config: ReceiverConfig,
    coordinator: Arc<ClusterCoordinator>,
    runtime: Mutex<Option<ReceiverRuntime>>,
}

impl MessageReceiver {
    pub fn new(coordinator: Arc<ClusterCoordinator>, config: ReceiverConfig) -> Self {
        Self {
            config,
            coordinator,
            runtime: Mutex::new(None),
        }
    }

    /// Bind the port and begin accepting; returns the bound address
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        if self.runtime.lock().is_some() {
            return Err(Error::ClusterCommunication(
                "receiver already started".to_string(),
            ));
        }

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "message receiver listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = Arc::clone(&self.coordinator);
        let read_timeout = self.config.read_timeout;
        let grace = self.config.shutdown_grace;
        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            coordinator,
            shutdown_rx,
            read_timeout,
            grace,
        ));

        *self.runtime.lock() = Some(ReceiverRuntime {
            shutdown: shutdown_tx,
            accept_task,
            local_addr,
        });
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().map(|rt| rt.local_addr)
    }

    /// Stop accepting and wind down in-flight handlers within the grace period
    pub async fn stop(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(rt) = runtime {
            let _ = rt.shutdown.send(true);
            let abort = rt.accept_task.abort_handle();
            let wait = self.config.shutdown_grace + Duration::from_secs(1);
            if timeout(wait, rt.accept_task).await.is_err() {
                warn!("receiver did not stop within grace period, aborting");
                abort.abort();
            }
            info!("message receiver stopped");
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        coordinator: Arc<ClusterCoordinator>,
        mut shutdown: watch::Receiver<bool>,
        read_timeout: Duration,
        grace: Duration,
    ) {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "peer connected");
                        let coordinator = Arc::clone(&coordinator);
                        let shutdown = shutdown.clone();
                        handlers.spawn(Self::handle_connection(
                            stream,
                            addr,
                            coordinator,
                            shutdown,
                            read_timeout,
                        ));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
            }
        }

        // Refuse new work, then drain in-flight handlers
        drop(listener);
        let drained = timeout(grace, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("connection handlers did not drain in time, aborting them");
            handlers.shutdown().await;
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<ClusterCoordinator>,
        mut shutdown: watch::Receiver<bool>,
        read_timeout: Duration,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = timeout(read_timeout, protocol::read_frame(&mut stream)) => frame,
            };

            let message = match frame {
                Err(_) => {
                    debug!(%addr, "connection idle past read timeout, closing");
                    break;
                }
                Ok(Err(Error::Io(e))) => {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        debug!(%addr, "peer disconnected");
                    } else {
                        warn!(%addr, "read failed: {}", e);
                    }
                    break;
                }
                Ok(Err(e @ Error::FrameDesync(_))) => {
                    warn!(%addr, "closing connection: {}", e);
                    break;
                }
                Ok(Err(e)) => {
                    // The frame boundary survived; drop the message and
                    // keep the connection
                    warn!(%addr, "dropping malformed frame: {}", e);
                    if protocol::write_ack(&mut stream).await.is_err() {
                        break;
                    }
                    continue;
                }
                Ok(Ok(message)) => message,
            };

            if let Err(e) = coordinator.handle_message(message).await {
                warn!(%addr, "failed to apply message: {}", e);
            }

            if let Err(e) = protocol::write_ack(&mut stream).await {
                debug!(%addr, "ack write failed: {}", e);
                break;
            }
        }
    }
}
