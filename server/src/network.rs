//! Server network layer: binds a transport and coordinates its tasks

use crate::config::{RelayConfig, Transport};
use crate::datagram::{run_processor, run_receiver, IngressQueue, IngressSnapshot, IngressStats};
use crate::error::RelayError;
use crate::relay::Relay;
use crate::stream::run_listener;
use crate::sweeper::{spawn_cleanup_sweep, spawn_heartbeat_sweep};
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Listening resource for the chosen transport.
enum Bound {
    Stream(TcpListener),
    Datagram(Arc<UdpSocket>),
}

/// A bound, not yet running relay server
pub struct Server {
    config: RelayConfig,
    relay: Arc<Relay>,
    bound: Bound,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the listening socket. This is the only failure that aborts
    /// startup.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let config = config.normalized();
        let address = config.bind_address();

        let bound = match config.transport {
            Transport::Stream => Bound::Stream(TcpListener::bind(&address).await?),
            Transport::Datagram => Bound::Datagram(Arc::new(UdpSocket::bind(&address).await?)),
        };
        let local_addr = match &bound {
            Bound::Stream(listener) => listener.local_addr()?,
            Bound::Datagram(socket) => socket.local_addr()?,
        };
        info!("{} relay listening on {}", config.transport, local_addr);

        Ok(Self {
            relay: Arc::new(Relay::new(&config)),
            config,
            bound,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts the transport binding and both sweeps.
    pub fn spawn(self) -> ServerHandle {
        let Server {
            config,
            relay,
            bound,
            local_addr,
        } = self;
        let shutdown = CancellationToken::new();

        let mut tasks = vec![
            spawn_heartbeat_sweep(
                Arc::clone(&relay),
                config.heartbeat_interval,
                config.liveness_timeout,
                shutdown.clone(),
            ),
            spawn_cleanup_sweep(
                Arc::clone(&relay),
                config.cleanup_interval,
                shutdown.clone(),
            ),
        ];

        let ingress = match bound {
            Bound::Stream(listener) => {
                tasks.push(tokio::spawn(run_listener(
                    listener,
                    Arc::clone(&relay),
                    config.write_timeout,
                    shutdown.clone(),
                )));
                None
            }
            Bound::Datagram(socket) => {
                let queue = Arc::new(IngressQueue::bounded(config.ingress_queue_capacity));
                let stats = Arc::clone(queue.stats());

                tasks.push(tokio::spawn(run_receiver(
                    Arc::clone(&socket),
                    Arc::clone(&queue),
                    config.recv_buffer_size,
                    shutdown.clone(),
                )));
                for worker in 0..config.processor_workers {
                    tasks.push(tokio::spawn(run_processor(
                        worker,
                        Arc::clone(&socket),
                        Arc::clone(&queue),
                        Arc::clone(&relay),
                        shutdown.clone(),
                    )));
                }
                info!(
                    "Datagram ingress: queue of {}, {} processor(s)",
                    config.ingress_queue_capacity, config.processor_workers
                );
                Some(stats)
            }
        };

        ServerHandle {
            local_addr,
            relay,
            shutdown,
            tasks,
            ingress,
        }
    }
}

/// Running server.
///
/// Dropping the handle does not cancel anything: the listener, processors
/// and sweeps keep running until [`ServerHandle::shutdown`] is called or the
/// runtime exits.
pub struct ServerHandle {
    local_addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    ingress: Option<Arc<IngressStats>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Ingress counters, datagram transport only.
    pub fn ingress_stats(&self) -> Option<IngressSnapshot> {
        self.ingress.as_ref().map(|stats| stats.snapshot())
    }

    /// Stops sweeps and bindings, then disconnects every remaining session.
    pub async fn shutdown(self) {
        info!("Shutting down relay on {}", self.local_addr);
        self.shutdown.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Server task failed: {}", e);
            }
        }

        self.relay.disconnect_all().await;
        if let Some(stats) = &self.ingress {
            let stats = stats.snapshot();
            info!(
                "Ingress totals: {} received, {} dropped, {} malformed, {} stale, {} processed",
                stats.received, stats.dropped, stats.malformed, stats.stale, stats.processed
            );
        }
        info!("Relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_shared::codec::{read_frame, write_frame};
    use relay_shared::{Message, MessageType};
    use std::time::Duration;
    use tokio::time::timeout;

    fn ephemeral(mut config: RelayConfig) -> RelayConfig {
        config.port = 0;
        config
    }

    #[tokio::test]
    async fn test_stream_server_lifecycle() {
        let server = Server::bind(ephemeral(RelayConfig::stream())).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);

        let handle = server.spawn();
        assert!(handle.ingress_stats().is_none());

        let _client = tokio::net::TcpStream::connect(handle.local_addr()).await.unwrap();
        timeout(Duration::from_secs(2), handle.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn test_datagram_server_lifecycle() {
        let server = Server::bind(ephemeral(RelayConfig::datagram())).await.unwrap();
        let handle = server.spawn();

        assert_eq!(handle.ingress_stats(), Some(IngressSnapshot::default()));
        timeout(Duration::from_secs(2), handle.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_handle_keeps_serving() {
        let server = Server::bind(ephemeral(RelayConfig::stream())).await.unwrap();
        let addr = server.local_addr();
        drop(server.spawn());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        write_frame(&mut client, &Message::connect("alice")).await.unwrap();
        let reply = timeout(Duration::from_secs(1), read_frame(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, MessageType::Connect);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let server = Server::bind(ephemeral(RelayConfig::stream())).await.unwrap();
        let addr = server.local_addr();
        let handle = server.spawn();

        timeout(Duration::from_secs(2), handle.shutdown()).await.unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = RelayConfig::stream();
        config.port = taken.local_addr().unwrap().port();

        let result = Server::bind(config).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }
}
