//! Stream binding: length-prefixed frames over TCP
//!
//! One task per connection runs a read-decode-dispatch loop. Any framing
//! or transport fault ends the loop, and the session is evicted on the way
//! out.

use crate::relay::{Flow, Relay};
use crate::session::Endpoint;
use log::{debug, error, info, warn};
use relay_shared::codec::read_frame;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Accepts connections until shutdown, then waits for every connection
/// worker to finish its cleanup.
pub async fn run_listener(
    listener: TcpListener,
    relay: Arc<Relay>,
    write_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    connections.spawn(handle_connection(
                        socket,
                        peer,
                        Arc::clone(&relay),
                        write_timeout,
                        shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    info!("Stream listener stopped, closing {} connection(s)", connections.len());
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    relay: Arc<Relay>,
    write_timeout: Duration,
    shutdown: CancellationToken,
) {
    if let Err(e) = socket.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }

    let (read_half, write_half) = socket.into_split();
    let closed = Arc::new(Notify::new());
    let endpoint = Endpoint::stream(peer, write_half, Arc::clone(&closed), write_timeout);
    let session = relay.sessions().create(endpoint).await;
    let mut reader = BufReader::new(read_half);

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            _ = closed.notified() => {
                debug!("Endpoint for {} closed", session.id);
                break;
            }
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(message) => match relay.handle(&session.id, message).await {
                Ok(Flow::Continue) => {
                    relay.sessions().touch(&session.id).await;
                }
                Ok(Flow::Close) => break,
                Err(e) => {
                    warn!("Closing connection for {}: {}", session.id, e);
                    break;
                }
            },
            Err(e) if e.is_eof() => {
                info!("{} closed the connection", peer);
                break;
            }
            Err(e) if e.is_protocol() => {
                warn!("Protocol error from {}, closing: {}", peer, e);
                break;
            }
            Err(e) => {
                warn!("Read error from {}: {}", peer, e);
                break;
            }
        }
    }

    relay.evict(&session.id, "connection closed").await;
}
