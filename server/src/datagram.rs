//! Datagram binding: receiver, bounded ingress queue and processor pool
//!
//! The receiver only copies bytes off the socket and offers them to the
//! queue. It never waits for queue space: when the queue is full the packet
//! is dropped and counted. Processors decode, resolve the session by remote
//! address, apply the sequence filter and dispatch.

use crate::relay::{Flow, Relay};
use crate::session::{Endpoint, SequenceCheck};
use log::{debug, error, warn};
use relay_shared::codec::decode_datagram;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// One received datagram, copied out of the receive buffer.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Vec<u8>,
    pub peer: SocketAddr,
}

/// Outcome of offering a packet to the ingress queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Queue full; the packet was shed.
    Dropped,
    /// Every processor is gone.
    Closed,
}

/// Ingress counters, updated without locking.
#[derive(Debug, Default)]
pub struct IngressStats {
    received: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    stale: AtomicU64,
    processed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub stale: u64,
    pub processed: u64,
}

impl IngressStats {
    pub fn snapshot(&self) -> IngressSnapshot {
        IngressSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fixed-capacity queue between the receiver and the processors
pub struct IngressQueue {
    tx: mpsc::Sender<Packet>,
    rx: Mutex<mpsc::Receiver<Packet>>,
    stats: Arc<IngressStats>,
}

impl IngressQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            stats: Arc::new(IngressStats::default()),
        }
    }

    /// Non-blocking enqueue.
    pub fn offer(&self, packet: Packet) -> Offer {
        IngressStats::bump(&self.stats.received);
        match self.tx.try_send(packet) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => {
                IngressStats::bump(&self.stats.dropped);
                Offer::Dropped
            }
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Waits for the next packet. Processors share the receiving end, so
    /// each packet is handed to exactly one of them.
    pub async fn next(&self) -> Option<Packet> {
        self.rx.lock().await.recv().await
    }

    pub fn stats(&self) -> &Arc<IngressStats> {
        &self.stats
    }
}

/// Drains the socket into the ingress queue until shutdown.
pub async fn run_receiver(
    socket: Arc<UdpSocket>,
    queue: Arc<IngressQueue>,
    buffer_size: usize,
    shutdown: CancellationToken,
) {
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let (len, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            },
        };

        let packet = Packet {
            data: buffer[..len].to_vec(),
            peer,
        };
        match queue.offer(packet) {
            Offer::Queued => {}
            Offer::Dropped => warn!("Ingress queue full, dropped {} bytes from {}", len, peer),
            Offer::Closed => break,
        }
    }

    debug!("Datagram receiver stopped");
}

/// One processor worker. Exits on shutdown after its current packet.
pub async fn run_processor(
    worker: usize,
    socket: Arc<UdpSocket>,
    queue: Arc<IngressQueue>,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            () = shutdown.cancelled() => break,
            packet = queue.next() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        process_packet(packet, &socket, &relay, queue.stats()).await;
    }

    debug!("Datagram processor {} stopped", worker);
}

async fn process_packet(packet: Packet, socket: &Arc<UdpSocket>, relay: &Relay, stats: &IngressStats) {
    let peer = packet.peer;

    // Decode before touching the registry so garbage never creates a session.
    let message = match decode_datagram(&packet.data) {
        Ok(message) => message,
        Err(e) => {
            IngressStats::bump(&stats.malformed);
            debug!("Discarding malformed datagram from {}: {}", peer, e);
            return;
        }
    };

    let (session, _) = relay
        .sessions()
        .get_or_create_by_endpoint(peer, || Endpoint::datagram(peer, Arc::clone(socket)))
        .await;

    if let Some(claimed) = message.sender_id.as_deref() {
        if claimed != session.id.as_str() {
            debug!("{} claims id {}, using {}", peer, claimed, session.id);
        }
    }

    match relay.sessions().accept_sequence(&session.id, message.sequence).await {
        SequenceCheck::Accepted | SequenceCheck::Unordered => {}
        SequenceCheck::Stale { last } => {
            IngressStats::bump(&stats.stale);
            debug!(
                "Ignoring stale packet from {}: seq {} <= {}",
                session.id, message.sequence, last
            );
            return;
        }
        SequenceCheck::UnknownSession => return,
    }

    match relay.handle(&session.id, message).await {
        Ok(flow) => {
            if flow == Flow::Continue {
                relay.sessions().touch(&session.id).await;
            }
            IngressStats::bump(&stats.processed);
        }
        Err(e) => warn!("Failed to handle datagram from {}: {}", session.id, e),
    }
}
