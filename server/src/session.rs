//! Session tracking for connected peers
//!
//! This module owns the server-side view of every peer, including:
//! - Session lifecycle (create on first contact, remove on disconnect or timeout)
//! - The transport handle used to reach the peer
//! - Liveness timestamps for the heartbeat sweep
//! - Per-session sequence filtering for the datagram transport
//!
//! The registry is the only place sessions live. Callers receive cloned
//! snapshots and mutate through the registry's atomic operations.

use crate::error::RelayError;
use log::{info, warn};
use relay_shared::codec::{encode_datagram, encode_frame};
use relay_shared::{Message, DATAGRAM_SOFT_LIMIT};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::{timeout, Instant};

/// Opaque session identifier, unique while the session is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        SessionId(id.to_string())
    }
}

/// Transport handle for reaching one peer.
///
/// Stream endpoints serialize writes through a per-connection lock so frames
/// from concurrent broadcasts never interleave. Datagram endpoints share the
/// server socket and only carry the remote address.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Stream {
        peer: SocketAddr,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        closed: Arc<Notify>,
        write_timeout: Duration,
    },
    Datagram {
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
    },
}

impl Endpoint {
    pub fn stream(
        peer: SocketAddr,
        writer: OwnedWriteHalf,
        closed: Arc<Notify>,
        write_timeout: Duration,
    ) -> Self {
        Endpoint::Stream {
            peer,
            writer: Arc::new(Mutex::new(writer)),
            closed,
            write_timeout,
        }
    }

    pub fn datagram(peer: SocketAddr, socket: Arc<UdpSocket>) -> Self {
        Endpoint::Datagram { peer, socket }
    }

    pub fn peer(&self) -> SocketAddr {
        match self {
            Endpoint::Stream { peer, .. } | Endpoint::Datagram { peer, .. } => *peer,
        }
    }

    /// Encodes and delivers one message using this endpoint's framing rule.
    pub async fn send(&self, message: &Message) -> Result<(), RelayError> {
        match self {
            Endpoint::Stream {
                writer,
                write_timeout,
                ..
            } => {
                let frame = encode_frame(message)?;
                let write = async {
                    let mut writer = writer.lock().await;
                    writer.write_all(&frame).await
                };
                match timeout(*write_timeout, write).await {
                    Ok(result) => Ok(result?),
                    Err(_) => Err(RelayError::WriteTimeout(*write_timeout)),
                }
            }
            Endpoint::Datagram { peer, socket } => {
                let data = encode_datagram(message)?;
                if data.len() > DATAGRAM_SOFT_LIMIT {
                    warn!(
                        "Large datagram ({} bytes, {}) to {} may fragment",
                        data.len(),
                        message.kind,
                        peer
                    );
                }
                socket.send_to(&data, peer).await?;
                Ok(())
            }
        }
    }

    /// Releases the transport resource. For streams this wakes the
    /// connection worker and half-closes the socket; datagram endpoints
    /// have nothing to release.
    pub async fn close(&self) {
        if let Endpoint::Stream {
            writer,
            closed,
            write_timeout,
            ..
        } = self
        {
            closed.notify_one();
            let shutdown = async {
                let mut writer = writer.lock().await;
                writer.shutdown().await
            };
            let _ = timeout(*write_timeout, shutdown).await;
        }
    }
}

/// Lifecycle position derived from a session's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Endpoint observed, no connect message yet.
    Pending,
    /// Display name set by a connect message.
    Active,
    /// Evicted or failed; about to leave the registry.
    Disconnected,
}

/// Result of running a datagram sequence number through the staleness filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Newer than anything seen; `last_sequence` advanced.
    Accepted,
    /// Sequence 0, no ordering requested.
    Unordered,
    /// At or below the last accepted sequence.
    Stale { last: u32 },
    UnknownSession,
}

/// Server-side state for one connected peer
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Set by the first connect message
    pub display_name: Option<String>,
    pub endpoint: Endpoint,
    /// Room this session occupies. Only the room registry writes this,
    /// together with the room's member set.
    pub room_id: Option<String>,
    pub connected: bool,
    /// Last time an inbound message from this peer was processed
    pub last_liveness: Instant,
    /// Highest accepted datagram sequence number
    pub last_sequence: u32,
}

impl Session {
    fn new(id: SessionId, endpoint: Endpoint) -> Self {
        Self {
            id,
            display_name: None,
            endpoint,
            room_id: None,
            connected: true,
            last_liveness: Instant::now(),
            last_sequence: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        if !self.connected {
            SessionState::Disconnected
        } else if self.display_name.is_some() {
            SessionState::Active
        } else {
            SessionState::Pending
        }
    }

    /// Display name, or an empty string before the connect message.
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or("")
    }

    /// Returns true if nothing has been heard from this peer within `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_liveness.elapsed() > timeout
    }
}

/// Sessions indexed by id and, for datagram peers, by remote address.
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    by_id: HashMap<SessionId, Session>,
    by_endpoint: HashMap<SocketAddr, SessionId>,
}

impl SessionTable {
    pub(crate) fn get(&self, id: &SessionId) -> Option<&Session> {
        self.by_id.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.by_id.get_mut(id)
    }
}

/// Concurrency-safe store of every connected peer
///
/// Read-mostly lookups take the read lock; anything that mutates takes the
/// write lock. No method performs network I/O while holding either.
#[derive(Debug)]
pub struct SessionRegistry {
    table: RwLock<SessionTable>,
    next_id: AtomicU64,
    prefix: &'static str,
}

impl SessionRegistry {
    /// Creates an empty registry. `prefix` starts every generated id
    /// (`player` for streams, `udp_player` for datagrams).
    pub fn new(prefix: &'static str) -> Self {
        Self {
            table: RwLock::new(SessionTable::default()),
            next_id: AtomicU64::new(1),
            prefix,
        }
    }

    fn next_session_id(&self) -> SessionId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = rand::random();
        SessionId(format!("{}_{}_{:08x}", self.prefix, n, suffix))
    }

    /// Registers a new session for a freshly accepted connection.
    pub async fn create(&self, endpoint: Endpoint) -> Session {
        let session = Session::new(self.next_session_id(), endpoint);
        info!("Session {} created for {}", session.id, session.endpoint.peer());

        let mut table = self.table.write().await;
        table.by_id.insert(session.id.clone(), session.clone());
        session
    }

    /// Snapshot of one session by id.
    ///
    /// The copy is detached from the registry; mutations go through the
    /// registry's own methods.
    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        self.table.read().await.by_id.get(id).cloned()
    }

    /// Finds the session for a datagram peer, creating it on first contact.
    ///
    /// Lookup and insert happen under one write lock, so concurrent first
    /// packets from the same endpoint cannot create two sessions. Returns
    /// the session and whether it was just created.
    pub async fn get_or_create_by_endpoint<F>(&self, peer: SocketAddr, make: F) -> (Session, bool)
    where
        F: FnOnce() -> Endpoint,
    {
        let mut table = self.table.write().await;
        if let Some(session) = table
            .by_endpoint
            .get(&peer)
            .and_then(|id| table.by_id.get(id))
        {
            return (session.clone(), false);
        }

        let session = Session::new(self.next_session_id(), make());
        table.by_endpoint.insert(peer, session.id.clone());
        table.by_id.insert(session.id.clone(), session.clone());
        drop(table);

        info!("Session {} created for {}", session.id, peer);
        (session, true)
    }

    /// Removes a session. Idempotent: returns None if it was already gone.
    pub async fn remove(&self, id: &SessionId) -> Option<Session> {
        let mut table = self.table.write().await;
        let session = table.by_id.remove(id)?;
        let peer = session.endpoint.peer();
        if table.by_endpoint.get(&peer) == Some(id) {
            table.by_endpoint.remove(&peer);
        }
        drop(table);

        info!("Session {} removed", session.id);
        Some(session)
    }

    /// Point-in-time copy of every session, for sweeps.
    pub async fn snapshot(&self) -> Vec<Session> {
        self.table.read().await.by_id.values().cloned().collect()
    }

    /// Refreshes liveness after an inbound message was processed.
    pub async fn touch(&self, id: &SessionId) -> bool {
        match self.table.write().await.by_id.get_mut(id) {
            Some(session) => {
                session.last_liveness = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Sets the name shown to room members, moving the session from
    /// `Pending` to `Active`. Returns false for an unknown id.
    pub async fn set_display_name(&self, id: &SessionId, name: &str) -> bool {
        match self.table.write().await.by_id.get_mut(id) {
            Some(session) => {
                session.display_name = Some(name.to_string());
                true
            }
            None => false,
        }
    }

    /// Applies the staleness filter and advances `last_sequence` in one
    /// critical section, so concurrent processors accept each sequence at
    /// most once. Sequence 0 is always accepted and never moves the mark.
    pub async fn accept_sequence(&self, id: &SessionId, sequence: u32) -> SequenceCheck {
        let mut table = self.table.write().await;
        let Some(session) = table.by_id.get_mut(id) else {
            return SequenceCheck::UnknownSession;
        };

        if sequence == 0 {
            SequenceCheck::Unordered
        } else if sequence <= session.last_sequence {
            SequenceCheck::Stale {
                last: session.last_sequence,
            }
        } else {
            session.last_sequence = sequence;
            SequenceCheck::Accepted
        }
    }

    /// Flags a session as disconnected so no further deliveries target it.
    /// Returns the session only on the first call, which makes eviction
    /// paths safe to race.
    pub async fn mark_disconnected(&self, id: &SessionId) -> Option<Session> {
        let mut table = self.table.write().await;
        let session = table.by_id.get_mut(id)?;
        if !session.connected {
            return None;
        }
        session.connected = false;
        Some(session.clone())
    }

    /// Number of registered sessions, connected or not.
    pub async fn len(&self) -> usize {
        self.table.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.by_id.is_empty()
    }

    /// Read guard for the room registry, which must observe sessions while
    /// holding its own lock.
    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, SessionTable> {
        self.table.read().await
    }

    /// Write guard for the room registry, which updates `room_id` together
    /// with room membership.
    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, SessionTable> {
        self.table.write().await
    }
}
