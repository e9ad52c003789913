//! Room registry: membership, capacity and secret enforcement
//!
//! Rooms own membership. A session's `room_id` is only a lookup key, and is
//! always written together with the member set while both locks are held.
//! Lock order is rooms first, then sessions.

use crate::error::RoomError;
use crate::session::{Endpoint, SessionId, SessionRegistry, SessionTable};
use log::{debug, info};
use relay_shared::ROOM_CAPACITY;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

pub type RoomId = String;

/// A two-party pairing context
#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    /// Empty means public. Stored and compared as plain text.
    pub secret: String,
    pub members: BTreeSet<SessionId>,
    /// Set by `game_start`, cleared by `game_over`.
    pub started: bool,
    pub created_at: SystemTime,
}

impl Room {
    fn new(id: &str, secret: &str) -> Self {
        Self {
            id: id.to_string(),
            secret: secret.to_string(),
            members: BTreeSet::new(),
            started: false,
            created_at: SystemTime::now(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= ROOM_CAPACITY
    }

    fn accepts_secret(&self, secret: &str) -> bool {
        self.secret.is_empty() || self.secret == secret
    }
}

/// Membership view returned by create and join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub members: Vec<SessionId>,
    /// Display names of `members`, same order.
    pub players: Vec<String>,
}

/// What changed when a session left its room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: RoomId,
    pub display_name: String,
    pub remaining: Vec<SessionId>,
    pub players: Vec<String>,
    pub room_removed: bool,
}

/// Public listing entry. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub name: String,
    pub players: Vec<String>,
    pub max_players: usize,
    pub has_password: bool,
}

fn player_names(members: &BTreeSet<SessionId>, sessions: &SessionTable) -> Vec<String> {
    members
        .iter()
        .map(|id| {
            sessions
                .get(id)
                .map(|s| s.name().to_string())
                .unwrap_or_default()
        })
        .collect()
}

/// Concurrency-safe store of rooms
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Room>>,
    sessions: Arc<SessionRegistry>,
}

impl RoomRegistry {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            sessions,
        }
    }

    /// Creates a room with `creator` as its first member.
    pub async fn create(
        &self,
        room_id: &str,
        secret: &str,
        creator: &SessionId,
    ) -> Result<RoomInfo, RoomError> {
        let mut rooms = self.rooms.write().await;
        let mut sessions = self.sessions.write().await;

        let session = sessions
            .get_mut(creator)
            .filter(|s| s.connected)
            .ok_or(RoomError::SessionGone)?;
        if let Some(current) = &session.room_id {
            return Err(RoomError::AlreadyInRoom(current.clone()));
        }
        if rooms.contains_key(room_id) {
            return Err(RoomError::AlreadyExists(room_id.to_string()));
        }

        let mut room = Room::new(room_id, secret);
        room.members.insert(creator.clone());
        session.room_id = Some(room_id.to_string());
        let name = session.name().to_string();
        rooms.insert(room.id.clone(), room);

        info!("Room {} created by {}", room_id, creator);
        Ok(RoomInfo {
            room_id: room_id.to_string(),
            members: vec![creator.clone()],
            players: vec![name],
        })
    }

    /// Adds `joiner` to an existing room.
    ///
    /// Secret and capacity are checked in the same critical section that
    /// inserts the member, so two racing joins cannot both take the last slot.
    pub async fn join(
        &self,
        room_id: &str,
        secret: &str,
        joiner: &SessionId,
    ) -> Result<RoomInfo, RoomError> {
        let mut rooms = self.rooms.write().await;
        let mut sessions = self.sessions.write().await;

        let session = sessions
            .get_mut(joiner)
            .filter(|s| s.connected)
            .ok_or(RoomError::SessionGone)?;
        if let Some(current) = &session.room_id {
            return Err(RoomError::AlreadyInRoom(current.clone()));
        }

        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
        if !room.accepts_secret(secret) {
            return Err(RoomError::WrongSecret);
        }
        if room.is_full() {
            return Err(RoomError::Full);
        }

        room.members.insert(joiner.clone());
        session.room_id = Some(room_id.to_string());

        let members: Vec<SessionId> = room.members.iter().cloned().collect();
        let players = player_names(&room.members, &sessions);

        info!("Session {} joined room {}", joiner, room_id);
        Ok(RoomInfo {
            room_id: room_id.to_string(),
            members,
            players,
        })
    }

    /// Removes `session_id` from its room, deleting the room if that left it
    /// empty. Returns None when the session was not in a room.
    pub async fn leave(&self, session_id: &SessionId) -> Option<Departure> {
        let mut rooms = self.rooms.write().await;
        let mut sessions = self.sessions.write().await;

        let session = sessions.get_mut(session_id)?;
        let room_id = session.room_id.take()?;
        let display_name = session.name().to_string();

        let Some(room) = rooms.get_mut(&room_id) else {
            return Some(Departure {
                room_id,
                display_name,
                remaining: Vec::new(),
                players: Vec::new(),
                room_removed: true,
            });
        };

        room.members.remove(session_id);
        let remaining: Vec<SessionId> = room.members.iter().cloned().collect();
        let players = player_names(&room.members, &sessions);
        let room_removed = remaining.is_empty();
        if room_removed {
            rooms.remove(&room_id);
            info!("Room {} removed after last member left", room_id);
        } else {
            info!("Session {} left room {}", session_id, room_id);
        }

        Some(Departure {
            room_id,
            display_name,
            remaining,
            players,
            room_removed,
        })
    }

    /// Snapshot of every room, ordered by id.
    pub async fn list(&self) -> Vec<RoomSummary> {
        let rooms = self.rooms.read().await;
        let sessions = self.sessions.read().await;

        let mut summaries: Vec<RoomSummary> = rooms
            .values()
            .map(|room| RoomSummary {
                room_id: room.id.clone(),
                name: room.id.clone(),
                players: player_names(&room.members, &sessions),
                max_players: ROOM_CAPACITY,
                has_password: !room.secret.is_empty(),
            })
            .collect();
        summaries.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        summaries
    }

    /// Resolves delivery targets: connected members other than `exclude`.
    /// The returned endpoints are used after both locks are released.
    pub async fn recipients(
        &self,
        room_id: &str,
        exclude: Option<&SessionId>,
    ) -> Vec<(SessionId, Endpoint)> {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(room_id) else {
            return Vec::new();
        };
        let sessions = self.sessions.read().await;

        room.members
            .iter()
            .filter(|id| Some(*id) != exclude)
            .filter_map(|id| sessions.get(id))
            .filter(|s| s.connected)
            .map(|s| (s.id.clone(), s.endpoint.clone()))
            .collect()
    }

    /// Drops rooms with no members. Returns the ids removed.
    pub async fn remove_empty(&self) -> Vec<RoomId> {
        let mut rooms = self.rooms.write().await;
        let empty: Vec<RoomId> = rooms
            .values()
            .filter(|room| room.members.is_empty())
            .map(|room| room.id.clone())
            .collect();
        for id in &empty {
            rooms.remove(id);
            debug!("Removed empty room {}", id);
        }
        empty
    }

    /// Records whether a game is running in `room_id`.
    ///
    /// Returns false if the room no longer exists.
    pub async fn set_started(&self, room_id: &str, started: bool) -> bool {
        match self.rooms.write().await.get_mut(room_id) {
            Some(room) => {
                room.started = started;
                true
            }
            None => false,
        }
    }

    /// Snapshot of one room, including its secret. Server side only.
    pub async fn get(&self, room_id: &str) -> Option<Room> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Number of live rooms.
    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    /// Leaves a member-less room behind, as a crashed request path would.
    #[cfg(test)]
    pub(crate) async fn insert_orphan(&self, room_id: &str) {
        self.rooms
            .write()
            .await
            .insert(room_id.to_string(), Room::new(room_id, ""));
    }

    /// Checks both directions of the membership invariant.
    #[cfg(test)]
    pub(crate) async fn assert_consistent(&self) {
        let rooms = self.rooms.read().await;
        let sessions = self.sessions.read().await;

        for room in rooms.values() {
            assert!(room.members.len() <= ROOM_CAPACITY);
            for member in &room.members {
                let session = sessions.get(member).expect("member has a session");
                assert_eq!(session.room_id.as_deref(), Some(room.id.as_str()));
            }
        }
        drop(sessions);

        for session in self.sessions.snapshot().await {
            if let Some(room_id) = &session.room_id {
                let room = rooms.get(room_id).expect("room exists");
                assert!(room.members.contains(&session.id));
            }
        }
    }
}
