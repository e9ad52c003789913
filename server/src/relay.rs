//! Transport-agnostic message handling and room fan-out
//!
//! Both bindings decode an envelope, resolve the originating session, and
//! hand the message to [`Relay::handle`]. Replies and broadcasts go back out
//! through each session's [`Endpoint`](crate::session::Endpoint), so the
//! relay never knows which wire format it is speaking.

use crate::config::{RelayConfig, Transport};
use crate::error::{ApplicationError, RelayError};
use crate::room::{Departure, RoomRegistry};
use crate::session::{Session, SessionId, SessionRegistry};
use log::{debug, info, warn};
use relay_shared::codec::CodecError;
use relay_shared::{Message, MessageType, Payload};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const SERVER_NAME: &str = "Relay Server";

/// What the transport worker should do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The peer asked to disconnect and has already been evicted.
    Close,
}

/// How broadcasts reach their recipients.
#[derive(Debug)]
enum Fanout {
    /// One after another on the calling task. A failed delivery marks the
    /// recipient disconnected.
    Sequential,
    /// One spawned send per recipient, bounded by the semaphore. Failures
    /// are only logged.
    Concurrent(Arc<Semaphore>),
}

/// Session and room coordination shared by both transport bindings
pub struct Relay {
    sessions: Arc<SessionRegistry>,
    rooms: Arc<RoomRegistry>,
    transport: Transport,
    allow_room_listing: bool,
    fanout: Fanout,
}

impl Relay {
    pub fn new(config: &RelayConfig) -> Self {
        let sessions = Arc::new(SessionRegistry::new(config.transport.session_prefix()));
        let rooms = Arc::new(RoomRegistry::new(Arc::clone(&sessions)));
        let fanout = match config.transport {
            Transport::Stream => Fanout::Sequential,
            Transport::Datagram => Fanout::Concurrent(Arc::new(Semaphore::new(
                config.fanout_concurrency.max(1),
            ))),
        };

        Self {
            sessions,
            rooms,
            transport: config.transport,
            allow_room_listing: config.allow_room_listing,
            fanout,
        }
    }

    /// Session registry shared with the transport bindings.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Room registry. Locks rooms before sessions.
    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Handles one inbound message from `session_id`.
    ///
    /// Application errors are answered with an `error` message and do not
    /// surface here. Anything returned as `Err` is a transport or protocol
    /// fault on the originating session's own endpoint.
    pub async fn handle(&self, session_id: &SessionId, message: Message) -> Result<Flow, RelayError> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .filter(|s| s.connected)
            .ok_or_else(|| RelayError::NotConnected(session_id.clone()))?;

        debug!("{} from {}", message.kind, session.id);

        match self.dispatch(&session, message).await {
            Ok(flow) => Ok(flow),
            Err(RelayError::Application(err)) => {
                debug!("Rejected request from {}: {}", session.id, err);
                session
                    .endpoint
                    .send(&Message::error(err.code(), &err.to_string()))
                    .await?;
                Ok(Flow::Continue)
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch(&self, session: &Session, message: Message) -> Result<Flow, RelayError> {
        let kind = message.kind.clone();
        match kind {
            MessageType::Connect => self.handle_connect(session, &message).await?,
            MessageType::Disconnect => {
                self.evict(&session.id, "client disconnect").await;
                return Ok(Flow::Close);
            }
            MessageType::Heartbeat => {}
            MessageType::CreateRoom => self.handle_create_room(session, &message).await?,
            MessageType::JoinRoom => self.handle_join_room(session, &message).await?,
            MessageType::LeaveRoom => self.handle_leave_room(session).await?,
            MessageType::ListRooms if self.allow_room_listing => {
                self.handle_list_rooms(session).await?
            }
            MessageType::GameState
            | MessageType::PlayerAction
            | MessageType::GameStart
            | MessageType::GameOver => self.handle_game_message(session, message).await,
            MessageType::ChatMessage => self.handle_chat(session, &message).await,
            other => return Err(ApplicationError::UnknownMessage(other.to_string()).into()),
        }
        Ok(Flow::Continue)
    }

    async fn handle_connect(&self, session: &Session, message: &Message) -> Result<(), RelayError> {
        let name = message
            .str_field("player_name")
            .or(session.display_name.as_deref())
            .unwrap_or_default()
            .to_string();
        self.sessions.set_display_name(&session.id, &name).await;
        info!("Player '{}' connected as {}", name, session.id);

        let reply = Message::with_data(
            MessageType::Connect,
            json!({
                "success": true,
                "player_id": session.id,
                "server_info": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol": self.transport.protocol_name(),
                },
            }),
        );
        session.endpoint.send(&reply).await
    }

    async fn handle_create_room(&self, session: &Session, message: &Message) -> Result<(), RelayError> {
        let room_id = requested_room_id(message)?;
        let secret = message.str_field("password").unwrap_or_default();

        let info = self.rooms.create(room_id, secret, &session.id).await?;

        let reply = Message::with_data(
            MessageType::CreateRoom,
            json!({ "success": true, "room_id": info.room_id }),
        );
        session.endpoint.send(&reply).await
    }

    async fn handle_join_room(&self, session: &Session, message: &Message) -> Result<(), RelayError> {
        let room_id = requested_room_id(message)?;
        let secret = message.str_field("password").unwrap_or_default();

        let info = self.rooms.join(room_id, secret, &session.id).await?;

        let reply = Message::with_data(
            MessageType::JoinRoom,
            json!({ "success": true, "room_id": info.room_id, "players": info.players }),
        );
        session.endpoint.send(&reply).await?;

        let name = self
            .sessions
            .get(&session.id)
            .await
            .map(|s| s.name().to_string())
            .unwrap_or_default();
        let notice = room_event("player_joined", &name, &info.players);
        self.broadcast(&info.room_id, notice, Some(&session.id)).await;
        Ok(())
    }

    async fn handle_leave_room(&self, session: &Session) -> Result<(), RelayError> {
        let Some(departure) = self.rooms.leave(&session.id).await else {
            return Ok(());
        };
        self.announce_departure(&departure).await;

        let reply = Message::with_data(MessageType::LeaveRoom, json!({ "success": true }));
        session.endpoint.send(&reply).await
    }

    async fn handle_list_rooms(&self, session: &Session) -> Result<(), RelayError> {
        let rooms = self.rooms.list().await;
        let rooms = serde_json::to_value(&rooms).map_err(CodecError::from)?;

        let reply = Message::with_data(MessageType::ListRooms, json!({ "rooms": rooms }));
        session.endpoint.send(&reply).await
    }

    async fn handle_game_message(&self, session: &Session, message: Message) {
        let Some(room_id) = session.room_id.as_deref() else {
            debug!("Dropping {} from {}: not in a room", message.kind, session.id);
            return;
        };

        match message.kind {
            MessageType::GameStart => {
                self.rooms.set_started(room_id, true).await;
            }
            MessageType::GameOver => {
                self.rooms.set_started(room_id, false).await;
            }
            _ => {}
        }

        let mut payload = message.payload;
        stamp_sender(&mut payload, session);
        let outgoing = Message::new(message.kind, payload);
        self.broadcast(room_id, outgoing, Some(&session.id)).await;
    }

    async fn handle_chat(&self, session: &Session, message: &Message) {
        let Some(room_id) = session.room_id.as_deref() else {
            debug!("Dropping chat from {}: not in a room", session.id);
            return;
        };

        let mut payload = Payload::new();
        stamp_sender(&mut payload, session);
        payload.insert(
            "message".to_string(),
            message.payload.get("message").cloned().unwrap_or(Value::Null),
        );
        self.broadcast(room_id, Message::new(MessageType::ChatMessage, payload), None)
            .await;
    }

    /// Delivers `message` to every connected member of `room_id` except
    /// `exclude`. One recipient's failure never stops delivery to the rest.
    pub async fn broadcast(&self, room_id: &str, message: Message, exclude: Option<&SessionId>) {
        let targets = self.rooms.recipients(room_id, exclude).await;
        if targets.is_empty() {
            return;
        }

        match &self.fanout {
            Fanout::Sequential => {
                for (id, endpoint) in targets {
                    if let Err(e) = endpoint.send(&message).await {
                        warn!("Delivery of {} to {} failed: {}", message.kind, id, e);
                        self.sessions.mark_disconnected(&id).await;
                        endpoint.close().await;
                    }
                }
            }
            Fanout::Concurrent(permits) => {
                let message = Arc::new(message);
                for (id, endpoint) in targets {
                    let Ok(permit) = Arc::clone(permits).acquire_owned().await else {
                        break;
                    };
                    let message = Arc::clone(&message);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = endpoint.send(&message).await {
                            warn!("Delivery of {} to {} failed: {}", message.kind, id, e);
                        }
                    });
                }
            }
        }
    }

    async fn announce_departure(&self, departure: &Departure) {
        if departure.room_removed {
            return;
        }
        let notice = room_event("player_left", &departure.display_name, &departure.players);
        self.broadcast(&departure.room_id, notice, None).await;
    }

    /// Removes a session: leave its room (telling the other member), drop it
    /// from the registry, then release its transport. Safe to call from
    /// several paths at once; only one of them does the work.
    pub async fn evict(&self, session_id: &SessionId, reason: &str) -> bool {
        self.sessions.mark_disconnected(session_id).await;

        if let Some(departure) = self.rooms.leave(session_id).await {
            self.announce_departure(&departure).await;
        }

        match self.sessions.remove(session_id).await {
            Some(session) => {
                info!("Evicted {} ({})", session.id, reason);
                session.endpoint.close().await;
                true
            }
            None => false,
        }
    }

    /// Evicts every session silent for longer than `timeout`.
    pub async fn evict_stale(&self, timeout: Duration) -> Vec<SessionId> {
        let stale: Vec<SessionId> = self
            .sessions
            .snapshot()
            .await
            .into_iter()
            .filter(|s| s.is_timed_out(timeout))
            .map(|s| s.id)
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for id in stale {
            if self.evict(&id, "liveness timeout").await {
                evicted.push(id);
            }
        }
        evicted
    }

    /// Backstop for rooms left empty by a path that did not remove them.
    pub async fn collect_empty_rooms(&self) -> usize {
        self.rooms.remove_empty().await.len()
    }

    /// Evicts every session, announcing departures to room members.
    ///
    /// Called once the bindings have stopped, so nothing new arrives while
    /// the registry drains.
    pub async fn disconnect_all(&self) {
        for session in self.sessions.snapshot().await {
            self.evict(&session.id, "server shutdown").await;
        }
    }
}

fn requested_room_id(message: &Message) -> Result<&str, ApplicationError> {
    message
        .str_field("room_id")
        .filter(|id| !id.is_empty())
        .ok_or(ApplicationError::InvalidRoomId)
}

/// Server-set identity keys, overriding anything the sender put there.
fn stamp_sender(payload: &mut Payload, session: &Session) {
    payload.insert("player_id".to_string(), Value::from(session.id.as_str()));
    payload.insert("player_name".to_string(), Value::from(session.name()));
}

fn room_event(event: &str, player_name: &str, players: &[String]) -> Message {
    Message::with_data(
        MessageType::RoomInfo,
        json!({ "event": event, "player_name": player_name, "players": players }),
    )
}
