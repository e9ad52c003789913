//! Error taxonomy for the relay.
//!
//! Transport and protocol errors end a stream connection. Application errors
//! never do: they are answered with an `error` message and the session keeps
//! going.

use crate::session::SessionId;
use relay_shared::codec::CodecError;
use relay_shared::error_codes;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Room registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room {0} already exists")]
    AlreadyExists(String),
    #[error("room {0} not found")]
    NotFound(String),
    #[error("wrong room password")]
    WrongSecret,
    #[error("room is full")]
    Full,
    #[error("already in room {0}")]
    AlreadyInRoom(String),
    #[error("session is no longer connected")]
    SessionGone,
}

impl RoomError {
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::AlreadyExists(_) => error_codes::ROOM_EXISTS,
            RoomError::NotFound(_) => error_codes::ROOM_NOT_FOUND,
            RoomError::WrongSecret => error_codes::INVALID_PASSWORD,
            RoomError::Full => error_codes::ROOM_FULL,
            RoomError::AlreadyInRoom(_) => error_codes::ALREADY_IN_ROOM,
            RoomError::SessionGone => error_codes::SESSION_GONE,
        }
    }
}

/// Request-level failures reported back to the originating session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplicationError {
    #[error("invalid room id")]
    InvalidRoomId,
    #[error("unknown message type: {0}")]
    UnknownMessage(String),
    #[error(transparent)]
    Room(#[from] RoomError),
}

impl ApplicationError {
    pub fn code(&self) -> &'static str {
        match self {
            ApplicationError::InvalidRoomId => error_codes::INVALID_ROOM_ID,
            ApplicationError::UnknownMessage(_) => error_codes::UNKNOWN_MESSAGE,
            ApplicationError::Room(e) => e.code(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("session {0} is not connected")]
    NotConnected(SessionId),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl From<RoomError> for RelayError {
    fn from(e: RoomError) -> Self {
        RelayError::Application(ApplicationError::Room(e))
    }
}
