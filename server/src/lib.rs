//! # Relay Server Library
//!
//! This library provides a real-time relay that pairs two peers in a named
//! room and forwards their game-state, action and chat messages. The server
//! is authoritative over sessions and rooms only. Game payloads pass through
//! untouched.
//!
//! ## Core Responsibilities
//!
//! ### Session Tracking
//! Every peer gets a session the moment it is first observed: on accept for
//! the stream transport, on the first datagram from a new address for the
//! datagram transport. Sessions carry the send handle, the display name,
//! liveness timestamps and the room they occupy.
//!
//! ### Room Coordination
//! Rooms hold at most two members and may require a shared secret. Joins
//! check the secret and capacity atomically, and the last member to leave
//! removes the room.
//!
//! ### Fan-out
//! Messages from one member are delivered to the other. A failed delivery
//! to one recipient never blocks the rest.
//!
//! ## Architecture Design
//!
//! ### Shared Core, Thin Bindings
//! Registries, dispatch and sweeps are transport-agnostic. The stream and
//! datagram bindings only decode envelopes, resolve sessions and hand off
//! to [`relay::Relay`].
//!
//! ### Locking Discipline
//! Both registries use reader/writer locks. When both are needed the room
//! lock is taken first. No network I/O happens while either is held.
//!
//! ### Datagram Backpressure
//! The datagram receiver never waits. Packets go into a bounded queue and
//! are shed when it is full, so one overloaded peer costs frames only for
//! itself.
//!
//! ## Module Organization
//!
//! - `session`: session registry and per-peer transport endpoints
//! - `room`: room registry, membership and secrets
//! - `relay`: message handling, broadcast and eviction
//! - `sweeper`: liveness and empty-room sweeps
//! - `stream`: TCP binding
//! - `datagram`: UDP receiver, ingress queue and processors
//! - `network`: binds a transport and wires the tasks together
//! - `config`, `error`: ambient plumbing
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay_server::config::RelayConfig;
//! use relay_server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(RelayConfig::datagram()).await?;
//!     let handle = server.spawn();
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod datagram;
pub mod error;
pub mod network;
pub mod relay;
pub mod room;
pub mod session;
pub mod stream;
pub mod sweeper;
