//! # Relay Client Library
//!
//! Async peer for the relay server, speaking either transport through one
//! API. Used by the command-line client and by the workspace integration
//! tests.
//!
//! ## Transports
//!
//! ### Stream
//! A TCP connection carrying length-prefixed frames. Delivery is reliable
//! and ordered, and the server notices a closed connection immediately.
//!
//! ### Datagram
//! A UDP socket carrying one envelope per datagram. Every outgoing message
//! carries the player id and a fresh sequence number so the server can drop
//! reordered packets. Nothing is retransmitted, and the session lives only
//! as long as heartbeats keep arriving.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay_client::RelayClient;
//! use relay_shared::MessageType;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let wait = Duration::from_secs(2);
//!     let mut client = RelayClient::connect_datagram("127.0.0.1:12346").await?;
//!
//!     client.login("alice", wait).await?;
//!     client.create_room("r1", Some("secret")).await?;
//!     client.expect(MessageType::CreateRoom, wait).await?;
//!
//!     // Wait for an opponent, then start relaying game state
//!     let joined = client.expect(MessageType::RoomInfo, Duration::from_secs(60)).await?;
//!     println!("{} joined", joined.payload["player_name"]);
//!     client.player_action("rotate").await?;
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod network;

pub use network::{ClientError, RelayClient};
