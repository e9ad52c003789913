//! Integration tests for the relay over real sockets
//!
//! Each test binds a server on an ephemeral port and drives it through the
//! client library, the same way a game would.

use relay_client::{ClientError, RelayClient};
use relay_server::config::{RelayConfig, Transport};
use relay_server::network::{Server, ServerHandle};
use relay_shared::{error_codes, Message, MessageType, Payload};
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

const WAIT: Duration = Duration::from_secs(2);

async fn start(mut config: RelayConfig) -> ServerHandle {
    config.port = 0;
    Server::bind(config)
        .await
        .expect("bind ephemeral port")
        .spawn()
}

async fn peer(handle: &ServerHandle, transport: Transport, name: &str) -> RelayClient {
    let addr = handle.local_addr().to_string();
    let mut client = match transport {
        Transport::Stream => RelayClient::connect_stream(&addr).await.unwrap(),
        Transport::Datagram => RelayClient::connect_datagram(&addr).await.unwrap(),
    };
    client.login(name, WAIT).await.unwrap();
    client
}

fn rejected_code(result: Result<Message, ClientError>) -> String {
    match result {
        Err(ClientError::Rejected { code, .. }) => code,
        other => panic!("Expected a rejection, got {other:?}"),
    }
}

/// Two peers sharing room `r1`, with the join notification consumed.
async fn paired(handle: &ServerHandle, transport: Transport) -> (RelayClient, RelayClient) {
    let mut alice = peer(handle, transport, "alice").await;
    let mut bob = peer(handle, transport, "bob").await;

    alice.create_room("r1", None).await.unwrap();
    alice.expect(MessageType::CreateRoom, WAIT).await.unwrap();
    bob.join_room("r1", None).await.unwrap();
    bob.expect(MessageType::JoinRoom, WAIT).await.unwrap();
    alice.expect(MessageType::RoomInfo, WAIT).await.unwrap();

    (alice, bob)
}

/// ROOM LIFECYCLE TESTS
mod room_tests {
    use super::*;

    /// Wrong secret is rejected without touching membership; the right one
    /// gets in and the creator hears about it.
    #[tokio::test]
    async fn secret_room_scenario() {
        let handle = start(RelayConfig::stream()).await;
        let mut alice = peer(&handle, Transport::Stream, "alice").await;
        let mut bob = peer(&handle, Transport::Stream, "bob").await;

        alice.create_room("r1", Some("abc")).await.unwrap();
        let created = alice.expect(MessageType::CreateRoom, WAIT).await.unwrap();
        assert_eq!(created.payload["success"], true);

        bob.join_room("r1", Some("wrong")).await.unwrap();
        let code = rejected_code(bob.expect(MessageType::JoinRoom, WAIT).await);
        assert_eq!(code, error_codes::INVALID_PASSWORD);
        assert_eq!(
            handle.relay().rooms().get("r1").await.unwrap().members.len(),
            1
        );

        bob.join_room("r1", Some("abc")).await.unwrap();
        let joined = bob.expect(MessageType::JoinRoom, WAIT).await.unwrap();
        assert_eq!(joined.payload["players"].as_array().unwrap().len(), 2);

        let notice = alice.expect(MessageType::RoomInfo, WAIT).await.unwrap();
        assert_eq!(notice.payload["event"], "player_joined");
        assert_eq!(notice.payload["player_name"], "bob");
        assert_eq!(
            handle.relay().rooms().get("r1").await.unwrap().members.len(),
            2
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn third_peer_gets_room_full() {
        let handle = start(RelayConfig::stream()).await;
        let (_alice, _bob) = paired(&handle, Transport::Stream).await;
        let mut carol = peer(&handle, Transport::Stream, "carol").await;

        carol.join_room("r1", None).await.unwrap();
        let code = rejected_code(carol.expect(MessageType::JoinRoom, WAIT).await);
        assert_eq!(code, error_codes::ROOM_FULL);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_and_missing_rooms() {
        let handle = start(RelayConfig::datagram()).await;
        let mut alice = peer(&handle, Transport::Datagram, "alice").await;
        let mut bob = peer(&handle, Transport::Datagram, "bob").await;

        alice.create_room("r1", None).await.unwrap();
        alice.expect(MessageType::CreateRoom, WAIT).await.unwrap();

        bob.create_room("r1", None).await.unwrap();
        let code = rejected_code(bob.expect(MessageType::CreateRoom, WAIT).await);
        assert_eq!(code, error_codes::ROOM_EXISTS);

        bob.join_room("nowhere", None).await.unwrap();
        let code = rejected_code(bob.expect(MessageType::JoinRoom, WAIT).await);
        assert_eq!(code, error_codes::ROOM_NOT_FOUND);

        alice.join_room("r1", None).await.unwrap();
        let code = rejected_code(alice.expect(MessageType::JoinRoom, WAIT).await);
        assert_eq!(code, error_codes::ALREADY_IN_ROOM);

        handle.shutdown().await;
    }

    /// The last member leaving makes the room vanish from the listing.
    #[tokio::test]
    async fn leaving_removes_room_from_listing() {
        let handle = start(RelayConfig::datagram()).await;
        let (mut alice, mut bob) = paired(&handle, Transport::Datagram).await;

        bob.leave_room().await.unwrap();
        bob.expect(MessageType::LeaveRoom, WAIT).await.unwrap();
        let notice = alice.expect(MessageType::RoomInfo, WAIT).await.unwrap();
        assert_eq!(notice.payload["event"], "player_left");
        assert_eq!(notice.payload["players"], json!(["alice"]));

        alice.leave_room().await.unwrap();
        alice.expect(MessageType::LeaveRoom, WAIT).await.unwrap();

        alice.list_rooms().await.unwrap();
        let listing = alice.expect(MessageType::ListRooms, WAIT).await.unwrap();
        assert_eq!(listing.payload["rooms"], json!([]));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn room_listing_is_datagram_only() {
        let handle = start(RelayConfig::datagram()).await;
        let mut alice = peer(&handle, Transport::Datagram, "alice").await;
        alice.create_room("private", Some("abc")).await.unwrap();
        alice.expect(MessageType::CreateRoom, WAIT).await.unwrap();

        alice.list_rooms().await.unwrap();
        let listing = alice.expect(MessageType::ListRooms, WAIT).await.unwrap();
        let rooms = listing.payload["rooms"].as_array().unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0]["has_password"], true);
        assert_eq!(rooms[0]["max_players"], 2);
        assert!(!listing.payload["rooms"].to_string().contains("abc"));
        handle.shutdown().await;

        let handle = start(RelayConfig::stream()).await;
        let mut alice = peer(&handle, Transport::Stream, "alice").await;
        alice.list_rooms().await.unwrap();
        let code = rejected_code(alice.expect(MessageType::ListRooms, WAIT).await);
        assert_eq!(code, error_codes::UNKNOWN_MESSAGE);
        handle.shutdown().await;
    }
}

/// RELAY TESTS
mod relay_tests {
    use super::*;

    #[tokio::test]
    async fn chat_reaches_both_members() {
        let handle = start(RelayConfig::stream()).await;
        let (mut alice, mut bob) = paired(&handle, Transport::Stream).await;

        alice.chat("good luck").await.unwrap();
        for client in [&mut alice, &mut bob] {
            let chat = client.expect(MessageType::ChatMessage, WAIT).await.unwrap();
            assert_eq!(chat.payload["message"], "good luck");
            assert_eq!(chat.payload["player_name"], "alice");
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn game_state_relayed_over_datagram() {
        let handle = start(RelayConfig::datagram()).await;
        let (mut alice, mut bob) = paired(&handle, Transport::Datagram).await;

        alice
            .game_state(json!({ "grid": [[0, 1], [1, 1]], "score": 300, "level": 2 }))
            .await
            .unwrap();

        let state = bob.expect(MessageType::GameState, WAIT).await.unwrap();
        assert_eq!(state.payload["score"], 300);
        assert_eq!(state.payload["grid"], json!([[0, 1], [1, 1]]));
        assert_eq!(state.payload["player_id"], alice.player_id().unwrap());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_message_keeps_connection() {
        let handle = start(RelayConfig::stream()).await;
        let mut alice = peer(&handle, Transport::Stream, "alice").await;

        alice
            .send(Message::new(MessageType::Other("teleport".into()), Payload::new()))
            .await
            .unwrap();
        let error = alice.expect(MessageType::Error, WAIT).await.unwrap();
        assert_eq!(error.error_code(), Some(error_codes::UNKNOWN_MESSAGE));

        alice.create_room("still-here", None).await.unwrap();
        alice.expect(MessageType::CreateRoom, WAIT).await.unwrap();

        handle.shutdown().await;
    }
}

/// FAULT HANDLING TESTS
mod fault_tests {
    use super::*;

    /// One processor keeps datagrams from a peer in send order.
    fn single_processor() -> RelayConfig {
        let mut config = RelayConfig::datagram();
        config.processor_workers = 1;
        config
    }

    #[tokio::test]
    async fn zero_length_frame_closes_stream() {
        let handle = start(RelayConfig::stream()).await;
        let mut alice = peer(&handle, Transport::Stream, "alice").await;

        alice.send_raw(&[0, 0, 0, 0]).await.unwrap();
        assert!(matches!(
            alice.recv_timeout(WAIT).await,
            Err(ClientError::Closed)
        ));

        sleep(Duration::from_millis(50)).await;
        assert!(handle.relay().sessions().is_empty().await);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_stream_peer_is_announced() {
        let handle = start(RelayConfig::stream()).await;
        let (mut alice, bob) = paired(&handle, Transport::Stream).await;

        drop(bob);
        let notice = alice.expect(MessageType::RoomInfo, WAIT).await.unwrap();
        assert_eq!(notice.payload["event"], "player_left");
        assert_eq!(notice.payload["player_name"], "bob");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stale_datagram_is_ignored() {
        let handle = start(single_processor()).await;
        let mut alice = peer(&handle, Transport::Datagram, "alice").await;
        alice.create_room("r1", None).await.unwrap();
        alice.expect(MessageType::CreateRoom, WAIT).await.unwrap();

        // connect and create_room used sequences 1 and 2; replay 1.
        let replay = Message::new(MessageType::LeaveRoom, Payload::new()).sequenced(None, 1);
        alice
            .send_raw(&relay_shared::codec::encode_datagram(&replay).unwrap())
            .await
            .unwrap();
        assert!(matches!(
            alice.recv_timeout(Duration::from_millis(200)).await,
            Err(ClientError::Timeout(_))
        ));
        assert_eq!(handle.ingress_stats().unwrap().stale, 1);

        alice.leave_room().await.unwrap();
        alice.expect(MessageType::LeaveRoom, WAIT).await.unwrap();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn garbage_datagram_is_dropped() {
        let handle = start(single_processor()).await;
        let mut alice = peer(&handle, Transport::Datagram, "alice").await;

        alice.send_raw(b"\x01\x02 definitely not json").await.unwrap();
        alice.heartbeat().await.unwrap();
        alice.create_room("r1", None).await.unwrap();
        alice.expect(MessageType::CreateRoom, WAIT).await.unwrap();

        assert_eq!(handle.ingress_stats().unwrap().malformed, 1);
        assert_eq!(handle.relay().sessions().len().await, 1);
        handle.shutdown().await;
    }

    /// A silent datagram peer is evicted by the heartbeat sweep and its
    /// room-mate is told.
    #[tokio::test]
    async fn silent_datagram_peer_times_out() {
        let mut config = RelayConfig::datagram();
        config.heartbeat_interval = Duration::from_millis(50);
        config.liveness_timeout = Duration::from_millis(300);
        let handle = start(config).await;
        let (mut alice, _bob) = paired(&handle, Transport::Datagram).await;

        let mut notice = None;
        for _ in 0..50 {
            alice.heartbeat().await.unwrap();
            match alice.recv_timeout(Duration::from_millis(100)).await {
                Ok(message) if message.kind == MessageType::RoomInfo => {
                    notice = Some(message);
                    break;
                }
                Ok(_) | Err(ClientError::Timeout(_)) => {}
                Err(e) => panic!("Unexpected error: {e}"),
            }
        }
        let notice = notice.expect("bob evicted within five seconds");

        assert_eq!(notice.payload["event"], "player_left");
        assert_eq!(notice.payload["player_name"], "bob");
        assert_eq!(handle.relay().sessions().len().await, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_stream_peers() {
        let handle = start(RelayConfig::stream()).await;
        let (mut alice, _bob) = paired(&handle, Transport::Stream).await;

        handle.shutdown().await;
        let closed = loop {
            match alice.recv_timeout(WAIT).await {
                Ok(_) => continue,
                other => break other,
            }
        };
        assert!(matches!(closed, Err(ClientError::Closed)));
    }
}
