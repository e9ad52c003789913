use log::{debug, warn};
use relay_shared::codec::{decode_datagram, encode_datagram, read_frame, write_frame, CodecError};
use relay_shared::{Message, MessageType, Payload};
use serde_json::{json, Value};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const INCOMING_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("server rejected request: {code}: {message}")]
    Rejected { code: String, message: String },
}

enum Link {
    Stream(OwnedWriteHalf),
    Datagram {
        socket: Arc<UdpSocket>,
        next_sequence: u32,
    },
}

/// Async peer for either relay transport
///
/// A background task decodes everything the server sends into a channel, so
/// [`RelayClient::recv`] is safe to use inside `tokio::select!`.
pub struct RelayClient {
    link: Link,
    incoming: mpsc::Receiver<Message>,
    reader: JoinHandle<()>,
    player_id: Option<String>,
}

impl RelayClient {
    /// Opens a TCP connection to a stream relay.
    pub async fn connect_stream(addr: &str) -> Result<Self, ClientError> {
        let server_addr = resolve(addr).await?;
        let stream = TcpStream::connect(server_addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (tx, incoming) = mpsc::channel(INCOMING_CAPACITY);
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match read_frame(&mut reader).await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if e.is_eof() => {
                        debug!("Server closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Stream read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            link: Link::Stream(write_half),
            incoming,
            reader,
            player_id: None,
        })
    }

    /// Binds a local UDP socket aimed at a datagram relay.
    pub async fn connect_datagram(addr: &str) -> Result<Self, ClientError> {
        let server_addr = resolve(addr).await?;
        let local = if server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = Arc::new(UdpSocket::bind(local).await?);
        socket.connect(server_addr).await?;

        let (tx, incoming) = mpsc::channel(INCOMING_CAPACITY);
        let recv_socket = Arc::clone(&socket);
        let reader = tokio::spawn(async move {
            let mut buffer = vec![0u8; 65536];
            loop {
                let len = match recv_socket.recv(&mut buffer).await {
                    Ok(len) => len,
                    Err(e) => {
                        debug!("Datagram receive failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };
                match decode_datagram(&buffer[..len]) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed datagram: {}", e),
                }
            }
        });

        Ok(Self {
            link: Link::Datagram {
                socket,
                next_sequence: 1,
            },
            incoming,
            reader,
            player_id: None,
        })
    }

    /// Session id assigned by the server, known after [`RelayClient::login`].
    pub fn player_id(&self) -> Option<&str> {
        self.player_id.as_deref()
    }

    /// Sends one message. Datagram sends are stamped with the player id and
    /// the next sequence number.
    pub async fn send(&mut self, message: Message) -> Result<(), ClientError> {
        match &mut self.link {
            Link::Stream(writer) => write_frame(writer, &message).await?,
            Link::Datagram {
                socket,
                next_sequence,
            } => {
                let sequence = *next_sequence;
                *next_sequence = next_sequence.wrapping_add(1).max(1);
                let message = message.sequenced(self.player_id.clone(), sequence);
                socket.send(&encode_datagram(&message)?).await?;
            }
        }
        Ok(())
    }

    /// Sends pre-encoded bytes as they are, bypassing framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        match &mut self.link {
            Link::Stream(writer) => writer.write_all(bytes).await?,
            Link::Datagram { socket, .. } => {
                socket.send(bytes).await?;
            }
        }
        Ok(())
    }

    /// Next message from the server, or None once the link is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.incoming.recv().await
    }

    pub async fn recv_timeout(&mut self, wait: Duration) -> Result<Message, ClientError> {
        match timeout(wait, self.incoming.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout(wait)),
        }
    }

    /// Waits for a message of `kind`, discarding anything else. An `error`
    /// message ends the wait as [`ClientError::Rejected`].
    pub async fn expect(&mut self, kind: MessageType, wait: Duration) -> Result<Message, ClientError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let message = self.recv_timeout(remaining).await?;
            if message.kind == kind {
                return Ok(message);
            }
            if let Some(code) = message.error_code() {
                return Err(ClientError::Rejected {
                    code: code.to_string(),
                    message: message.str_field("error_message").unwrap_or_default().to_string(),
                });
            }
            debug!("Skipping {} while waiting for {}", message.kind, kind);
        }
    }

    /// Sends `connect` and records the assigned player id.
    pub async fn login(&mut self, player_name: &str, wait: Duration) -> Result<String, ClientError> {
        self.send(Message::connect(player_name)).await?;
        let reply = self.expect(MessageType::Connect, wait).await?;
        let id = reply.str_field("player_id").unwrap_or_default().to_string();
        self.player_id = Some(id.clone());
        Ok(id)
    }

    pub async fn create_room(&mut self, room_id: &str, password: Option<&str>) -> Result<(), ClientError> {
        self.send(Message::create_room(room_id, password)).await
    }

    pub async fn join_room(&mut self, room_id: &str, password: Option<&str>) -> Result<(), ClientError> {
        self.send(Message::join_room(room_id, password)).await
    }

    pub async fn leave_room(&mut self) -> Result<(), ClientError> {
        self.send(Message::new(MessageType::LeaveRoom, Payload::new())).await
    }

    pub async fn list_rooms(&mut self) -> Result<(), ClientError> {
        self.send(Message::new(MessageType::ListRooms, Payload::new())).await
    }

    pub async fn chat(&mut self, text: &str) -> Result<(), ClientError> {
        self.send(Message::chat(text)).await
    }

    pub async fn player_action(&mut self, action: &str) -> Result<(), ClientError> {
        self.send(Message::with_data(
            MessageType::PlayerAction,
            json!({ "action": action }),
        ))
        .await
    }

    pub async fn game_state(&mut self, state: Value) -> Result<(), ClientError> {
        self.send(Message::with_data(MessageType::GameState, state)).await
    }

    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        self.send(Message::new(MessageType::Heartbeat, Payload::new())).await
    }

    /// Tells the server to drop this session and stops the reader.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        let result = self
            .send(Message::new(MessageType::Disconnect, Payload::new()))
            .await;
        self.reader.abort();
        result
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, ClientError> {
    lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| ClientError::Resolve(addr.to_string()))
}
