use clap::{Parser, ValueEnum};
use log::{info, warn};
use relay_client::{ClientError, RelayClient};
use relay_shared::{Message, MessageType};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, MissedTickBehavior};

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(20);
const REPLY_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Stream,
    Datagram,
}

impl Transport {
    /// Where a relay for this transport listens by default.
    fn default_server(self) -> &'static str {
        match self {
            Transport::Stream => "127.0.0.1:12345",
            Transport::Datagram => "127.0.0.1:12346",
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Line-oriented relay peer", long_about = None)]
struct Args {
    /// Server address to connect to (defaults per transport: 12345 stream,
    /// 12346 datagram)
    #[arg(short = 's', long)]
    server: Option<String>,

    /// Wire binding to use
    #[arg(short = 't', long, value_enum, default_value = "stream")]
    transport: Transport,

    /// Display name sent with connect
    #[arg(short = 'n', long, default_value = "player")]
    name: String,

    /// Room to create on startup
    #[arg(long, conflicts_with = "join")]
    create: Option<String>,

    /// Room to join on startup
    #[arg(long)]
    join: Option<String>,

    /// Room password
    #[arg(short = 'p', long)]
    password: Option<String>,
}

impl Args {
    fn server_addr(&self) -> &str {
        self.server
            .as_deref()
            .unwrap_or_else(|| self.transport.default_server())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server = args.server_addr();

    info!("Connecting to {} over {:?}", server, args.transport);
    let mut client = match args.transport {
        Transport::Stream => RelayClient::connect_stream(server).await?,
        Transport::Datagram => RelayClient::connect_datagram(server).await?,
    };

    let id = client.login(&args.name, REPLY_WAIT).await?;
    info!("Connected as {} ({})", args.name, id);

    let password = args.password.as_deref();
    if let Some(room) = &args.create {
        client.create_room(room, password).await?;
        client.expect(MessageType::CreateRoom, REPLY_WAIT).await?;
        info!("Created room {}", room);
    } else if let Some(room) = &args.join {
        client.join_room(room, password).await?;
        let reply = client.expect(MessageType::JoinRoom, REPLY_WAIT).await?;
        let players = reply.payload.get("players").cloned().unwrap_or(Value::Null);
        info!("Joined room {} with {}", room, players);
    }

    info!("Type to chat. /list, /leave, /quit");
    run(&mut client).await?;

    client.disconnect().await?;
    Ok(())
}

/// Relays stdin lines as chat and prints everything the server sends.
async fn run(client: &mut RelayClient) -> Result<(), ClientError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut heartbeat = interval(HEARTBEAT_PERIOD);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/leave" => client.leave_room().await?,
                    "/list" => client.list_rooms().await?,
                    text => client.chat(text).await?,
                }
            }
            message = client.recv() => {
                let Some(message) = message else {
                    warn!("Server closed the connection");
                    break;
                };
                print_message(&message);
            }
            _ = heartbeat.tick() => client.heartbeat().await?,
        }
    }
    Ok(())
}

fn print_message(message: &Message) {
    let data = Value::Object(message.payload.clone());
    match message.kind {
        MessageType::ChatMessage => {
            println!("<{}> {}", data["player_name"], data["message"]);
        }
        MessageType::RoomInfo => {
            println!("* {} {} (players: {})", data["player_name"], data["event"], data["players"]);
        }
        MessageType::Error => {
            println!("! {}: {}", data["error_code"], data["error_message"]);
        }
        _ => println!("{} {}", message.kind, data),
    }
}
