use clap::Parser;
use log::info;
use relay_server::config::{RelayConfig, Transport};
use relay_server::network::Server;

#[derive(Parser, Debug)]
#[command(author, version, about = "Two-player room relay over TCP or UDP")]
struct Args {
    /// Port to listen on (defaults per transport: 12345 stream, 12346 datagram)
    port: Option<u16>,

    /// Address to bind to
    host: Option<String>,

    /// Wire binding: stream (TCP) or datagram (UDP)
    #[arg(short, long, default_value = "stream")]
    transport: Transport,

    /// Datagram processor workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Datagram ingress queue capacity
    #[arg(short, long)]
    queue_capacity: Option<usize>,
}

/// Parses arguments, starts the chosen binding, and shuts down on Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = RelayConfig::for_transport(args.transport);
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(workers) = args.workers {
        config.processor_workers = workers;
    }
    if let Some(capacity) = args.queue_capacity {
        config.ingress_queue_capacity = capacity;
    }

    let server = Server::bind(config).await?;
    let handle = server.spawn();

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    handle.shutdown().await;

    Ok(())
}
