//! CLI for PopChat
//!
//! Subcommands:
//! - `server`: run the relay
//! - `client`: connect, optionally send one message, then print deliveries

use std::sync::Arc;

use clap::Parser;
use popchat::broker::Relay;
use popchat::client::RelayClient;
use popchat::config::load_config;
use popchat::persistence::MessageStore;
use popchat::session::Handshake;
use popchat::transport::start_websocket_server;
use popchat::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "popchat")]
enum Command {
    /// Start the relay server
    Server,
    /// Connect to a relay and print every message it delivers
    Client {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:3000")]
        url: String,
        /// Name shown as the sender of submitted messages
        #[arg(long, default_value = "anonymous")]
        name: String,
        /// Id of the last message already seen; later ones are replayed
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Session id to resume
        #[arg(long)]
        session: Option<String>,
        /// Message to submit once connected
        text: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    match cmd {
        Command::Server => {
            if let Err(e) = run_server().await {
                error!("Server failed: {}", e);
            }
        }
        Command::Client {
            url,
            name,
            offset,
            session,
            text,
        } => {
            logging::init("info");
            let handshake = Handshake {
                session_id: session,
                offset,
            };
            if let Err(e) = run_client(&url, &name, handshake, text.as_deref()).await {
                error!("Client failed: {}", e);
            }
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    logging::init(&config.log.level);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let store = MessageStore::open(
        &config.persistence.path,
        config.persistence.flush_on_append,
    )?;
    info!(
        path = %config.persistence.path,
        last_id = store.last_id()?,
        "message log opened"
    );
    let relay = Arc::new(Relay::new(store, &config.relay));

    tokio::spawn(Relay::start_expiry_loop(relay.clone()));

    tokio::select! {
        res = start_websocket_server(addr, relay.clone()) => {
            match res {
                Ok(()) => error!("WebSocket server exited unexpectedly."),
                Err(e) => return Err(e.into()),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    relay.store().flush()?;
    Ok(())
}

async fn run_client(
    url: &str,
    name: &str,
    handshake: Handshake,
    text: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = RelayClient::connect(url, handshake).await?;
    println!(
        "session {} (recovered: {})",
        client.session_id(),
        client.recovered()
    );

    if let Some(text) = text {
        let token = client.submit(name, text).await?;
        println!("acknowledged {token}");
    }

    loop {
        tokio::select! {
            delivery = client.next_delivery() => {
                let delivery = delivery?;
                println!("[{}] {}: {}", delivery.id, delivery.sender_name, delivery.content);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!(
        "resume with --session {} --offset {}",
        client.session_id(),
        client.last_seen_id()
    );
    client.close().await?;
    Ok(())
}
