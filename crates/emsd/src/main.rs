//! CLI for emsd
//!
//! Subcommands:
//! - `server`: run the broker node (TCP protocol + HTTP surface)
//! - `client`: run a simple smoke client (subscribe and print, or
//!   publish a single message)

use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use ems_broker::{scanner, Engine};
use ems_config::load_config;

#[derive(Parser)]
#[command(name = "emsd")]
enum Command {
    /// Start the broker node
    Server,
    /// Run a smoke client against a node
    Client {
        /// TCP address of the node to connect to
        #[arg(long, default_value = "127.0.0.1:4150")]
        addr: String,
        #[arg(long, default_value = "test")]
        topic: String,
        #[arg(long, default_value = "smoke")]
        channel: String,
        /// Publish this message instead of subscribing
        #[arg(long)]
        publish: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    match cmd {
        Command::Server => {
            if let Err(e) = run_server().await {
                error!("server failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Client {
            addr,
            topic,
            channel,
            publish,
        } => {
            ems_utils::logging::init("info");
            if let Err(e) = run_client(&addr, &topic, &channel, publish).await {
                error!("client failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    ems_utils::logging::init(&config.server.log_level);
    config.validate()?;

    let engine = Engine::new(config.clone());
    engine.load_metadata()?;

    let tcp_listener = TcpListener::bind(&config.server.tcp_address).await?;
    let http_listener = TcpListener::bind(&config.server.http_address).await?;
    info!(
        tcp = %config.server.tcp_address,
        http = %config.server.http_address,
        data = %config.queue.data_path,
        "emsd starting"
    );

    engine.start();
    tokio::spawn(scanner::queue_scan_loop(Arc::clone(&engine)));
    tokio::spawn(ems_transport::tcp::run_tcp_server(
        Arc::clone(&engine),
        tcp_listener,
    ));
    tokio::spawn(ems_transport::http::run_http_server(
        Arc::clone(&engine),
        http_listener,
    ));
    let notifications = engine
        .take_notifications()
        .expect("notifications taken once at startup");
    tokio::spawn(ems_transport::lookup::lookup_loop(
        Arc::clone(&engine),
        notifications,
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, exiting gracefully");
    engine.exit().await;
    Ok(())
}

async fn run_client(
    addr: &str,
    topic: &str,
    channel: &str,
    publish: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = ems_client::Client::connect(addr).await?;
    let identity = json!({
        "client_id": "emsd-cli",
        "hostname": "emsd-cli",
        "user_agent": concat!("emsd-cli/", env!("CARGO_PKG_VERSION")),
        "feature_negotiation": true,
    });
    let frame = client.identify(&identity).await?;
    info!(
        "identified: {}",
        String::from_utf8_lossy(&frame.data)
    );

    if let Some(message) = publish {
        let frame = client.publish(topic, message.as_bytes()).await?;
        info!("published: {}", String::from_utf8_lossy(&frame.data));
        return Ok(());
    }

    client.subscribe(topic, channel).await?;
    client.rdy(1).await?;
    info!(topic, channel, "subscribed, waiting for messages (ctrl-c to stop)");
    loop {
        let msg = client.next_message().await?;
        println!(
            "[{}] attempts={} {}",
            msg.id_str(),
            msg.attempts,
            String::from_utf8_lossy(&msg.body)
        );
        client.fin(&msg.id_str()).await?;
        client.rdy(1).await?;
    }
}
