//! TCP accept loop for the V2 protocol.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use ems_broker::Engine;

use crate::protocol;

/// Accept connections until the engine's shutdown signal fires. Each
/// connection runs on its own task.
pub async fn run_tcp_server(engine: Arc<Engine>, listener: TcpListener) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    info!(addr = %local, "TCP listener ready");

    let mut shutdown = engine.shutdown_signal();
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((socket, addr)) => {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move {
                        protocol::handle_connection(engine, socket, addr).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    info!(addr = %local, "TCP listener stopped");
}
