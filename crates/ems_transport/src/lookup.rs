//! Directory registration client.
//!
//! One TCP peer per configured lookupd address. On connect: magic
//! `"  V1"`, an IDENTIFY with this node's broadcast info, then a replay
//! of REGISTER for the current topology. Afterwards the loop forwards
//! topology notifications as REGISTER/UNREGISTER, pings every 15 s, and
//! rebuilds the peer set when the configured address list changes.
//! Peer failures are logged and retried on the next command; they never
//! take the node down.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use ems_broker::{Engine, Notification};

use crate::frame::MAGIC_V1;

const PING_INTERVAL: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn lookup_loop(engine: Arc<Engine>, mut notify_rx: mpsc::UnboundedReceiver<Notification>) {
    let mut peers: Vec<LookupPeer> = Vec::new();
    sync_peers(&engine, &mut peers);

    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = engine.shutdown_signal();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for peer in &mut peers {
                    if let Err(e) = peer.command(&engine, b"PING\n".to_vec()).await {
                        warn!(peer = %peer.addr, error = %e, "lookup ping failed");
                    }
                }
            }

            n = notify_rx.recv() => {
                let Some(n) = n else { break };
                match n {
                    Notification::OptionsReload => sync_peers(&engine, &mut peers),
                    other => {
                        let cmd = notification_command(&other);
                        for peer in &mut peers {
                            debug!(peer = %peer.addr, cmd = %String::from_utf8_lossy(&cmd).trim_end(), "lookup update");
                            if let Err(e) = peer.command(&engine, cmd.clone()).await {
                                warn!(peer = %peer.addr, error = %e, "lookup update failed");
                            }
                        }
                    }
                }
            }

            _ = shutdown.changed() => break,
        }
    }
    info!("lookup loop exited");
}

fn notification_command(n: &Notification) -> Vec<u8> {
    match n {
        Notification::RegisterTopic(t) => format!("REGISTER {t}\n").into_bytes(),
        Notification::UnregisterTopic(t) => format!("UNREGISTER {t}\n").into_bytes(),
        Notification::RegisterChannel { topic, channel } => {
            format!("REGISTER {topic} {channel}\n").into_bytes()
        }
        Notification::UnregisterChannel { topic, channel } => {
            format!("UNREGISTER {topic} {channel}\n").into_bytes()
        }
        Notification::OptionsReload => unreachable!("handled by the caller"),
    }
}

/// Reconcile the peer list with the configured addresses; dropped peers
/// are closed, new ones connect lazily on their first command.
fn sync_peers(engine: &Arc<Engine>, peers: &mut Vec<LookupPeer>) {
    let configured = engine.opts().lookup.lookupd_tcp_addresses.clone();
    peers.retain(|p| {
        let keep = configured.contains(&p.addr);
        if !keep {
            info!(peer = %p.addr, "removing lookup peer");
        }
        keep
    });
    for addr in configured {
        if !peers.iter().any(|p| p.addr == addr) {
            info!(peer = %addr, "adding lookup peer");
            peers.push(LookupPeer::new(addr));
        }
    }
}

struct LookupPeer {
    addr: String,
    stream: Option<TcpStream>,
}

impl LookupPeer {
    fn new(addr: String) -> Self {
        Self { addr, stream: None }
    }

    /// Send one command, reconnecting (and replaying the topology)
    /// first if needed. Any failure resets the connection.
    async fn command(&mut self, engine: &Arc<Engine>, cmd: Vec<u8>) -> std::io::Result<Vec<u8>> {
        if self.stream.is_none() {
            self.connect(engine).await?;
        }
        match self.roundtrip(&cmd).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    async fn connect(&mut self, engine: &Arc<Engine>) -> std::io::Result<()> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"))??;
        self.stream = Some(stream);
        info!(peer = %self.addr, "lookup peer connected");

        let opts = engine.opts();
        let tcp_port = match opts.server.broadcast_tcp_port {
            0 => port_of(&opts.server.tcp_address),
            p => p,
        };
        let http_port = match opts.server.broadcast_http_port {
            0 => port_of(&opts.server.http_address),
            p => p,
        };
        let body = serde_json::to_vec(&json!({
            "version": env!("CARGO_PKG_VERSION"),
            "tcp_port": tcp_port,
            "http_port": http_port,
            "hostname": opts.server.broadcast_address,
            "broadcast_address": opts.server.broadcast_address,
        }))
        .expect("static identify document serializes");

        let mut identify = Vec::with_capacity(16 + body.len());
        identify.extend_from_slice(MAGIC_V1);
        identify.extend_from_slice(b"IDENTIFY\n");
        identify.extend_from_slice(&(body.len() as u32).to_be_bytes());
        identify.extend_from_slice(&body);

        if let Err(e) = self.roundtrip(&identify).await {
            self.stream = None;
            return Err(e);
        }

        // bring the fresh peer up to date with the current topology
        for topic in engine.topics() {
            let channels = topic.channels();
            let cmds: Vec<Vec<u8>> = if channels.is_empty() {
                vec![format!("REGISTER {}\n", topic.name).into_bytes()]
            } else {
                channels
                    .iter()
                    .map(|c| format!("REGISTER {} {}\n", topic.name, c.name).into_bytes())
                    .collect()
            };
            for cmd in cmds {
                if let Err(e) = self.roundtrip(&cmd).await {
                    self.stream = None;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn roundtrip(&mut self, cmd: &[u8]) -> std::io::Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "no peer"))?;
        stream.write_all(cmd).await?;

        let read = async {
            let len = stream.read_u32().await?;
            let mut data = vec![0u8; len as usize];
            stream.read_exact(&mut data).await?;
            Ok::<_, std::io::Error>(data)
        };
        timeout(RESPONSE_TIMEOUT, read)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "response timeout"))?
    }
}

fn port_of(addr: &str) -> u16 {
    addr.rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0)
}
