use serde::Deserialize;

/// Top-level configuration for an `emsd` node.
///
/// Sections group the knobs the way the components consume them: network
/// listeners, queue storage, the background scanner, per-client protocol
/// limits, and the external lookup/auth peers.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub queue: QueueSettings,
    pub scan: ScanSettings,
    pub client: ClientSettings,
    pub lookup: LookupSettings,
    pub auth: AuthSettings,
    pub tls: TlsSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Address the TCP protocol listener binds to.
    pub tcp_address: String,
    /// Address the HTTP surface binds to.
    pub http_address: String,
    /// Address registered with lookup peers and reported to clients.
    pub broadcast_address: String,
    /// Port advertised to lookup peers; 0 means the bound TCP port.
    pub broadcast_tcp_port: u16,
    /// Port advertised to lookup peers; 0 means the bound HTTP port.
    pub broadcast_http_port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    /// Directory holding disk queue segments and `emsd.dat`.
    pub data_path: String,
    /// Messages buffered in memory per topic/channel before spilling to disk.
    pub mem_queue_size: usize,
    pub max_bytes_per_file: i64,
    /// fsync after this many writes.
    pub sync_every: u64,
    /// fsync after this much write inactivity (ms).
    pub sync_timeout_ms: u64,
    pub min_msg_size: u32,
    pub max_msg_size: u32,
    /// Cap on a single command body (MPUB totals included).
    pub max_body_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanSettings {
    pub interval_ms: u64,
    pub refresh_interval_ms: u64,
    pub selection_count: usize,
    pub worker_pool_max: usize,
    pub dirty_percent: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    /// Default in-flight timeout handed to new clients (ms).
    pub msg_timeout_ms: u64,
    /// Ceiling a TOUCH (or negotiated msg_timeout) may extend to (ms).
    pub max_msg_timeout_ms: u64,
    /// Ceiling on REQ/DPUB delays (ms).
    pub max_req_timeout_ms: u64,
    pub max_rdy_count: i64,
    pub max_heartbeat_interval_ms: u64,
    pub output_buffer_timeout_ms: u64,
    pub max_output_buffer_size: usize,
    pub max_output_buffer_timeout_ms: u64,
    /// 0 means unlimited consumers per channel.
    pub max_channel_consumers: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LookupSettings {
    /// `host:port` of each lookup directory peer. May be changed at
    /// runtime through `PUT /config/lookupd_tcp_addresses`.
    pub lookupd_tcp_addresses: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// HTTP auth peers queried with client secrets; empty disables AUTH.
    pub auth_http_addresses: Vec<String>,
    pub http_request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsSettings {
    pub cert: String,
    pub key: String,
    pub required: bool,
}

/// Partial mirror of `Settings` for file/environment overlays; every
/// field is optional and missing values fall back to the defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub queue: Option<PartialQueueSettings>,
    pub scan: Option<PartialScanSettings>,
    pub client: Option<PartialClientSettings>,
    pub lookup: Option<PartialLookupSettings>,
    pub auth: Option<PartialAuthSettings>,
    pub tls: Option<PartialTlsSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialServerSettings {
    pub tcp_address: Option<String>,
    pub http_address: Option<String>,
    pub broadcast_address: Option<String>,
    pub broadcast_tcp_port: Option<u16>,
    pub broadcast_http_port: Option<u16>,
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialQueueSettings {
    pub data_path: Option<String>,
    pub mem_queue_size: Option<usize>,
    pub max_bytes_per_file: Option<i64>,
    pub sync_every: Option<u64>,
    pub sync_timeout_ms: Option<u64>,
    pub min_msg_size: Option<u32>,
    pub max_msg_size: Option<u32>,
    pub max_body_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialScanSettings {
    pub interval_ms: Option<u64>,
    pub refresh_interval_ms: Option<u64>,
    pub selection_count: Option<usize>,
    pub worker_pool_max: Option<usize>,
    pub dirty_percent: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialClientSettings {
    pub msg_timeout_ms: Option<u64>,
    pub max_msg_timeout_ms: Option<u64>,
    pub max_req_timeout_ms: Option<u64>,
    pub max_rdy_count: Option<i64>,
    pub max_heartbeat_interval_ms: Option<u64>,
    pub output_buffer_timeout_ms: Option<u64>,
    pub max_output_buffer_size: Option<usize>,
    pub max_output_buffer_timeout_ms: Option<u64>,
    pub max_channel_consumers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLookupSettings {
    pub lookupd_tcp_addresses: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialAuthSettings {
    pub auth_http_addresses: Option<Vec<String>>,
    pub http_request_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialTlsSettings {
    pub cert: Option<String>,
    pub key: Option<String>,
    pub required: Option<bool>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                tcp_address: "0.0.0.0:4150".to_string(),
                http_address: "0.0.0.0:4151".to_string(),
                broadcast_address: hostname(),
                broadcast_tcp_port: 0,
                broadcast_http_port: 0,
                log_level: "info".to_string(),
            },
            queue: QueueSettings {
                data_path: ".".to_string(),
                mem_queue_size: 10_000,
                max_bytes_per_file: 100 * 1024 * 1024,
                sync_every: 2500,
                sync_timeout_ms: 2_000,
                min_msg_size: 0,
                max_msg_size: 1024 * 1024,
                max_body_size: 5 * 1024 * 1024,
            },
            scan: ScanSettings {
                interval_ms: 100,
                refresh_interval_ms: 5_000,
                selection_count: 20,
                worker_pool_max: 4,
                dirty_percent: 0.25,
            },
            client: ClientSettings {
                msg_timeout_ms: 60_000,
                max_msg_timeout_ms: 15 * 60_000,
                max_req_timeout_ms: 60 * 60_000,
                max_rdy_count: 2500,
                max_heartbeat_interval_ms: 60_000,
                output_buffer_timeout_ms: 250,
                max_output_buffer_size: 64 * 1024,
                max_output_buffer_timeout_ms: 30_000,
                max_channel_consumers: 0,
            },
            lookup: LookupSettings {
                lookupd_tcp_addresses: Vec::new(),
            },
            auth: AuthSettings {
                auth_http_addresses: Vec::new(),
                http_request_timeout_ms: 5_000,
            },
            tls: TlsSettings {
                cert: String::new(),
                key: String::new(),
                required: false,
            },
        }
    }
}

impl Settings {
    /// Overlay `partial` on top of `self`, field by field.
    pub fn merged(self, partial: PartialSettings) -> Settings {
        let d = self;
        let server = partial.server.unwrap_or_default();
        let queue = partial.queue.unwrap_or_default();
        let scan = partial.scan.unwrap_or_default();
        let client = partial.client.unwrap_or_default();
        let lookup = partial.lookup.unwrap_or_default();
        let auth = partial.auth.unwrap_or_default();
        let tls = partial.tls.unwrap_or_default();

        Settings {
            server: ServerSettings {
                tcp_address: server.tcp_address.unwrap_or(d.server.tcp_address),
                http_address: server.http_address.unwrap_or(d.server.http_address),
                broadcast_address: server
                    .broadcast_address
                    .unwrap_or(d.server.broadcast_address),
                broadcast_tcp_port: server
                    .broadcast_tcp_port
                    .unwrap_or(d.server.broadcast_tcp_port),
                broadcast_http_port: server
                    .broadcast_http_port
                    .unwrap_or(d.server.broadcast_http_port),
                log_level: server.log_level.unwrap_or(d.server.log_level),
            },
            queue: QueueSettings {
                data_path: queue.data_path.unwrap_or(d.queue.data_path),
                mem_queue_size: queue.mem_queue_size.unwrap_or(d.queue.mem_queue_size),
                max_bytes_per_file: queue
                    .max_bytes_per_file
                    .unwrap_or(d.queue.max_bytes_per_file),
                sync_every: queue.sync_every.unwrap_or(d.queue.sync_every),
                sync_timeout_ms: queue.sync_timeout_ms.unwrap_or(d.queue.sync_timeout_ms),
                min_msg_size: queue.min_msg_size.unwrap_or(d.queue.min_msg_size),
                max_msg_size: queue.max_msg_size.unwrap_or(d.queue.max_msg_size),
                max_body_size: queue.max_body_size.unwrap_or(d.queue.max_body_size),
            },
            scan: ScanSettings {
                interval_ms: scan.interval_ms.unwrap_or(d.scan.interval_ms),
                refresh_interval_ms: scan
                    .refresh_interval_ms
                    .unwrap_or(d.scan.refresh_interval_ms),
                selection_count: scan.selection_count.unwrap_or(d.scan.selection_count),
                worker_pool_max: scan.worker_pool_max.unwrap_or(d.scan.worker_pool_max),
                dirty_percent: scan.dirty_percent.unwrap_or(d.scan.dirty_percent),
            },
            client: ClientSettings {
                msg_timeout_ms: client.msg_timeout_ms.unwrap_or(d.client.msg_timeout_ms),
                max_msg_timeout_ms: client
                    .max_msg_timeout_ms
                    .unwrap_or(d.client.max_msg_timeout_ms),
                max_req_timeout_ms: client
                    .max_req_timeout_ms
                    .unwrap_or(d.client.max_req_timeout_ms),
                max_rdy_count: client.max_rdy_count.unwrap_or(d.client.max_rdy_count),
                max_heartbeat_interval_ms: client
                    .max_heartbeat_interval_ms
                    .unwrap_or(d.client.max_heartbeat_interval_ms),
                output_buffer_timeout_ms: client
                    .output_buffer_timeout_ms
                    .unwrap_or(d.client.output_buffer_timeout_ms),
                max_output_buffer_size: client
                    .max_output_buffer_size
                    .unwrap_or(d.client.max_output_buffer_size),
                max_output_buffer_timeout_ms: client
                    .max_output_buffer_timeout_ms
                    .unwrap_or(d.client.max_output_buffer_timeout_ms),
                max_channel_consumers: client
                    .max_channel_consumers
                    .unwrap_or(d.client.max_channel_consumers),
            },
            lookup: LookupSettings {
                lookupd_tcp_addresses: lookup
                    .lookupd_tcp_addresses
                    .unwrap_or(d.lookup.lookupd_tcp_addresses),
            },
            auth: AuthSettings {
                auth_http_addresses: auth
                    .auth_http_addresses
                    .unwrap_or(d.auth.auth_http_addresses),
                http_request_timeout_ms: auth
                    .http_request_timeout_ms
                    .unwrap_or(d.auth.http_request_timeout_ms),
            },
            tls: TlsSettings {
                cert: tls.cert.unwrap_or(d.tls.cert),
                key: tls.key.unwrap_or(d.tls.key),
                required: tls.required.unwrap_or(d.tls.required),
            },
        }
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.queue.max_msg_size > self.queue.max_body_size {
            return Err("queue.max_msg_size cannot exceed queue.max_body_size".into());
        }
        if self.client.msg_timeout_ms > self.client.max_msg_timeout_ms {
            return Err("client.msg_timeout_ms cannot exceed client.max_msg_timeout_ms".into());
        }
        if !(0.0..=1.0).contains(&self.scan.dirty_percent) {
            return Err("scan.dirty_percent must be within [0, 1]".into());
        }
        if self.scan.worker_pool_max == 0 {
            return Err("scan.worker_pool_max must be at least 1".into());
        }
        Ok(())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
