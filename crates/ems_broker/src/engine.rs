//! Engine root: owns the topic registry, node options, health, the
//! lookup notification stream and metadata persistence. Everything the
//! transports call lands here first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use ems_config::Settings;
use ems_persistence::{metadata, ChannelMeta, Metadata, QueueOptions, TopicMeta};

use crate::channel::Channel;
use crate::error::EngineError;
use crate::message::MSG_MIN_SIZE;
use crate::stats::EngineStats;
use crate::topic::Topic;

/// Topology change announcements, consumed by the lookup peer loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    RegisterTopic(String),
    UnregisterTopic(String),
    RegisterChannel { topic: String, channel: String },
    UnregisterChannel { topic: String, channel: String },
    /// Runtime options changed (e.g. the lookupd address list).
    OptionsReload,
}

/// Shared engine context handed to topics and channels: live options,
/// health, the notification sink and id sequences.
pub struct Context {
    opts: ArcSwap<Settings>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    healthy: AtomicBool,
    health_reason: Mutex<String>,
    is_loading: AtomicBool,
    client_id_seq: AtomicI64,
}

impl Context {
    fn new(settings: Settings, notify_tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            opts: ArcSwap::from_pointee(settings),
            notify_tx,
            healthy: AtomicBool::new(true),
            health_reason: Mutex::new(String::new()),
            is_loading: AtomicBool::new(false),
            client_id_seq: AtomicI64::new(1),
        }
    }

    pub fn opts(&self) -> Arc<Settings> {
        self.opts.load_full()
    }

    pub fn swap_opts(&self, settings: Settings) {
        self.opts.store(Arc::new(settings));
    }

    /// Suppressed while metadata is replayed at startup.
    pub fn notify(&self, n: Notification) {
        if !self.is_loading.load(Ordering::Acquire) {
            let _ = self.notify_tx.send(n);
        }
    }

    pub fn set_loading(&self, loading: bool) {
        self.is_loading.store(loading, Ordering::Release);
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading.load(Ordering::Acquire)
    }

    pub fn next_client_id(&self) -> i64 {
        self.client_id_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_healthy(&self) {
        if !self.healthy.load(Ordering::Acquire) {
            self.healthy.store(true, Ordering::Release);
            info!("node healthy again");
        }
    }

    pub fn set_unhealthy(&self, reason: &dyn std::fmt::Display) {
        *self.health_reason.lock() = reason.to_string();
        self.healthy.store(false, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn health(&self) -> String {
        if self.is_healthy() {
            "OK".to_string()
        } else {
            format!("NOK - {}", self.health_reason.lock())
        }
    }
}

/// Disk queue knobs derived from node settings. Backends store encoded
/// messages, so the size bounds include the fixed header.
pub fn queue_options(settings: &Settings) -> QueueOptions {
    QueueOptions {
        max_bytes_per_file: settings.queue.max_bytes_per_file,
        min_msg_size: MSG_MIN_SIZE as u32,
        max_msg_size: settings.queue.max_msg_size + MSG_MIN_SIZE as u32,
        sync_every: settings.queue.sync_every,
        sync_timeout: Duration::from_millis(settings.queue.sync_timeout_ms),
    }
}

pub struct Engine {
    pub ctx: Arc<Context>,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    /// Raw notification stream out of topics/channels.
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    /// Forwarded stream for the lookup loop, after metadata persistence.
    forward_tx: mpsc::UnboundedSender<Notification>,
    forward_rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    shutdown_tx: watch::Sender<bool>,
    start_ts: i64,
}

impl Engine {
    pub fn new(settings: Settings) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            ctx: Arc::new(Context::new(settings, notify_tx)),
            topics: RwLock::new(HashMap::new()),
            notify_rx: Mutex::new(Some(notify_rx)),
            forward_tx,
            forward_rx: Mutex::new(Some(forward_rx)),
            shutdown_tx,
            start_ts: ems_utils::time::now_ns(),
        })
    }

    pub fn opts(&self) -> Arc<Settings> {
        self.ctx.opts()
    }

    /// Apply a runtime settings change and kick the lookup loop.
    pub fn update_opts<F: FnOnce(&mut Settings)>(&self, f: F) {
        let mut settings = (*self.ctx.opts()).clone();
        f(&mut settings);
        self.ctx.swap_opts(settings);
        self.ctx.notify(Notification::OptionsReload);
    }

    /// Subscription point for the lookup loop; takeable once.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.forward_rx.lock().take()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_exiting(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    // ---- topic registry ----

    pub fn get_topic(&self, name: &str) -> Result<Arc<Topic>, EngineError> {
        if !ems_utils::names::is_valid_topic_name(name) {
            return Err(EngineError::InvalidName(name.to_string()));
        }
        if let Some(topic) = self.topics.read().get(name) {
            return Ok(Arc::clone(topic));
        }

        let (topic, created) = {
            let mut topics = self.topics.write();
            match topics.get(name) {
                Some(topic) => (Arc::clone(topic), false),
                None => {
                    let topic = Topic::new(Arc::clone(&self.ctx), name.to_string())?;
                    topics.insert(name.to_string(), Arc::clone(&topic));
                    (topic, true)
                }
            }
        };

        if created {
            self.ctx
                .notify(Notification::RegisterTopic(name.to_string()));
            // topics created after startup have no metadata to wait for
            if !self.ctx.is_loading() {
                topic.start();
            }
        }
        Ok(topic)
    }

    pub fn get_existing_topic(&self, name: &str) -> Result<Arc<Topic>, EngineError> {
        self.topics
            .read()
            .get(name)
            .cloned()
            .ok_or(EngineError::TopicNotFound)
    }

    pub async fn delete_existing_topic(&self, name: &str) -> Result<(), EngineError> {
        let topic = self
            .topics
            .write()
            .remove(name)
            .ok_or(EngineError::TopicNotFound)?;
        topic.delete().await
    }

    pub fn topics(&self) -> Vec<Arc<Topic>> {
        self.topics.read().values().cloned().collect()
    }

    /// Snapshot of every channel on the node, for the scanner and stats.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.topics
            .read()
            .values()
            .flat_map(|t| t.channels())
            .collect()
    }

    // ---- metadata ----

    /// Recreate topics and channels recorded in `emsd.dat`.
    /// Registration side effects and persistence stay suppressed until
    /// this finishes.
    pub fn load_metadata(&self) -> Result<(), EngineError> {
        self.ctx.set_loading(true);
        let result = self.load_metadata_inner();
        self.ctx.set_loading(false);
        result
    }

    fn load_metadata_inner(&self) -> Result<(), EngineError> {
        let data_path = self.opts().queue.data_path.clone();
        let Some(meta) = metadata::load(&data_path)? else {
            info!("no metadata file, starting fresh");
            return Ok(());
        };

        for topic_meta in meta.topics {
            if !ems_utils::names::is_valid_topic_name(&topic_meta.name) {
                warn!(topic = %topic_meta.name, "skipping invalid topic in metadata");
                continue;
            }
            let topic = self.get_topic(&topic_meta.name)?;
            if topic_meta.paused {
                topic.pause();
            }
            for channel_meta in topic_meta.channels {
                if !ems_utils::names::is_valid_channel_name(&channel_meta.name) {
                    warn!(channel = %channel_meta.name, "skipping invalid channel in metadata");
                    continue;
                }
                let channel = topic.get_channel(&channel_meta.name)?;
                if channel_meta.paused {
                    channel.pause();
                }
            }
        }
        Ok(())
    }

    /// Write the current topology to `emsd.dat` (tmp + rename).
    pub fn persist_metadata(&self) -> Result<(), EngineError> {
        let mut topics: Vec<TopicMeta> = self
            .topics()
            .iter()
            .filter(|t| !t.is_ephemeral())
            .map(|t| {
                let mut channels: Vec<ChannelMeta> = t
                    .channels()
                    .iter()
                    .filter(|c| !c.is_ephemeral())
                    .map(|c| ChannelMeta {
                        name: c.name.clone(),
                        paused: c.is_paused(),
                    })
                    .collect();
                channels.sort_by(|a, b| a.name.cmp(&b.name));
                TopicMeta {
                    name: t.name.clone(),
                    paused: t.is_paused(),
                    channels,
                }
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));

        metadata::persist(&self.opts().queue.data_path, &Metadata { topics })?;
        Ok(())
    }

    // ---- lifecycle ----

    /// Release topic pumps after metadata replay and start the
    /// notification forwarder. Call once from `main`.
    pub fn start(self: &Arc<Self>) {
        if let Err(e) = self.persist_metadata() {
            error!(error = %e, "initial metadata persist failed");
        }
        for topic in self.topics() {
            topic.start();
        }

        let engine = Arc::clone(self);
        let mut raw_rx = self
            .notify_rx
            .lock()
            .take()
            .expect("notifier started once");
        tokio::spawn(async move {
            let mut shutdown = engine.shutdown_signal();
            loop {
                tokio::select! {
                    n = raw_rx.recv() => {
                        let Some(n) = n else { break };
                        // every topology change lands on disk before the
                        // lookup peers hear about it; once exit() has
                        // written the final snapshot, leave it alone
                        if !matches!(n, Notification::OptionsReload) && !engine.is_exiting() {
                            if let Err(e) = engine.persist_metadata() {
                                error!(error = %e, "metadata persist failed");
                            }
                        }
                        let _ = engine.forward_tx.send(n);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// Graceful shutdown: persist topology, stop every task, flush
    /// queues to disk.
    pub async fn exit(&self) {
        if self.is_exiting() {
            return;
        }
        info!("engine exiting");
        if let Err(e) = self.persist_metadata() {
            error!(error = %e, "final metadata persist failed");
        }
        let _ = self.shutdown_tx.send(true);

        let topics: Vec<Arc<Topic>> = {
            let mut map = self.topics.write();
            map.drain().map(|(_, t)| t).collect()
        };
        for topic in topics {
            if let Err(e) = topic.close().await {
                error!(topic = %topic.name, error = %e, "topic close failed");
            }
        }
        info!("engine exited");
    }

    // ---- health & stats ----

    pub fn is_healthy(&self) -> bool {
        self.ctx.is_healthy()
    }

    pub fn health(&self) -> String {
        self.ctx.health()
    }

    pub fn stats(&self) -> EngineStats {
        let mut topics: Vec<_> = self.topics().iter().map(|t| t.stats()).collect();
        topics.sort_by(|a, b| a.topic_name.cmp(&b.topic_name));
        EngineStats {
            version: env!("CARGO_PKG_VERSION").to_string(),
            health: self.health(),
            start_time: self.start_ts / 1_000_000_000,
            topics,
        }
    }
}
