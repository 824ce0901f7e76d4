//! A topic owns the inbound queue for its name and fans every message
//! out to all of its channels. Exactly one pump task runs per live
//! topic; it stays idle until `start()` fires so channels recreated
//! from metadata all see the backlog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use ems_persistence::{BackendQueue, DiskQueue, EphemeralQueue};

use crate::channel::Channel;
use crate::engine::{Context, Notification};
use crate::error::EngineError;
use crate::message::{IdFactory, Message, MessageId};
use crate::stats::TopicStats;

enum TopicCtrl {
    /// Channel map or a pause/start flag changed; re-evaluate gates.
    Update,
    Empty(oneshot::Sender<()>),
    Exit {
        persist: bool,
        ack: oneshot::Sender<()>,
    },
}

pub struct Topic {
    pub name: String,
    ephemeral: bool,

    ctx: Arc<Context>,

    mem_tx: mpsc::Sender<Message>,
    mem_depth: AtomicI64,
    mem_size: usize,
    backend: Arc<dyn BackendQueue>,
    ctrl_tx: mpsc::UnboundedSender<TopicCtrl>,

    channels: RwLock<HashMap<String, Arc<Channel>>>,
    id_factory: IdFactory,

    started: AtomicBool,
    paused: AtomicBool,
    exiting: AtomicBool,

    message_count: AtomicU64,
    message_bytes: AtomicU64,
}

impl Topic {
    pub fn new(ctx: Arc<Context>, name: String) -> Result<Arc<Self>, EngineError> {
        let opts = ctx.opts();
        let ephemeral = ems_utils::names::is_ephemeral(&name);
        let backend: Arc<dyn BackendQueue> = if ephemeral {
            Arc::new(EphemeralQueue::new())
        } else {
            Arc::new(DiskQueue::new(
                name.clone(),
                &opts.queue.data_path,
                crate::engine::queue_options(&opts),
            )?)
        };

        let mem_size = opts.queue.mem_queue_size;
        let (mem_tx, mem_rx) = mpsc::channel(mem_size.max(1));
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let backend_rx = backend
            .take_reader()
            .expect("freshly created backend always has its reader");

        let topic = Arc::new(Self {
            name,
            ephemeral,
            ctx,
            mem_tx,
            mem_depth: AtomicI64::new(0),
            mem_size,
            backend,
            ctrl_tx,
            channels: RwLock::new(HashMap::new()),
            id_factory: IdFactory::new(),
            started: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            message_count: AtomicU64::new(0),
            message_bytes: AtomicU64::new(0),
        });

        let pump = Arc::clone(&topic);
        tokio::spawn(async move {
            pump.message_pump(mem_rx, backend_rx, ctrl_rx).await;
        });

        info!(topic = %topic.name, "topic created");
        Ok(topic)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub fn generate_id(&self) -> MessageId {
        self.id_factory.next_id()
    }

    pub fn depth(&self) -> i64 {
        self.mem_depth.load(Ordering::Acquire) + self.backend.depth()
    }

    /// Release the pump; called once metadata replay has finished.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            let _ = self.ctrl_tx.send(TopicCtrl::Update);
        }
    }

    // ---- channels ----

    pub fn get_channel(&self, name: &str) -> Result<Arc<Channel>, EngineError> {
        if !ems_utils::names::is_valid_channel_name(name) {
            return Err(EngineError::InvalidName(name.to_string()));
        }
        if let Some(channel) = self.channels.read().get(name) {
            return Ok(Arc::clone(channel));
        }

        let created = {
            let mut channels = self.channels.write();
            if let Some(channel) = channels.get(name) {
                return Ok(Arc::clone(channel));
            }
            let channel = Channel::new(Arc::clone(&self.ctx), self.name.clone(), name.to_string())?;
            channels.insert(name.to_string(), Arc::clone(&channel));
            channel
        };

        self.ctx.notify(Notification::RegisterChannel {
            topic: self.name.clone(),
            channel: created.name.clone(),
        });
        let _ = self.ctrl_tx.send(TopicCtrl::Update);
        Ok(created)
    }

    pub fn get_existing_channel(&self, name: &str) -> Result<Arc<Channel>, EngineError> {
        self.channels
            .read()
            .get(name)
            .cloned()
            .ok_or(EngineError::ChannelNotFound)
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    pub async fn delete_existing_channel(&self, name: &str) -> Result<(), EngineError> {
        let channel = self
            .channels
            .write()
            .remove(name)
            .ok_or(EngineError::ChannelNotFound)?;
        let _ = self.ctrl_tx.send(TopicCtrl::Update);
        channel.delete().await
    }

    // ---- publishing ----

    pub async fn put_message(&self, m: Message) -> Result<(), EngineError> {
        if self.is_exiting() {
            return Err(EngineError::Exiting);
        }
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.message_bytes
            .fetch_add(m.body.len() as u64, Ordering::Relaxed);
        self.put(m).await;
        Ok(())
    }

    pub async fn put_messages(&self, msgs: Vec<Message>) -> Result<(), EngineError> {
        if self.is_exiting() {
            return Err(EngineError::Exiting);
        }
        for m in msgs {
            self.message_count.fetch_add(1, Ordering::Relaxed);
            self.message_bytes
                .fetch_add(m.body.len() as u64, Ordering::Relaxed);
            self.put(m).await;
        }
        Ok(())
    }

    async fn put(&self, m: Message) {
        if self.mem_size > 0 {
            match self.mem_tx.try_send(m) {
                Ok(()) => {
                    self.mem_depth.fetch_add(1, Ordering::AcqRel);
                    return;
                }
                Err(mpsc::error::TrySendError::Full(m))
                | Err(mpsc::error::TrySendError::Closed(m)) => {
                    self.put_backend(m).await;
                    return;
                }
            }
        }
        self.put_backend(m).await;
    }

    async fn put_backend(&self, m: Message) {
        match self.backend.put(m.encode()).await {
            Ok(()) => self.ctx.set_healthy(),
            Err(e) => {
                error!(topic = %self.name, error = %e, "backend put failed");
                self.ctx.set_unhealthy(&e);
            }
        }
    }

    // ---- pause / empty / shutdown ----

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        let _ = self.ctrl_tx.send(TopicCtrl::Update);
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::Release);
        let _ = self.ctrl_tx.send(TopicCtrl::Update);
    }

    pub async fn empty(&self) -> Result<(), EngineError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.ctrl_tx.send(TopicCtrl::Empty(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        self.mem_depth.store(0, Ordering::Release);
        self.backend.empty().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), EngineError> {
        self.exit(false).await
    }

    pub async fn delete(&self) -> Result<(), EngineError> {
        self.exit(true).await
    }

    async fn exit(&self, delete: bool) -> Result<(), EngineError> {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if delete {
            info!(topic = %self.name, "deleting topic");
            self.ctx
                .notify(Notification::UnregisterTopic(self.name.clone()));
        } else {
            info!(topic = %self.name, "closing topic");
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .ctrl_tx
            .send(TopicCtrl::Exit {
                persist: !delete,
                ack: ack_tx,
            })
            .is_ok()
        {
            let _ = ack_rx.await;
        }

        let channels: Vec<Arc<Channel>> = {
            let mut map = self.channels.write();
            map.drain().map(|(_, c)| c).collect()
        };
        for channel in channels {
            let res = if delete {
                channel.delete().await
            } else {
                channel.close().await
            };
            if let Err(e) = res {
                error!(topic = %self.name, channel = %channel.name, error = %e, "channel shutdown failed");
            }
        }

        if delete {
            self.backend.delete().await?;
        } else {
            self.backend.close().await?;
        }
        Ok(())
    }

    // ---- pump ----

    async fn message_pump(
        self: Arc<Self>,
        mut mem_rx: mpsc::Receiver<Message>,
        mut backend_rx: mpsc::Receiver<Vec<u8>>,
        mut ctrl_rx: mpsc::UnboundedReceiver<TopicCtrl>,
    ) {
        loop {
            let active = self.started.load(Ordering::Acquire)
                && !self.is_paused()
                && self.channel_count() > 0;
            tokio::select! {
                biased;

                ctrl = ctrl_rx.recv() => match ctrl {
                    Some(TopicCtrl::Update) => {}
                    Some(TopicCtrl::Empty(ack)) => {
                        while let Ok(m) = mem_rx.try_recv() {
                            self.mem_depth.fetch_sub(1, Ordering::AcqRel);
                            drop(m);
                        }
                        let _ = ack.send(());
                    }
                    Some(TopicCtrl::Exit { persist, ack }) => {
                        while let Ok(m) = mem_rx.try_recv() {
                            self.mem_depth.fetch_sub(1, Ordering::AcqRel);
                            if persist {
                                self.put_backend(m).await;
                            }
                        }
                        // a record may already sit in the read buffer,
                        // off the disk positions; put it back
                        while let Ok(data) = backend_rx.try_recv() {
                            if persist {
                                if let Err(e) = self.backend.put(data).await {
                                    error!(topic = %self.name, error = %e, "flush of buffered read failed");
                                }
                            }
                        }
                        let _ = ack.send(());
                        break;
                    }
                    None => break,
                },

                Some(m) = mem_rx.recv(), if active => {
                    self.mem_depth.fetch_sub(1, Ordering::AcqRel);
                    self.fanout(m).await;
                }

                Some(data) = backend_rx.recv(), if active => {
                    match Message::decode(&data) {
                        Ok(m) => self.fanout(m).await,
                        Err(e) => warn!(topic = %self.name, error = %e, "dropping undecodable backend record"),
                    }
                }
            }
        }
        debug!(topic = %self.name, "message pump exited");
    }

    /// One delivery per channel: the last gets the original, the rest
    /// deep copies.
    async fn fanout(&self, m: Message) {
        let channels = self.channels();
        if channels.is_empty() {
            // raced a channel deletion; keep the message
            self.put_backend(m).await;
            return;
        }

        let n = channels.len();
        let mut original = Some(m);
        for (i, channel) in channels.iter().enumerate() {
            let mut msg = if i == n - 1 {
                original.take().expect("consumed only on the last channel")
            } else {
                original.as_ref().expect("present until the last channel").clone()
            };

            let delay = msg.deferred_ns;
            if delay > 0 {
                msg.deferred_ns = 0;
                channel.put_message_deferred(msg, delay);
            } else if let Err(e) = channel.put_message(msg).await {
                warn!(
                    topic = %self.name, channel = %channel.name, error = %e,
                    "fan-out delivery failed"
                );
            }
        }
    }

    // ---- stats ----

    pub fn stats(&self) -> TopicStats {
        let mut channels: Vec<_> = self.channels().iter().map(|c| c.stats()).collect();
        channels.sort_by(|a, b| a.channel_name.cmp(&b.channel_name));
        TopicStats {
            topic_name: self.name.clone(),
            depth: self.depth(),
            backend_depth: self.backend.depth(),
            message_count: self.message_count.load(Ordering::Relaxed),
            message_bytes: self.message_bytes.load(Ordering::Relaxed),
            paused: self.is_paused(),
            channels,
        }
    }
}
