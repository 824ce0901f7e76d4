//! A channel is a consumer group on a topic: it owns a memory queue
//! with disk overflow, the in-flight and deferred redelivery stores,
//! and the registry of connected consumers. A dispatcher task drains
//! the queues and hands each message to one eligible client, respecting
//! RDY flow control.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

use ems_persistence::{BackendQueue, DiskQueue, EphemeralQueue};

use crate::client::{ClientConn, ClientId, OutFrame};
use crate::engine::Context;
use crate::error::EngineError;
use crate::message::{Message, MessageId};
use crate::pqueue::MessagePqueue;
use crate::quantile::LatencyStream;
use crate::stats::ChannelStats;

enum ChannelCtrl {
    /// Discard everything buffered in the memory queue.
    Empty(oneshot::Sender<()>),
    /// Stop the dispatcher; `persist` moves leftovers to the backend.
    Exit {
        persist: bool,
        ack: oneshot::Sender<()>,
    },
}

pub struct Channel {
    pub topic_name: String,
    pub name: String,
    ephemeral: bool,

    ctx: Arc<Context>,

    mem_tx: mpsc::Sender<Message>,
    mem_depth: AtomicI64,
    mem_size: usize,
    backend: Arc<dyn BackendQueue>,
    ctrl_tx: mpsc::UnboundedSender<ChannelCtrl>,

    in_flight: Mutex<MessagePqueue>,
    deferred: Mutex<MessagePqueue>,

    clients: RwLock<HashMap<ClientId, Arc<ClientConn>>>,
    next_client: AtomicUsize,

    paused: AtomicBool,
    exiting: AtomicBool,
    /// Set while `empty()` runs so an in-limbo delivery is discarded
    /// with the rest of the queue.
    draining: AtomicBool,
    deliver_wake: Notify,

    message_count: AtomicU64,
    requeue_count: AtomicU64,
    timeout_count: AtomicU64,
    latency: Mutex<LatencyStream>,
}

impl Channel {
    pub fn new(
        ctx: Arc<Context>,
        topic_name: String,
        name: String,
    ) -> Result<Arc<Self>, EngineError> {
        let opts = ctx.opts();
        let ephemeral = ems_utils::names::is_ephemeral(&name);
        let backend: Arc<dyn BackendQueue> = if ephemeral {
            Arc::new(EphemeralQueue::new())
        } else {
            Arc::new(DiskQueue::new(
                format!("{topic_name};{name}"),
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

        let channel = Arc::new(Self {
            topic_name,
            name,
            ephemeral,
            ctx,
            mem_tx,
            mem_depth: AtomicI64::new(0),
            mem_size,
            backend,
            ctrl_tx,
            in_flight: Mutex::new(MessagePqueue::new(64)),
            deferred: Mutex::new(MessagePqueue::new(64)),
            clients: RwLock::new(HashMap::new()),
            next_client: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            deliver_wake: Notify::new(),
            message_count: AtomicU64::new(0),
            requeue_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            latency: Mutex::new(LatencyStream::default()),
        });

        let dispatcher = Arc::clone(&channel);
        tokio::spawn(async move {
            dispatcher.dispatch_loop(mem_rx, backend_rx, ctrl_rx).await;
        });

        info!(topic = %channel.topic_name, channel = %channel.name, "channel created");
        Ok(channel)
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

    /// Messages waiting for delivery (memory + backend); in-flight and
    /// deferred are accounted separately.
    pub fn depth(&self) -> i64 {
        self.mem_depth.load(Ordering::Acquire) + self.backend.depth()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Wake the dispatcher: a client became eligible, a flag changed.
    pub fn wake(&self) {
        self.deliver_wake.notify_one();
    }

    // ---- queueing ----

    pub async fn put_message(&self, m: Message) -> Result<(), EngineError> {
        if self.is_exiting() {
            return Err(EngineError::Exiting);
        }
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.put(m).await;
        Ok(())
    }

    /// Schedule for delivery `delay_ns` from now.
    pub fn put_message_deferred(&self, mut m: Message, delay_ns: i64) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        m.priority = ems_utils::time::now_ns() + delay_ns;
        m.client_id = 0;
        self.deferred.lock().push(m);
    }

    /// Queue without counting: requeues and timeouts come back this way.
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
                error!(
                    topic = %self.topic_name, channel = %self.name, error = %e,
                    "backend put failed"
                );
                self.ctx.set_unhealthy(&e);
            }
        }
    }

    // ---- in-flight / deferred machinery ----

    pub fn start_in_flight_timeout(
        &self,
        mut m: Message,
        client_id: ClientId,
        timeout_ns: i64,
    ) -> Result<(), EngineError> {
        let now = ems_utils::time::now_ns();
        m.client_id = client_id;
        m.delivery_ts = now;
        m.priority = now + timeout_ns;

        let mut q = self.in_flight.lock();
        if q.contains(&m.id) {
            return Err(EngineError::AlreadyInFlight);
        }
        q.push(m);
        Ok(())
    }

    /// Acknowledge a delivery. Only the owning client may finish it.
    pub fn finish_message(&self, client_id: ClientId, id: MessageId) -> Result<(), EngineError> {
        let m = self.remove_in_flight(client_id, &id)?;
        self.latency
            .lock()
            .insert(ems_utils::time::now_ns() - m.timestamp);
        self.wake();
        Ok(())
    }

    /// Negative or zero `timeout_ns` requeues immediately; otherwise the
    /// message lands in the deferred store until `now + timeout_ns`.
    pub async fn requeue_message(
        &self,
        client_id: ClientId,
        id: MessageId,
        timeout_ns: i64,
    ) -> Result<(), EngineError> {
        let mut m = self.remove_in_flight(client_id, &id)?;
        self.requeue_count.fetch_add(1, Ordering::Relaxed);
        m.client_id = 0;
        m.delivery_ts = 0;

        if timeout_ns <= 0 {
            m.priority = 0;
            self.put(m).await;
            self.wake();
        } else {
            m.priority = ems_utils::time::now_ns() + timeout_ns;
            self.deferred.lock().push(m);
        }
        Ok(())
    }

    /// Push the in-flight deadline out by the client's timeout, capped
    /// at `timestamp + max_msg_timeout`.
    pub fn touch_message(
        &self,
        client_id: ClientId,
        id: MessageId,
        client_msg_timeout_ns: i64,
    ) -> Result<(), EngineError> {
        let max_ns = ems_utils::time::ms_to_ns(self.ctx.opts().client.max_msg_timeout_ms);
        let now = ems_utils::time::now_ns();

        let mut q = self.in_flight.lock();
        let m = q.get(&id).ok_or(EngineError::MessageNotInFlight)?;
        if m.client_id != client_id {
            return Err(EngineError::MessageNotInFlight);
        }
        let new_deadline = (now + client_msg_timeout_ns).min(m.timestamp + max_ns);
        q.update_priority(&id, new_deadline);
        Ok(())
    }

    fn remove_in_flight(
        &self,
        client_id: ClientId,
        id: &MessageId,
    ) -> Result<Message, EngineError> {
        let mut q = self.in_flight.lock();
        let owner = q.get(id).map(|m| m.client_id);
        match owner {
            Some(cid) if cid == client_id => {
                Ok(q.remove(id).expect("entry present under lock"))
            }
            _ => Err(EngineError::MessageNotInFlight),
        }
    }

    // ---- client registry ----

    pub fn add_client(&self, client: Arc<ClientConn>) -> Result<(), EngineError> {
        if self.is_exiting() {
            return Err(EngineError::Exiting);
        }
        let mut clients = self.clients.write();
        if clients.contains_key(&client.id) {
            return Ok(());
        }
        let cap = self.ctx.opts().client.max_channel_consumers;
        if cap > 0 && clients.len() >= cap {
            return Err(EngineError::TooManyConsumers);
        }
        clients.insert(client.id, client);
        drop(clients);
        self.wake();
        Ok(())
    }

    pub fn remove_client(&self, client_id: ClientId) {
        self.clients.write().remove(&client_id);
        self.wake();
    }

    // ---- pause / empty / shutdown ----

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        self.wake();
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::Release);
        self.wake();
    }

    /// Drop everything: memory queue, backend, in-flight and deferred
    /// stores; per-client in-flight accounting resets too.
    pub async fn empty(&self) -> Result<(), EngineError> {
        self.draining.store(true, Ordering::Release);
        self.wake();

        self.in_flight.lock().drain();
        self.deferred.lock().drain();
        for client in self.clients.read().values() {
            client.empty_in_flight();
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.ctrl_tx.send(ChannelCtrl::Empty(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        self.mem_depth.store(0, Ordering::Release);
        self.draining.store(false, Ordering::Release);

        self.backend.empty().await?;
        Ok(())
    }

    /// Graceful close: queued, in-flight and deferred messages are
    /// written back to the backend so no work is lost.
    pub async fn close(&self) -> Result<(), EngineError> {
        self.exit(false).await
    }

    /// Tear down and remove all state, including the backend's files.
    pub async fn delete(&self) -> Result<(), EngineError> {
        self.exit(true).await
    }

    async fn exit(&self, delete: bool) -> Result<(), EngineError> {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if delete {
            info!(topic = %self.topic_name, channel = %self.name, "deleting channel");
            self.ctx.notify(crate::engine::Notification::UnregisterChannel {
                topic: self.topic_name.clone(),
                channel: self.name.clone(),
            });
        } else {
            info!(topic = %self.topic_name, channel = %self.name, "closing channel");
        }
        self.wake();

        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .ctrl_tx
            .send(ChannelCtrl::Exit {
                persist: !delete,
                ack: ack_tx,
            })
            .is_ok()
        {
            let _ = ack_rx.await;
        }

        let pending: Vec<Message> = {
            let mut out = self.in_flight.lock().drain();
            out.extend(self.deferred.lock().drain());
            out
        };

        if delete {
            self.backend.delete().await?;
        } else {
            for m in pending {
                self.put_backend(m).await;
            }
            self.backend.close().await?;
        }
        Ok(())
    }

    // ---- dispatcher ----

    async fn dispatch_loop(
        self: Arc<Self>,
        mut mem_rx: mpsc::Receiver<Message>,
        mut backend_rx: mpsc::Receiver<Vec<u8>>,
        mut ctrl_rx: mpsc::UnboundedReceiver<ChannelCtrl>,
    ) {
        loop {
            let active = !self.is_paused() && self.has_eligible_client();
            tokio::select! {
                biased;

                ctrl = ctrl_rx.recv() => match ctrl {
                    Some(ChannelCtrl::Empty(ack)) => {
                        while let Ok(m) = mem_rx.try_recv() {
                            self.mem_depth.fetch_sub(1, Ordering::AcqRel);
                            drop(m);
                        }
                        let _ = ack.send(());
                    }
                    Some(ChannelCtrl::Exit { persist, ack }) => {
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
                                    error!(
                                        topic = %self.topic_name, channel = %self.name, error = %e,
                                        "flush of buffered read failed"
                                    );
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
                    self.deliver(m).await;
                }

                Some(data) = backend_rx.recv(), if active => {
                    match Message::decode(&data) {
                        Ok(m) => self.deliver(m).await,
                        Err(e) => warn!(
                            topic = %self.topic_name, channel = %self.name, error = %e,
                            "dropping undecodable backend record"
                        ),
                    }
                }

                _ = self.deliver_wake.notified(), if !active => {}
            }
        }
        debug!(topic = %self.topic_name, channel = %self.name, "dispatcher exited");
    }

    fn has_eligible_client(&self) -> bool {
        self.clients
            .read()
            .values()
            .any(|c| c.is_ready_for_message())
    }

    fn choose_client(&self) -> Option<Arc<ClientConn>> {
        let clients = self.clients.read();
        let n = clients.len();
        if n == 0 {
            return None;
        }
        let all: Vec<&Arc<ClientConn>> = clients.values().collect();
        let start = self.next_client.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let c = all[(start + i) % n];
            if c.is_ready_for_message() {
                return Some(Arc::clone(c));
            }
        }
        None
    }

    /// Hand one message to one client. Blocks until a client is
    /// eligible; bails to the backend if the channel starts exiting and
    /// to the floor if it is being emptied.
    async fn deliver(&self, mut m: Message) {
        loop {
            if self.is_exiting() {
                self.put_backend(m).await;
                return;
            }
            if self.draining.load(Ordering::Acquire) {
                return;
            }
            if self.is_paused() {
                self.deliver_wake.notified().await;
                continue;
            }
            let Some(client) = self.choose_client() else {
                self.deliver_wake.notified().await;
                continue;
            };

            // negotiated sampling: this client sees only N% of traffic
            let rate = client.sample_rate();
            if rate > 0 && (rand::random::<u32>() % 100) as i32 >= rate {
                return;
            }

            m.attempts = m.attempts.saturating_add(1);
            let payload = m.encode();
            let id = m.id;
            let timeout = client.msg_timeout_ns();
            if let Err(e) = self.start_in_flight_timeout(m, client.id, timeout) {
                warn!(
                    topic = %self.topic_name, channel = %self.name, error = %e,
                    "delivery raced an in-flight duplicate, dropping"
                );
                return;
            }
            client.sending_message();
            if client.send(OutFrame::Message(payload)).is_err() {
                client.send_failed();
                match self.in_flight.lock().remove(&id) {
                    Some(back) => {
                        m = back;
                        continue;
                    }
                    None => return,
                }
            }
            return;
        }
    }

    // ---- scanner hooks ----

    /// Requeue every in-flight message whose deadline has passed.
    pub async fn process_in_flight_queue(&self, now: i64) -> bool {
        let mut dirty = false;
        loop {
            let msg = { self.in_flight.lock().peek_and_shift(now).0 };
            let Some(mut m) = msg else { break };
            dirty = true;
            self.timeout_count.fetch_add(1, Ordering::Relaxed);
            if let Some(client) = self.clients.read().get(&m.client_id).cloned() {
                client.timed_out_message();
            }
            m.client_id = 0;
            m.delivery_ts = 0;
            self.put(m).await;
            self.wake();
        }
        dirty
    }

    /// Move every due deferred message back onto the delivery queue.
    pub async fn process_deferred_queue(&self, now: i64) -> bool {
        let mut dirty = false;
        loop {
            let msg = { self.deferred.lock().peek_and_shift(now).0 };
            let Some(m) = msg else { break };
            dirty = true;
            self.put(m).await;
            self.wake();
        }
        dirty
    }

    // ---- stats ----

    pub fn stats(&self) -> ChannelStats {
        let clients: Vec<_> = self.clients.read().values().map(|c| c.stats()).collect();
        let latency = self.latency.lock();
        ChannelStats {
            channel_name: self.name.clone(),
            depth: self.depth(),
            backend_depth: self.backend.depth(),
            in_flight_count: self.in_flight_count(),
            deferred_count: self.deferred_count(),
            message_count: self.message_count.load(Ordering::Relaxed),
            requeue_count: self.requeue_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            client_count: clients.len(),
            paused: self.is_paused(),
            e2e_processing_latency: latency.result(),
            clients,
        }
    }
}
