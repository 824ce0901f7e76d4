//! Server-side state for one connected consumer/producer.
//!
//! The transport layer creates a `ClientConn` per accepted connection
//! and keeps the receiving half of the outbound frame queue for its
//! write loop; channels hold `Arc<ClientConn>` handles and feed that
//! queue when dispatching messages.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::stats::ClientStats;

pub type ClientId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ClientState {
    Init = 0,
    Subscribed = 1,
    Closing = 2,
}

/// Frames queued for a client's write loop. Payloads arrive
/// pre-encoded; the write loop adds the `size || type` envelope.
#[derive(Debug)]
pub enum OutFrame {
    Response(Vec<u8>),
    Error(Vec<u8>),
    Message(Vec<u8>),
    /// Negotiated parameters changed; the write loop re-reads them.
    IdentityUpdated,
}

/// Negotiated (IDENTIFY) parameters plus connection facts, read by the
/// write loop and the stats snapshot.
#[derive(Debug, Clone)]
pub struct Identity {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub heartbeat_interval_ms: u64,
    pub output_buffer_size: usize,
    pub output_buffer_timeout_ms: u64,
}

pub struct ClientConn {
    pub id: ClientId,
    pub remote_addr: SocketAddr,
    pub connect_ts: i64,

    out_tx: mpsc::UnboundedSender<OutFrame>,

    state: AtomicI32,
    ready_count: AtomicI64,
    in_flight_count: AtomicI64,
    message_count: AtomicU64,
    finish_count: AtomicU64,
    requeue_count: AtomicU64,

    /// Per-delivery in-flight timeout, ns.
    msg_timeout_ns: AtomicI64,
    /// Deliver only this percentage of eligible messages; 0 disables.
    sample_rate: AtomicI32,

    identity: Mutex<Identity>,
}

impl ClientConn {
    pub fn new(
        id: ClientId,
        remote_addr: SocketAddr,
        out_tx: mpsc::UnboundedSender<OutFrame>,
        default_msg_timeout_ns: i64,
        default_heartbeat_interval_ms: u64,
        default_output_buffer_size: usize,
        default_output_buffer_timeout_ms: u64,
    ) -> Self {
        Self {
            id,
            remote_addr,
            connect_ts: ems_utils::time::now_ns(),
            out_tx,
            state: AtomicI32::new(ClientState::Init as i32),
            ready_count: AtomicI64::new(0),
            in_flight_count: AtomicI64::new(0),
            message_count: AtomicU64::new(0),
            finish_count: AtomicU64::new(0),
            requeue_count: AtomicU64::new(0),
            msg_timeout_ns: AtomicI64::new(default_msg_timeout_ns),
            sample_rate: AtomicI32::new(0),
            identity: Mutex::new(Identity {
                client_id: String::new(),
                hostname: String::new(),
                user_agent: String::new(),
                heartbeat_interval_ms: default_heartbeat_interval_ms,
                output_buffer_size: default_output_buffer_size,
                output_buffer_timeout_ms: default_output_buffer_timeout_ms,
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        match self.state.load(Ordering::Acquire) {
            1 => ClientState::Subscribed,
            2 => ClientState::Closing,
            _ => ClientState::Init,
        }
    }

    pub fn set_state(&self, state: ClientState) {
        self.state.store(state as i32, Ordering::Release);
    }

    /// Flow control: eligible while subscribed, not closing, and under
    /// its advertised RDY.
    pub fn is_ready_for_message(&self) -> bool {
        if self.state() != ClientState::Subscribed {
            return false;
        }
        let ready = self.ready_count.load(Ordering::Acquire);
        ready > 0 && self.in_flight_count.load(Ordering::Acquire) < ready
    }

    pub fn set_ready_count(&self, count: i64) {
        self.ready_count.store(count, Ordering::Release);
    }

    pub fn ready_count(&self) -> i64 {
        self.ready_count.load(Ordering::Acquire)
    }

    pub fn in_flight_count(&self) -> i64 {
        self.in_flight_count.load(Ordering::Acquire)
    }

    pub fn msg_timeout_ns(&self) -> i64 {
        self.msg_timeout_ns.load(Ordering::Acquire)
    }

    pub fn set_msg_timeout_ns(&self, ns: i64) {
        self.msg_timeout_ns.store(ns, Ordering::Release);
    }

    pub fn sample_rate(&self) -> i32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub fn set_sample_rate(&self, rate: i32) {
        self.sample_rate.store(rate, Ordering::Release);
    }

    pub fn identity(&self) -> Identity {
        self.identity.lock().clone()
    }

    pub fn update_identity<F: FnOnce(&mut Identity)>(&self, f: F) {
        f(&mut self.identity.lock());
        let _ = self.out_tx.send(OutFrame::IdentityUpdated);
    }

    pub fn send(&self, frame: OutFrame) -> Result<(), EngineSendError> {
        self.out_tx.send(frame).map_err(|_| EngineSendError)
    }

    // delivery accounting, called by the channel dispatcher and the
    // FIN/REQ/timeout paths

    pub fn sending_message(&self) {
        self.in_flight_count.fetch_add(1, Ordering::AcqRel);
        self.message_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finished_message(&self) {
        self.finish_count.fetch_add(1, Ordering::Relaxed);
        self.in_flight_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn requeued_message(&self) {
        self.requeue_count.fetch_add(1, Ordering::Relaxed);
        self.in_flight_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn timed_out_message(&self) {
        self.in_flight_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Undo `sending_message` after a failed enqueue to the write loop.
    pub fn send_failed(&self) {
        self.in_flight_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// `Channel::empty` zeroes per-client in-flight accounting.
    pub fn empty_in_flight(&self) {
        self.in_flight_count.store(0, Ordering::Release);
    }

    pub fn stats(&self) -> ClientStats {
        let identity = self.identity();
        ClientStats {
            client_id: identity.client_id,
            hostname: identity.hostname,
            user_agent: identity.user_agent,
            remote_address: self.remote_addr.to_string(),
            state: self.state() as i32,
            ready_count: self.ready_count.load(Ordering::Relaxed),
            in_flight_count: self.in_flight_count.load(Ordering::Relaxed),
            message_count: self.message_count.load(Ordering::Relaxed),
            finish_count: self.finish_count.load(Ordering::Relaxed),
            requeue_count: self.requeue_count.load(Ordering::Relaxed),
            connect_ts: self.connect_ts / 1_000_000_000,
        }
    }
}

/// The connection's write loop is gone; the client is being torn down.
#[derive(Debug)]
pub struct EngineSendError;

impl std::fmt::Display for EngineSendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("client write loop closed")
    }
}

impl std::error::Error for EngineSendError {}
