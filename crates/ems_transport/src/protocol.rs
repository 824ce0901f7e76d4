//! V2 protocol state machine.
//!
//! Each accepted connection gets two tasks: a read loop parsing command
//! lines and driving the engine, and a write loop that owns the socket's
//! send side, buffering message frames and emitting heartbeats. All
//! frames to a client funnel through its outbound queue, so writes never
//! interleave.
//!
//! Connection states: Init → (SUB) → Subscribed → (CLS) → Closing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use ems_broker::{
    Channel, ClientConn, ClientState, Engine, Message, MessageId, OutFrame, MSG_ID_LENGTH,
};

use crate::auth::{self, AuthState};
use crate::error::ProtocolError;
use crate::frame::{
    append_frame, read_body, read_command_line, CLOSE_WAIT, FRAME_TYPE_ERROR, FRAME_TYPE_MESSAGE,
    FRAME_TYPE_RESPONSE, HEARTBEAT, MAGIC_V2, OK,
};
use crate::message::{AuthReply, IdentifyBody, IdentifyResponse};

/// Default write buffer for message frames, before IDENTIFY overrides.
const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 16 * 1024;

pub async fn handle_connection(engine: Arc<Engine>, stream: TcpStream, addr: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut magic = [0u8; 4];
    match timeout(Duration::from_secs(5), reader.read_exact(&mut magic)).await {
        Ok(Ok(_)) if &magic == MAGIC_V2 => {}
        Ok(Ok(_)) => {
            info!(%addr, "bad protocol magic, closing");
            return;
        }
        _ => {
            debug!(%addr, "no protocol magic before deadline");
            return;
        }
    }

    let opts = engine.opts();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let client = Arc::new(ClientConn::new(
        engine.ctx.next_client_id(),
        addr,
        out_tx,
        ems_utils::time::ms_to_ns(opts.client.msg_timeout_ms),
        opts.client.max_heartbeat_interval_ms / 2,
        DEFAULT_OUTPUT_BUFFER_SIZE.min(opts.client.max_output_buffer_size),
        opts.client.output_buffer_timeout_ms,
    ));
    info!(%addr, client = client.id, "client connected");

    let (close_tx, close_rx) = watch::channel(false);
    let writer_task = tokio::spawn(write_loop(
        write_half,
        out_rx,
        Arc::clone(&client),
        engine.shutdown_signal(),
        close_rx,
    ));

    let mut conn = Conn {
        engine: Arc::clone(&engine),
        client: Arc::clone(&client),
        channel: None,
        auth: None,
    };

    if let Err(e) = conn.read_loop(&mut reader).await {
        debug!(%addr, client = client.id, error = %e, "connection ended with error");
    }

    client.set_state(ClientState::Closing);
    client.set_ready_count(0);
    if let Some(channel) = conn.channel.take() {
        channel.remove_client(client.id);
        reap_ephemeral(&engine, &channel).await;
    }

    let _ = close_tx.send(true);
    let _ = writer_task.await;
    info!(%addr, client = client.id, "client disconnected");
}

/// An `#ephemeral` channel dies with its last consumer; an `#ephemeral`
/// topic dies with its last channel.
async fn reap_ephemeral(engine: &Arc<Engine>, channel: &Arc<Channel>) {
    if !channel.is_ephemeral() || channel.client_count() > 0 {
        return;
    }
    let Ok(topic) = engine.get_existing_topic(&channel.topic_name) else {
        return;
    };
    if let Err(e) = topic.delete_existing_channel(&channel.name).await {
        debug!(channel = %channel.name, error = %e, "ephemeral channel reap");
    }
    if topic.is_ephemeral() && topic.channel_count() == 0 {
        if let Err(e) = engine.delete_existing_topic(&topic.name).await {
            debug!(topic = %topic.name, error = %e, "ephemeral topic reap");
        }
    }
}

struct Conn {
    engine: Arc<Engine>,
    client: Arc<ClientConn>,
    channel: Option<Arc<Channel>>,
    auth: Option<AuthState>,
}

impl Conn {
    async fn read_loop(
        &mut self,
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<(), ProtocolError> {
        let mut shutdown = self.engine.shutdown_signal();
        loop {
            // missing two heartbeats in a row closes the connection
            let hb_ms = self.client.identity().heartbeat_interval_ms;
            let deadline = if hb_ms == 0 {
                Duration::from_secs(3600)
            } else {
                Duration::from_millis(hb_ms * 2)
            };

            let line = tokio::select! {
                res = timeout(deadline, read_command_line(reader)) => match res {
                    Ok(Ok(Some(line))) => line,
                    Ok(Ok(None)) => return Ok(()),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        return Err(ProtocolError::fatal(
                            "E_INVALID",
                            "no activity within heartbeat deadline",
                        ))
                    }
                },
                _ = shutdown.changed() => return Ok(()),
            };
            if line.is_empty() {
                continue;
            }

            let params: Vec<&[u8]> = line.split(|&b| b == b' ').collect();
            match self.exec(reader, &params).await {
                Ok(Some(payload)) => {
                    let _ = self.client.send(OutFrame::Response(payload));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(client = self.client.id, error = %e, "command failed");
                    let _ = self.client.send(OutFrame::Error(e.wire()));
                    if e.is_fatal() {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn exec(
        &mut self,
        reader: &mut BufReader<OwnedReadHalf>,
        params: &[&[u8]],
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        match params[0] {
            b"IDENTIFY" => self.identify(reader).await,
            b"AUTH" => self.authenticate(reader).await,
            b"SUB" => self.sub(params).await,
            b"RDY" => self.rdy(params),
            b"FIN" => self.fin(params),
            b"REQ" => self.req(params).await,
            b"TOUCH" => self.touch(params),
            b"CLS" => self.cls(),
            b"NOP" => Ok(None),
            b"PUB" => self.publish(reader, params).await,
            b"MPUB" => self.mpublish(reader, params).await,
            b"DPUB" => self.dpublish(reader, params).await,
            other => Err(ProtocolError::fatal(
                "E_INVALID",
                format!("unknown command {:?}", String::from_utf8_lossy(other)),
            )),
        }
    }

    // ---- negotiation ----

    async fn identify(
        &mut self,
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.client.state() != ClientState::Init {
            return Err(ProtocolError::fatal(
                "E_INVALID",
                "cannot IDENTIFY in current state",
            ));
        }
        let opts = self.engine.opts();
        let body = read_body(reader, opts.queue.max_body_size).await?;
        let ident: IdentifyBody = serde_json::from_slice(&body)
            .map_err(|e| ProtocolError::fatal("E_BAD_BODY", e.to_string()))?;

        if ident.tls_v1 || ident.snappy || ident.deflate {
            return Err(ProtocolError::client(
                "E_INVALID",
                "transport upgrades are not enabled on this node",
            ));
        }

        let heartbeat_interval_ms = match ident.heartbeat_interval {
            None | Some(0) => opts.client.max_heartbeat_interval_ms / 2,
            Some(-1) => 0,
            Some(v) if v >= 1000 && v as u64 <= opts.client.max_heartbeat_interval_ms => v as u64,
            Some(v) => {
                return Err(ProtocolError::fatal(
                    "E_BAD_BODY",
                    format!("heartbeat_interval {v} out of range"),
                ))
            }
        };

        let output_buffer_size = match ident.output_buffer_size {
            None | Some(0) => DEFAULT_OUTPUT_BUFFER_SIZE.min(opts.client.max_output_buffer_size),
            Some(-1) => 1,
            Some(v) if v >= 64 && v as usize <= opts.client.max_output_buffer_size => v as usize,
            Some(v) => {
                return Err(ProtocolError::fatal(
                    "E_BAD_BODY",
                    format!("output_buffer_size {v} out of range"),
                ))
            }
        };

        let output_buffer_timeout_ms = match ident.output_buffer_timeout {
            None | Some(0) => opts.client.output_buffer_timeout_ms,
            Some(v) if v >= 1 && v as u64 <= opts.client.max_output_buffer_timeout_ms => v as u64,
            Some(v) => {
                return Err(ProtocolError::fatal(
                    "E_BAD_BODY",
                    format!("output_buffer_timeout {v} out of range"),
                ))
            }
        };

        if let Some(rate) = ident.sample_rate {
            if !(0..=99).contains(&rate) {
                return Err(ProtocolError::fatal(
                    "E_BAD_BODY",
                    format!("sample_rate {rate} out of range"),
                ));
            }
            self.client.set_sample_rate(rate);
        }

        if let Some(ms) = ident.msg_timeout {
            if ms >= 1000 && ms as u64 <= opts.client.max_msg_timeout_ms {
                self.client.set_msg_timeout_ns(ems_utils::time::ms_to_ns(ms as u64));
            } else {
                return Err(ProtocolError::fatal(
                    "E_BAD_BODY",
                    format!("msg_timeout {ms} out of range"),
                ));
            }
        }

        let feature_negotiation = ident.feature_negotiation;
        self.client.update_identity(|id| {
            id.client_id = ident.client_id.clone();
            id.hostname = ident.hostname.clone();
            id.user_agent = ident.user_agent.clone();
            id.heartbeat_interval_ms = heartbeat_interval_ms;
            id.output_buffer_size = output_buffer_size;
            id.output_buffer_timeout_ms = output_buffer_timeout_ms;
        });

        if !feature_negotiation {
            return Ok(Some(OK.to_vec()));
        }

        let resp = IdentifyResponse {
            max_rdy_count: opts.client.max_rdy_count,
            version: env!("CARGO_PKG_VERSION"),
            max_msg_timeout: opts.client.max_msg_timeout_ms as i64,
            msg_timeout: ems_utils::time::ns_to_ms(self.client.msg_timeout_ns()),
            tls_v1: false,
            deflate: false,
            deflate_level: 0,
            max_deflate_level: 0,
            snappy: false,
            sample_rate: self.client.sample_rate(),
            auth_required: !opts.auth.auth_http_addresses.is_empty(),
            output_buffer_size: output_buffer_size as i64,
            output_buffer_timeout: output_buffer_timeout_ms as i64,
        };
        let payload = serde_json::to_vec(&resp)
            .map_err(|e| ProtocolError::fatal("E_INVALID", e.to_string()))?;
        Ok(Some(payload))
    }

    async fn authenticate(
        &mut self,
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.client.state() != ClientState::Init {
            return Err(ProtocolError::fatal(
                "E_INVALID",
                "cannot AUTH in current state",
            ));
        }
        if self.auth.is_some() {
            return Err(ProtocolError::fatal("E_INVALID", "AUTH already set"));
        }
        let opts = self.engine.opts();
        if opts.auth.auth_http_addresses.is_empty() {
            return Err(ProtocolError::fatal(
                "E_AUTH_DISABLED",
                "AUTH not enabled on this node",
            ));
        }

        let body = read_body(reader, opts.queue.max_body_size).await?;
        let secret = String::from_utf8(body)
            .map_err(|_| ProtocolError::fatal("E_AUTH_FAILED", "secret is not utf-8"))?;

        let state = auth::query_auth_peers(
            &opts.auth.auth_http_addresses,
            Duration::from_millis(opts.auth.http_request_timeout_ms),
            &self.client.remote_addr.ip().to_string(),
            &secret,
        )
        .await?;

        let reply = AuthReply {
            identity: state.response.identity.clone(),
            identity_url: state.response.identity_url.clone(),
            permission_count: state.response.authorizations.len(),
        };
        self.auth = Some(state);
        let payload = serde_json::to_vec(&reply)
            .map_err(|e| ProtocolError::fatal("E_INVALID", e.to_string()))?;
        Ok(Some(payload))
    }

    fn check_auth(
        &self,
        permission: &str,
        topic: &str,
        channel: &str,
    ) -> Result<(), ProtocolError> {
        let opts = self.engine.opts();
        if opts.auth.auth_http_addresses.is_empty() {
            return Ok(());
        }
        let Some(state) = &self.auth else {
            return Err(ProtocolError::fatal("E_AUTH_FIRST", "AUTH required"));
        };
        if state.is_expired() {
            return Err(ProtocolError::fatal("E_AUTH_FAILED", "authorization expired"));
        }
        if !state.is_allowed(topic, channel, permission) {
            return Err(ProtocolError::fatal(
                "E_UNAUTHORIZED",
                format!("not authorized to {permission} {topic}/{channel}"),
            ));
        }
        Ok(())
    }

    // ---- subscription & flow control ----

    async fn sub(&mut self, params: &[&[u8]]) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.client.state() != ClientState::Init {
            return Err(ProtocolError::fatal(
                "E_INVALID",
                "cannot SUB in current state",
            ));
        }
        if params.len() != 3 {
            return Err(ProtocolError::fatal(
                "E_INVALID",
                "SUB requires a topic and a channel",
            ));
        }
        let topic_name = param_str(params[1])?;
        let channel_name = param_str(params[2])?;
        if !ems_utils::names::is_valid_topic_name(topic_name) {
            return Err(ProtocolError::client(
                "E_BAD_TOPIC",
                format!("SUB topic name {topic_name:?} is not valid"),
            ));
        }
        if !ems_utils::names::is_valid_channel_name(channel_name) {
            return Err(ProtocolError::client(
                "E_BAD_CHANNEL",
                format!("SUB channel name {channel_name:?} is not valid"),
            ));
        }
        self.check_auth("subscribe", topic_name, channel_name)?;

        // an ephemeral topic/channel may be mid-teardown; retry once
        let mut attempts = 0;
        let channel = loop {
            attempts += 1;
            let topic = self
                .engine
                .get_topic(topic_name)
                .map_err(|e| ProtocolError::client("E_SUB_FAILED", e.to_string()))?;
            let channel = topic
                .get_channel(channel_name)
                .map_err(|e| ProtocolError::client("E_SUB_FAILED", e.to_string()))?;
            match channel.add_client(Arc::clone(&self.client)) {
                Ok(()) => break channel,
                Err(e) if attempts < 2 => {
                    debug!(error = %e, "SUB raced a teardown, retrying");
                    continue;
                }
                Err(e) => {
                    return Err(ProtocolError::client("E_SUB_FAILED", e.to_string()));
                }
            }
        };

        self.client.set_state(ClientState::Subscribed);
        channel.wake();
        self.channel = Some(channel);
        Ok(Some(OK.to_vec()))
    }

    fn rdy(&mut self, params: &[&[u8]]) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self.client.state() {
            ClientState::Closing => {
                // harmless late RDY from a closing consumer
                debug!(client = self.client.id, "RDY ignored in closing state");
                return Ok(None);
            }
            ClientState::Subscribed => {}
            ClientState::Init => {
                return Err(ProtocolError::fatal(
                    "E_INVALID",
                    "cannot RDY in current state",
                ))
            }
        }
        if params.len() != 2 {
            return Err(ProtocolError::fatal("E_INVALID", "RDY requires a count"));
        }
        let count: i64 = param_str(params[1])?
            .parse()
            .map_err(|_| ProtocolError::fatal("E_INVALID", "RDY count is not a number"))?;
        let max = self.engine.opts().client.max_rdy_count;
        if !(0..=max).contains(&count) {
            return Err(ProtocolError::fatal(
                "E_INVALID",
                format!("RDY count {count} out of range 0..={max}"),
            ));
        }
        self.client.set_ready_count(count);
        if let Some(channel) = &self.channel {
            channel.wake();
        }
        Ok(None)
    }

    fn fin(&mut self, params: &[&[u8]]) -> Result<Option<Vec<u8>>, ProtocolError> {
        let (channel, id) = self.subscribed_op(params)?;
        channel
            .finish_message(self.client.id, id)
            .map_err(|e| ProtocolError::client("E_FIN_FAILED", e.to_string()))?;
        self.client.finished_message();
        channel.wake();
        Ok(None)
    }

    async fn req(&mut self, params: &[&[u8]]) -> Result<Option<Vec<u8>>, ProtocolError> {
        if params.len() != 3 {
            return Err(ProtocolError::fatal(
                "E_INVALID",
                "REQ requires an id and a timeout",
            ));
        }
        let (channel, id) = self.subscribed_op(&params[..2])?;
        let timeout_ms: i64 = param_str(params[2])?
            .parse()
            .map_err(|_| ProtocolError::fatal("E_INVALID", "REQ timeout is not a number"))?;
        let max = self.engine.opts().client.max_req_timeout_ms as i64;
        if !(0..=max).contains(&timeout_ms) {
            return Err(ProtocolError::fatal(
                "E_INVALID",
                format!("REQ timeout {timeout_ms} out of range 0..={max}"),
            ));
        }
        channel
            .requeue_message(self.client.id, id, ems_utils::time::ms_to_ns(timeout_ms as u64))
            .await
            .map_err(|e| ProtocolError::client("E_REQ_FAILED", e.to_string()))?;
        self.client.requeued_message();
        channel.wake();
        Ok(None)
    }

    fn touch(&mut self, params: &[&[u8]]) -> Result<Option<Vec<u8>>, ProtocolError> {
        let (channel, id) = self.subscribed_op(params)?;
        channel
            .touch_message(self.client.id, id, self.client.msg_timeout_ns())
            .map_err(|e| ProtocolError::client("E_TOUCH_FAILED", e.to_string()))?;
        Ok(None)
    }

    fn cls(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.client.state() != ClientState::Subscribed {
            return Err(ProtocolError::fatal(
                "E_INVALID",
                "cannot CLS in current state",
            ));
        }
        self.client.set_state(ClientState::Closing);
        self.client.set_ready_count(0);
        Ok(Some(CLOSE_WAIT.to_vec()))
    }

    /// Common validation for FIN/REQ/TOUCH: a subscription and a
    /// well-formed message id.
    fn subscribed_op(
        &self,
        params: &[&[u8]],
    ) -> Result<(Arc<Channel>, MessageId), ProtocolError> {
        match self.client.state() {
            ClientState::Subscribed | ClientState::Closing => {}
            ClientState::Init => {
                return Err(ProtocolError::fatal(
                    "E_INVALID",
                    "cannot use message commands in current state",
                ))
            }
        }
        if params.len() != 2 || params[1].len() != MSG_ID_LENGTH {
            return Err(ProtocolError::fatal("E_INVALID", "invalid message id"));
        }
        let id = MessageId::from_slice(params[1])
            .map_err(|e| ProtocolError::fatal("E_INVALID", e.to_string()))?;
        let channel = self
            .channel
            .clone()
            .ok_or_else(|| ProtocolError::fatal("E_INVALID", "not subscribed"))?;
        Ok((channel, id))
    }

    // ---- publishing ----

    async fn publish(
        &mut self,
        reader: &mut BufReader<OwnedReadHalf>,
        params: &[&[u8]],
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if params.len() != 2 {
            return Err(ProtocolError::fatal("E_INVALID", "PUB requires a topic"));
        }
        let topic_name = param_str(params[1])?;
        if !ems_utils::names::is_valid_topic_name(topic_name) {
            return Err(ProtocolError::client(
                "E_BAD_TOPIC",
                format!("PUB topic name {topic_name:?} is not valid"),
            ));
        }
        let opts = self.engine.opts();
        let body = read_body(reader, opts.queue.max_body_size).await?;
        if body.len() as u32 > opts.queue.max_msg_size {
            return Err(ProtocolError::client(
                "E_BAD_MESSAGE",
                format!("message too big: {} > {}", body.len(), opts.queue.max_msg_size),
            ));
        }
        self.check_auth("publish", topic_name, "")?;

        let topic = self
            .engine
            .get_topic(topic_name)
            .map_err(|e| ProtocolError::client("E_PUB_FAILED", e.to_string()))?;
        let m = Message::new(topic.generate_id(), body);
        topic
            .put_message(m)
            .await
            .map_err(|e| ProtocolError::client("E_PUB_FAILED", e.to_string()))?;
        Ok(Some(OK.to_vec()))
    }

    async fn mpublish(
        &mut self,
        reader: &mut BufReader<OwnedReadHalf>,
        params: &[&[u8]],
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if params.len() != 2 {
            return Err(ProtocolError::fatal("E_INVALID", "MPUB requires a topic"));
        }
        let topic_name = param_str(params[1])?;
        if !ems_utils::names::is_valid_topic_name(topic_name) {
            return Err(ProtocolError::client(
                "E_BAD_TOPIC",
                format!("MPUB topic name {topic_name:?} is not valid"),
            ));
        }
        let opts = self.engine.opts();
        let body = read_body(reader, opts.queue.max_body_size).await?;
        let bodies = parse_mpub_body(&body, opts.queue.max_msg_size)?;
        self.check_auth("publish", topic_name, "")?;

        let topic = self
            .engine
            .get_topic(topic_name)
            .map_err(|e| ProtocolError::client("E_MPUB_FAILED", e.to_string()))?;
        let messages = bodies
            .into_iter()
            .map(|b| Message::new(topic.generate_id(), b))
            .collect();
        topic
            .put_messages(messages)
            .await
            .map_err(|e| ProtocolError::client("E_MPUB_FAILED", e.to_string()))?;
        Ok(Some(OK.to_vec()))
    }

    async fn dpublish(
        &mut self,
        reader: &mut BufReader<OwnedReadHalf>,
        params: &[&[u8]],
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if params.len() != 3 {
            return Err(ProtocolError::fatal(
                "E_INVALID",
                "DPUB requires a topic and a defer time",
            ));
        }
        let topic_name = param_str(params[1])?;
        if !ems_utils::names::is_valid_topic_name(topic_name) {
            return Err(ProtocolError::client(
                "E_BAD_TOPIC",
                format!("DPUB topic name {topic_name:?} is not valid"),
            ));
        }
        let defer_ms: i64 = param_str(params[2])?
            .parse()
            .map_err(|_| ProtocolError::fatal("E_INVALID", "DPUB defer time is not a number"))?;
        let opts = self.engine.opts();
        let max = opts.client.max_req_timeout_ms as i64;
        if !(0..=max).contains(&defer_ms) {
            return Err(ProtocolError::fatal(
                "E_INVALID",
                format!("DPUB defer time {defer_ms} out of range 0..={max}"),
            ));
        }
        let body = read_body(reader, opts.queue.max_body_size).await?;
        if body.len() as u32 > opts.queue.max_msg_size {
            return Err(ProtocolError::client(
                "E_BAD_MESSAGE",
                format!("message too big: {} > {}", body.len(), opts.queue.max_msg_size),
            ));
        }
        self.check_auth("publish", topic_name, "")?;

        let topic = self
            .engine
            .get_topic(topic_name)
            .map_err(|e| ProtocolError::client("E_DPUB_FAILED", e.to_string()))?;
        let mut m = Message::new(topic.generate_id(), body);
        m.deferred_ns = ems_utils::time::ms_to_ns(defer_ms as u64);
        topic
            .put_message(m)
            .await
            .map_err(|e| ProtocolError::client("E_DPUB_FAILED", e.to_string()))?;
        Ok(Some(OK.to_vec()))
    }
}

fn param_str<'a>(raw: &'a [u8]) -> Result<&'a str, ProtocolError> {
    std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::fatal("E_INVALID", "parameter is not utf-8"))
}

/// MPUB body: `count(4, BE) || (len(4, BE) || body)*count`.
pub fn parse_mpub_body(body: &[u8], max_msg_size: u32) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let mut buf = body;
    if buf.remaining() < 4 {
        return Err(ProtocolError::client("E_BAD_BODY", "MPUB body too short"));
    }
    let count = buf.get_u32();
    if count == 0 {
        return Err(ProtocolError::client(
            "E_BAD_BODY",
            "MPUB needs at least one message",
        ));
    }

    let mut bodies = Vec::with_capacity(count as usize);
    for i in 0..count {
        if buf.remaining() < 4 {
            return Err(ProtocolError::client(
                "E_BAD_MESSAGE",
                format!("MPUB message {i} is truncated"),
            ));
        }
        let len = buf.get_u32();
        if len == 0 || len > max_msg_size {
            return Err(ProtocolError::client(
                "E_BAD_MESSAGE",
                format!("MPUB message {i} has invalid size {len}"),
            ));
        }
        if buf.remaining() < len as usize {
            return Err(ProtocolError::client(
                "E_BAD_MESSAGE",
                format!("MPUB message {i} is truncated"),
            ));
        }
        bodies.push(buf[..len as usize].to_vec());
        buf.advance(len as usize);
    }
    if buf.has_remaining() {
        return Err(ProtocolError::client(
            "E_BAD_BODY",
            "MPUB body has trailing bytes",
        ));
    }
    Ok(bodies)
}

// ---- write side ----

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<OutFrame>,
    client: Arc<ClientConn>,
    mut shutdown: watch::Receiver<bool>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut buf = BytesMut::with_capacity(DEFAULT_OUTPUT_BUFFER_SIZE);
    let mut identity = client.identity();
    let mut hb_timer = make_ticker(identity.heartbeat_interval_ms, 30_000);
    let mut flush_timer = make_ticker(identity.output_buffer_timeout_ms, 250);

    loop {
        tokio::select! {
            biased;

            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                match frame {
                    OutFrame::IdentityUpdated => {
                        identity = client.identity();
                        hb_timer = make_ticker(identity.heartbeat_interval_ms, 30_000);
                        flush_timer = make_ticker(identity.output_buffer_timeout_ms, 250);
                    }
                    OutFrame::Response(p) => {
                        append_frame(&mut buf, FRAME_TYPE_RESPONSE, &p);
                        if flush(&mut writer, &mut buf).await.is_err() {
                            break;
                        }
                    }
                    OutFrame::Error(p) => {
                        append_frame(&mut buf, FRAME_TYPE_ERROR, &p);
                        if flush(&mut writer, &mut buf).await.is_err() {
                            break;
                        }
                    }
                    OutFrame::Message(p) => {
                        append_frame(&mut buf, FRAME_TYPE_MESSAGE, &p);
                        if buf.len() >= identity.output_buffer_size
                            && flush(&mut writer, &mut buf).await.is_err()
                        {
                            break;
                        }
                    }
                }
            }

            _ = flush_timer.tick() => {
                if !buf.is_empty() && flush(&mut writer, &mut buf).await.is_err() {
                    break;
                }
            }

            _ = hb_timer.tick() => {
                if identity.heartbeat_interval_ms > 0 {
                    append_frame(&mut buf, FRAME_TYPE_RESPONSE, HEARTBEAT);
                    if flush(&mut writer, &mut buf).await.is_err() {
                        break;
                    }
                }
            }

            _ = close_rx.changed() => {
                // the read loop is done; push out whatever is queued
                while let Ok(frame) = out_rx.try_recv() {
                    match frame {
                        OutFrame::Response(p) => append_frame(&mut buf, FRAME_TYPE_RESPONSE, &p),
                        OutFrame::Error(p) => append_frame(&mut buf, FRAME_TYPE_ERROR, &p),
                        OutFrame::Message(p) => append_frame(&mut buf, FRAME_TYPE_MESSAGE, &p),
                        OutFrame::IdentityUpdated => {}
                    }
                }
                let _ = flush(&mut writer, &mut buf).await;
                break;
            }

            _ = shutdown.changed() => {
                let _ = flush(&mut writer, &mut buf).await;
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn make_ticker(ms: u64, fallback_ms: u64) -> tokio::time::Interval {
    let period = Duration::from_millis(if ms == 0 { fallback_ms.max(1) } else { ms });
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker
}

async fn flush(writer: &mut OwnedWriteHalf, buf: &mut BytesMut) -> std::io::Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let result = writer.write_all(buf).await;
    buf.clear();
    result
}
