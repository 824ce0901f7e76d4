//! Thin HTTP surface over the engine: publish endpoints, topic/channel
//! administration, stats, health and runtime config.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

use ems_broker::{Engine, EngineError, Message};

use crate::protocol::parse_mpub_body;

type ApiResult<T> = Result<T, ApiError>;

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match e {
            EngineError::InvalidName(_) | EngineError::BadMessage(_) => StatusCode::BAD_REQUEST,
            EngineError::TopicNotFound | EngineError::ChannelNotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl From<crate::error::ProtocolError> for ApiError {
    fn from(e: crate::error::ProtocolError) -> Self {
        ApiError(StatusCode::BAD_REQUEST, e.to_string())
    }
}

#[derive(Deserialize)]
struct TopicQuery {
    topic: String,
}

#[derive(Deserialize)]
struct ChannelQuery {
    topic: String,
    channel: String,
}

#[derive(Deserialize)]
struct MpubQuery {
    topic: String,
    #[serde(default)]
    binary: bool,
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/stats", get(stats))
        .route("/pub", post(do_pub))
        .route("/mpub", post(do_mpub))
        .route("/topic/create", post(topic_create))
        .route("/topic/delete", post(topic_delete))
        .route("/topic/empty", post(topic_empty))
        .route("/topic/pause", post(topic_pause))
        .route("/topic/unpause", post(topic_unpause))
        .route("/channel/create", post(channel_create))
        .route("/channel/delete", post(channel_delete))
        .route("/channel/empty", post(channel_empty))
        .route("/channel/pause", post(channel_pause))
        .route("/channel/unpause", post(channel_unpause))
        .route("/config/:key", put(config_put))
        .with_state(engine)
}

/// Serve until the engine's shutdown signal fires.
pub async fn run_http_server(engine: Arc<Engine>, listener: TcpListener) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    info!(addr = %local, "HTTP listener ready");

    let mut shutdown = engine.shutdown_signal();
    let app = router(Arc::clone(&engine));
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    info!(addr = %local, "HTTP listener stopped");
}

async fn ping(State(engine): State<Arc<Engine>>) -> Response {
    if engine.is_healthy() {
        "OK".into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, engine.health()).into_response()
    }
}

async fn stats(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.stats()).into_response()
}

async fn do_pub(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<TopicQuery>,
    body: Bytes,
) -> ApiResult<&'static str> {
    let opts = engine.opts();
    if body.is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "empty body".into()));
    }
    if body.len() as u32 > opts.queue.max_msg_size {
        return Err(ApiError(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("message too big: {} > {}", body.len(), opts.queue.max_msg_size),
        ));
    }
    let topic = engine.get_topic(&q.topic)?;
    let m = Message::new(topic.generate_id(), body.to_vec());
    topic.put_message(m).await?;
    Ok("OK")
}

async fn do_mpub(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<MpubQuery>,
    body: Bytes,
) -> ApiResult<&'static str> {
    let opts = engine.opts();
    if body.len() as u32 > opts.queue.max_body_size {
        return Err(ApiError(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("body too big: {} > {}", body.len(), opts.queue.max_body_size),
        ));
    }

    let bodies: Vec<Vec<u8>> = if q.binary {
        parse_mpub_body(&body, opts.queue.max_msg_size)?
    } else {
        body.split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| line.to_vec())
            .collect()
    };
    if bodies.is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "no messages".into()));
    }
    for b in &bodies {
        if b.len() as u32 > opts.queue.max_msg_size {
            return Err(ApiError(
                StatusCode::PAYLOAD_TOO_LARGE,
                "message too big".into(),
            ));
        }
    }

    let topic = engine.get_topic(&q.topic)?;
    let messages = bodies
        .into_iter()
        .map(|b| Message::new(topic.generate_id(), b))
        .collect();
    topic.put_messages(messages).await?;
    Ok("OK")
}

// ---- topic admin ----

async fn topic_create(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<TopicQuery>,
) -> ApiResult<&'static str> {
    engine.get_topic(&q.topic)?;
    Ok("OK")
}

async fn topic_delete(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<TopicQuery>,
) -> ApiResult<&'static str> {
    engine.delete_existing_topic(&q.topic).await?;
    Ok("OK")
}

async fn topic_empty(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<TopicQuery>,
) -> ApiResult<&'static str> {
    engine.get_existing_topic(&q.topic)?.empty().await?;
    Ok("OK")
}

async fn topic_pause(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<TopicQuery>,
) -> ApiResult<&'static str> {
    engine.get_existing_topic(&q.topic)?.pause();
    engine.persist_metadata()?;
    Ok("OK")
}

async fn topic_unpause(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<TopicQuery>,
) -> ApiResult<&'static str> {
    engine.get_existing_topic(&q.topic)?.unpause();
    engine.persist_metadata()?;
    Ok("OK")
}

// ---- channel admin ----

async fn channel_create(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<ChannelQuery>,
) -> ApiResult<&'static str> {
    engine.get_topic(&q.topic)?.get_channel(&q.channel)?;
    Ok("OK")
}

async fn channel_delete(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<ChannelQuery>,
) -> ApiResult<&'static str> {
    engine
        .get_existing_topic(&q.topic)?
        .delete_existing_channel(&q.channel)
        .await?;
    Ok("OK")
}

async fn channel_empty(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<ChannelQuery>,
) -> ApiResult<&'static str> {
    engine
        .get_existing_topic(&q.topic)?
        .get_existing_channel(&q.channel)?
        .empty()
        .await?;
    Ok("OK")
}

async fn channel_pause(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<ChannelQuery>,
) -> ApiResult<&'static str> {
    engine
        .get_existing_topic(&q.topic)?
        .get_existing_channel(&q.channel)?
        .pause();
    engine.persist_metadata()?;
    Ok("OK")
}

async fn channel_unpause(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<ChannelQuery>,
) -> ApiResult<&'static str> {
    engine
        .get_existing_topic(&q.topic)?
        .get_existing_channel(&q.channel)?
        .unpause();
    engine.persist_metadata()?;
    Ok("OK")
}

// ---- runtime config ----

async fn config_put(
    State(engine): State<Arc<Engine>>,
    Path(key): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    match key.as_str() {
        "lookupd_tcp_addresses" => {
            let addresses: Vec<String> = serde_json::from_slice(&body).map_err(|e| {
                ApiError(
                    StatusCode::BAD_REQUEST,
                    format!("expected a JSON array of addresses: {e}"),
                )
            })?;
            engine.update_opts(|s| s.lookup.lookupd_tcp_addresses = addresses.clone());
            Ok(Json(addresses).into_response())
        }
        _ => Err(ApiError(
            StatusCode::BAD_REQUEST,
            format!("unknown config key {key:?}"),
        )),
    }
}
