//! HTTP route definitions and handlers.
//!
//! Routes:
//! - `GET /ws?user_id=` live connection
//! - `/users/:user_id/...` dispatch, history, pending drain, live publish
//! - `POST /notifications/:id/read` read state
//! - `/topics/:topic/...` follows and fan-out
//! - `GET /health`, `GET /ready`

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::attach::ws_attach;
use super::dispatch::Delivery;
use super::error::{ApiError, ApiResult};
use super::fanout::{FanOutReport, TopicEvent};
use super::validate::{validate_topic, validate_user_id};
use crate::broker::user_channel;
use crate::notification::{StoredNotification, UserId};
use crate::server::ServerState;
use crate::storage::run_blocking;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

/// Build the service router.
pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws", get(ws_attach))
        .route(
            "/users/:user_id/notifications",
            post(send_notification).get(list_notifications),
        )
        .route("/users/:user_id/pending", get(drain_pending))
        .route("/users/:user_id/publish", post(publish_live))
        .route("/notifications/:id/read", post(mark_read))
        .route(
            "/topics/:topic/subscribers",
            post(follow_topic).get(list_followers),
        )
        .route("/topics/:topic/subscribers/:user_id", delete(unfollow_topic))
        .route("/topics/:topic/notify", post(notify_topic))
        .route("/topics/:topic/events", post(enqueue_topic_event))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct PayloadBody {
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct FollowBody {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub user_id: UserId,
    pub notifications: Vec<StoredNotification>,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub user_id: UserId,
    pub notifications: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub channel: String,
    pub receivers: usize,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub notification_id: String,
    pub read: bool,
}

#[derive(Debug, Serialize)]
pub struct FollowResponse {
    pub topic: String,
    pub user_id: UserId,
    pub subscribed: bool,
}

#[derive(Debug, Serialize)]
pub struct UnfollowResponse {
    pub topic: String,
    pub user_id: UserId,
    pub unsubscribed: bool,
}

#[derive(Debug, Serialize)]
pub struct FollowersResponse {
    pub topic: String,
    pub subscribers: Vec<UserId>,
}

#[derive(Debug, Serialize)]
pub struct EventAccepted {
    pub topic: String,
    pub queued: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub active_connections: usize,
}

/// POST /users/:user_id/notifications
#[tracing::instrument(skip(state, body))]
async fn send_notification(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Json(body): Json<PayloadBody>,
) -> ApiResult<Json<Delivery>> {
    let user = validate_user_id(&user_id)?;
    let delivery = state.dispatcher.deliver(&user, &body.payload).await?;
    Ok(Json(delivery))
}

/// GET /users/:user_id/notifications?limit=
async fn list_notifications(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let user = validate_user_id(&user_id)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let store = state.stores.notifications.clone();
    let notifications = {
        let user = user.clone();
        run_blocking(move || store.history(&user, limit)).await?
    };
    Ok(Json(HistoryResponse {
        user_id: user,
        notifications,
    }))
}

/// GET /users/:user_id/pending
///
/// For clients that poll instead of holding a socket. Returned entries are
/// removed from the queue.
async fn drain_pending(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<PendingResponse>> {
    let user = validate_user_id(&user_id)?;
    let pending = state.stores.pending.clone();
    let notifications = {
        let user = user.clone();
        run_blocking(move || pending.drain_all(&user)).await?
    };
    tracing::debug!(user_id = %user, drained = notifications.len(), "Pending queue drained");
    Ok(Json(PendingResponse {
        user_id: user,
        notifications,
    }))
}

/// POST /users/:user_id/publish
///
/// Live only: nothing is queued or persisted.
async fn publish_live(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Json(body): Json<PayloadBody>,
) -> ApiResult<Json<PublishResponse>> {
    let user = validate_user_id(&user_id)?;
    let channel = user_channel(&user);
    let receivers = state.broker.publish(&channel, &body.payload)?;
    Ok(Json(PublishResponse { channel, receivers }))
}

/// POST /notifications/:id/read
async fn mark_read(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ReadResponse>> {
    let store = state.stores.notifications.clone();
    let found = {
        let id = id.clone();
        run_blocking(move || store.mark_read(&id)).await?
    };
    if !found {
        return Err(ApiError::NotFound(format!("notification '{id}'")));
    }
    Ok(Json(ReadResponse {
        notification_id: id,
        read: true,
    }))
}

/// POST /topics/:topic/subscribers
async fn follow_topic(
    State(state): State<Arc<ServerState>>,
    Path(topic): Path<String>,
    Json(body): Json<FollowBody>,
) -> ApiResult<Json<FollowResponse>> {
    validate_topic(&topic)?;
    let user = validate_user_id(&body.user_id)?;

    let index = state.stores.subscriptions.clone();
    let subscribed = {
        let (topic, user) = (topic.clone(), user.clone());
        run_blocking(move || index.subscribe(&topic, &user)).await?
    };
    if subscribed {
        tracing::info!(topic = %topic, user_id = %user, "User followed topic");
    }
    Ok(Json(FollowResponse {
        topic,
        user_id: user,
        subscribed,
    }))
}

/// DELETE /topics/:topic/subscribers/:user_id
async fn unfollow_topic(
    State(state): State<Arc<ServerState>>,
    Path((topic, user_id)): Path<(String, String)>,
) -> ApiResult<Json<UnfollowResponse>> {
    validate_topic(&topic)?;
    let user = validate_user_id(&user_id)?;

    let index = state.stores.subscriptions.clone();
    let unsubscribed = {
        let (topic, user) = (topic.clone(), user.clone());
        run_blocking(move || index.unsubscribe(&topic, &user)).await?
    };
    Ok(Json(UnfollowResponse {
        topic,
        user_id: user,
        unsubscribed,
    }))
}

/// GET /topics/:topic/subscribers
async fn list_followers(
    State(state): State<Arc<ServerState>>,
    Path(topic): Path<String>,
) -> ApiResult<Json<FollowersResponse>> {
    validate_topic(&topic)?;
    let index = state.stores.subscriptions.clone();
    let subscribers = {
        let topic = topic.clone();
        run_blocking(move || index.subscribers(&topic)).await?
    };
    Ok(Json(FollowersResponse { topic, subscribers }))
}

/// POST /topics/:topic/notify
async fn notify_topic(
    State(state): State<Arc<ServerState>>,
    Path(topic): Path<String>,
    Json(body): Json<MessageBody>,
) -> ApiResult<Json<FanOutReport>> {
    validate_topic(&topic)?;
    Ok(Json(state.fanout.notify_topic(&topic, &body.message).await))
}

/// POST /topics/:topic/events
async fn enqueue_topic_event(
    State(state): State<Arc<ServerState>>,
    Path(topic): Path<String>,
    Json(body): Json<MessageBody>,
) -> ApiResult<(StatusCode, Json<EventAccepted>)> {
    validate_topic(&topic)?;
    state.events.try_send(TopicEvent {
        topic: topic.clone(),
        message: body.message,
    })?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EventAccepted {
            topic,
            queued: true,
        }),
    ))
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /ready
///
/// Not ready once shutdown has begun.
async fn ready(State(state): State<Arc<ServerState>>) -> (StatusCode, Json<ReadyResponse>) {
    let active_connections = state.registry.active_count();
    if state.shutdown.is_cancelled() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "shutting_down",
                active_connections,
            }),
        );
    }
    (
        StatusCode::OK,
        Json(ReadyResponse {
            status: "ready",
            active_connections,
        }),
    )
}
