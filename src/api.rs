//! The HTTP API bridges talk to.
//!
//! A thin layer: it authenticates, redirects writes to the leader, proposes
//! records through the consensus seam and serves long-polls straight from
//! the output stream. All IRC semantics live behind the FSM, never here.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::expiry::now_nanos;
use crate::ircserver::SessionId;
use crate::metrics;
use crate::raft::{Consensus, NodeState};
use crate::types::{RobustId, RobustMessage, RobustType};
use crate::Core;

/// Wait window for client-submitted records.
const APPLY_WAIT: Duration = Duration::from_secs(10);

/// How long one long-poll request stays open without any output before the
/// bridge has to re-poll.
const POLL_WINDOW: Duration = Duration::from_secs(60);

pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/robustirc/v1/session", post(create_session))
        .route("/robustirc/v1/:session/message", post(post_message))
        .route("/robustirc/v1/:session/messages", get(get_messages))
        .route("/robustirc/v1/:session", delete(delete_session))
        .route("/join", post(join))
        .route("/metrics", get(metrics_handler))
        .route("/quit", get(quit))
        .with_state(core)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::AuthFailed => StatusCode::UNAUTHORIZED,
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::SessionUnknown(_) => StatusCode::NOT_FOUND,
            Error::MalformedRecord(_) | Error::IrcParse(_) => StatusCode::BAD_REQUEST,
            Error::SessionLimit | Error::ChannelLimit => StatusCode::SERVICE_UNAVAILABLE,
            Error::NotLeader { .. } => StatusCode::TEMPORARY_REDIRECT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Validate HTTP Basic auth against the network password. The username is
/// ignored, as the password alone identifies the network.
fn check_auth(core: &Core, headers: &HeaderMap) -> Result<(), Error> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::AuthFailed)?;
    let encoded = value.strip_prefix("Basic ").ok_or(Error::AuthFailed)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| Error::AuthFailed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| Error::AuthFailed)?;
    let password = decoded
        .split_once(':')
        .map(|(_, password)| password)
        .unwrap_or(&decoded);
    if password == core.password {
        Ok(())
    } else {
        Err(Error::AuthFailed)
    }
}

/// Writes only commit on the leader; anyone else answers with a redirect
/// the bridge follows.
fn require_leader(core: &Core, uri: &Uri) -> Result<(), Response> {
    if core.consensus.state() == NodeState::Leader {
        return Ok(());
    }
    match core.consensus.leader() {
        Some(leader) => Err((
            StatusCode::TEMPORARY_REDIRECT,
            [(header::LOCATION, format!("https://{}{}", leader, uri.path()))],
        )
            .into_response()),
        None => Err((StatusCode::BAD_GATEWAY, "no leader known").into_response()),
    }
}

#[derive(Serialize)]
struct CreateSessionResponse {
    #[serde(rename = "Sessionid")]
    sessionid: String,
    #[serde(rename = "Prefix")]
    prefix: String,
}

async fn create_session(
    State(core): State<Arc<Core>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = check_auth(&core, &headers) {
        return e.into_response();
    }
    if let Err(redirect) = require_leader(&core, &uri) {
        return redirect;
    }
    let msg = RobustMessage::new(
        RobustType::CreateSession,
        0,
        addr.to_string(),
        now_nanos(),
    );
    match core.consensus.apply(msg.encode(), APPLY_WAIT).await {
        Ok(id) => {
            if core.fsm.server().session_by_id(SessionId(id.id)).is_none() {
                // The record committed but the state machine refused it.
                return Error::SessionLimit.into_response();
            }
            tracing::info!(session = id.id, remote = %addr, "session created");
            Json(CreateSessionResponse {
                sessionid: id.id.to_string(),
                prefix: core.config.network.name.clone(),
            })
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Serialize)]
struct PostMessageResponse {
    #[serde(rename = "Id")]
    id: String,
}

async fn post_message(
    State(core): State<Arc<Core>>,
    Path(session): Path<u64>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(e) = check_auth(&core, &headers) {
        return e.into_response();
    }
    if let Err(redirect) = require_leader(&core, &uri) {
        return redirect;
    }
    if core.fsm.server().session_by_id(SessionId(session)).is_none() {
        return Error::SessionUnknown(session).into_response();
    }
    let line = body.trim_end_matches(['\r', '\n']).to_string();
    let msg = RobustMessage::new(RobustType::IrcFromClient, session, line, now_nanos());
    match core.consensus.apply(msg.encode(), APPLY_WAIT).await {
        Ok(id) => Json(PostMessageResponse { id: id.to_string() }).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    lastseen: Option<String>,
}

#[derive(Serialize)]
struct MessagesBatch {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Messages")]
    messages: Vec<String>,
}

/// Long-poll the output stream: one JSON batch per line, flushed as soon as
/// it exists, until the poll window closes or the bridge goes away.
async fn get_messages(
    State(core): State<Arc<Core>>,
    Path(session): Path<u64>,
    Query(query): Query<MessagesQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = check_auth(&core, &headers) {
        return e.into_response();
    }
    let last_seen = match query.lastseen {
        Some(raw) => match raw.parse::<RobustId>() {
            Ok(id) => id,
            Err(e) => return e.into_response(),
        },
        None => RobustId::default(),
    };

    // Dropping the response body cancels the token, which wakes a blocked
    // get_next within one poll heartbeat.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let stream = futures_util::stream::unfold(
        (core, last_seen, cancel, guard),
        move |(core, last_seen, cancel, guard)| async move {
            let deadline = Instant::now() + POLL_WINDOW;
            match core
                .output
                .get_next(SessionId(session), last_seen, deadline, &cancel)
                .await
            {
                Ok((id, lines)) => {
                    let batch = MessagesBatch {
                        id: id.to_string(),
                        messages: lines,
                    };
                    let mut chunk = serde_json::to_vec(&batch).unwrap_or_default();
                    chunk.push(b'\n');
                    Some((Ok::<_, Infallible>(chunk), (core, id, cancel, guard)))
                }
                Err(_) => None,
            }
        },
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
        .expect("static response construction")
}

async fn delete_session(
    State(core): State<Arc<Core>>,
    Path(session): Path<u64>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(e) = check_auth(&core, &headers) {
        return e.into_response();
    }
    if let Err(redirect) = require_leader(&core, &uri) {
        return redirect;
    }
    let reason = if body.is_empty() {
        "Bridge closed the session".to_string()
    } else {
        body
    };
    let msg = RobustMessage::new(RobustType::DeleteSession, session, reason, now_nanos());
    match core.consensus.apply(msg.encode(), APPLY_WAIT).await {
        Ok(_) => (StatusCode::OK, "session deleted").into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct JoinRequest {
    #[serde(rename = "Addr")]
    addr: String,
}

async fn join(
    State(core): State<Arc<Core>>,
    uri: Uri,
    headers: HeaderMap,
    Json(request): Json<JoinRequest>,
) -> Response {
    if let Err(e) = check_auth(&core, &headers) {
        return e.into_response();
    }
    if let Err(redirect) = require_leader(&core, &uri) {
        return redirect;
    }
    tracing::info!(addr = %request.addr, "adding peer");
    match core.consensus.add_peer(request.addr).await {
        Ok(()) => (StatusCode::OK, "peer added").into_response(),
        Err(e) => e.into_response(),
    }
}

async fn metrics_handler(State(core): State<Arc<Core>>, headers: HeaderMap) -> Response {
    if let Err(e) = check_auth(&core, &headers) {
        return e.into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
        .into_response()
}

/// Graceful shutdown: answer the request, then terminate so the supervisor
/// restarts the node.
async fn quit(State(core): State<Arc<Core>>, headers: HeaderMap) -> Response {
    if let Err(e) = check_auth(&core, &headers) {
        return e.into_response();
    }
    tracing::warn!("termination requested via /quit");
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::process::exit(0);
    });
    (StatusCode::OK, "terminating").into_response()
}
