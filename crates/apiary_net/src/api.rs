//! HTTP surface — the eight JSON routes every apiary server exposes.
//!
//! Handlers are thin: parse, authorize, forward to the owning hive actor,
//! map the result. All policy lives in `apiary_hive`; all status-code
//! mapping lives in [`ApiError`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::async_trait;
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use apiary_core::error::{ApiaryError, AuthFailure};
use apiary_core::protocol;
use apiary_hive::{HiveRegistry, JoinRequest, MessageCandidate, Session, session};

use crate::gossip::{self, GOSSIP_SECRET_HEADER};
use crate::wire::{
    ChallengeRequest, ErrorBody, GossipFeed, GossipPush, GossipPushOutcome, HealthResponse,
    JoinResponse, MessagesResponse, PostMessageRequest, PostMessageResponse,
};

// ---------------------------------------------------------------------------
// State and errors
// ---------------------------------------------------------------------------

/// Shared handler state; cheap to clone per request.
#[derive(Clone)]
pub struct ApiState(Arc<ApiInner>);

struct ApiInner {
    registry: Arc<HiveRegistry>,
    gossip_secret: Option<String>,
}

impl ApiState {
    pub fn new(registry: Arc<HiveRegistry>, gossip_secret: Option<String>) -> Self {
        Self(Arc::new(ApiInner {
            registry,
            gossip_secret,
        }))
    }

    fn registry(&self) -> &HiveRegistry {
        &self.0.registry
    }
}

/// Response-side wrapper mapping the error taxonomy onto status codes.
struct ApiError(ApiaryError);

impl From<ApiaryError> for ApiError {
    fn from(err: ApiaryError) -> Self {
        Self(err)
    }
}

impl From<AuthFailure> for ApiError {
    fn from(failure: AuthFailure) -> Self {
        Self(failure.into())
    }
}

/// `Json` with the extractor's own rejections folded into the error
/// taxonomy: an undeserializable body — bad syntax, a missing field, a
/// missing content type — is a 400 with the standard error body, never
/// axum's plain-text 415/422.
struct ApiJson<T>(T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiaryError::validation(rejection.body_text()).into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ApiaryError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiaryError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiaryError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiaryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/protocol", get(protocol_info))
        .route("/challenge", post(challenge))
        .route("/join", post(join))
        .route("/message", post(post_message))
        .route("/messages", get(read_messages))
        .route("/gossip/messages", get(gossip_feed))
        .route("/gossip/push", post(gossip_push))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> ApiError {
    ApiaryError::NotFound("no such route".to_string()).into()
}

// ---------------------------------------------------------------------------
// Auth helpers
// ---------------------------------------------------------------------------

/// Resolves a bearer token to its live session by routing through the
/// owning hive actor. Any shape problem collapses to the same 401.
async fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<Session, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthFailure::InvalidSession)?;

    let hive_id = session::token_hive_id(token).ok_or(AuthFailure::InvalidSession)?;
    let hive = state
        .registry()
        .get(hive_id)
        .await
        .ok_or(AuthFailure::InvalidSession)?;
    let session = hive
        .validate_session(token)
        .await?
        .ok_or(AuthFailure::InvalidSession)?;
    Ok(session)
}

/// Both gossip endpoints demand the shared secret when one is configured.
/// The comparison is constant-time; a missing header never matches.
fn check_gossip_secret(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.0.gossip_secret else {
        return Ok(());
    };
    let supplied = headers
        .get(GOSSIP_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if bool::from(expected.as_bytes().ct_eq(supplied.as_bytes())) {
        Ok(())
    } else {
        Err(AuthFailure::InvalidSession.into())
    }
}

/// Parses an optional decimal query parameter; its mere presence with a
/// non-numeric value is a hard 400, not a silent default.
fn parse_param<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ApiError> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            ApiError::from(ApiaryError::validation(format!(
                "query parameter '{name}' must be numeric"
            )))
        }),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: protocol::PROTOCOL_VERSION.to_string(),
    })
}

async fn protocol_info(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let settings = state.registry().settings();
    Json(json!({
        "protocol_version": protocol::PROTOCOL_VERSION,
        "challenge_ttl_ms": settings.challenge_ttl_ms,
        "session_ttl_ms": settings.session_ttl_ms,
        "max_clock_skew_ms": settings.auth.max_clock_skew_ms,
        "device_proof_required": settings.auth.device_proof_required,
        "device_proof_max_age_ms": settings.auth.device_proof_max_age_ms,
        "read_limit_default": protocol::READ_LIMIT_DEFAULT,
        "read_limit_cap": protocol::READ_LIMIT_CAP,
        "max_content_bytes": protocol::MAX_CONTENT_BYTES,
    }))
}

/// First contact with a hive spawns it.
async fn challenge(
    State(state): State<ApiState>,
    ApiJson(request): ApiJson<ChallengeRequest>,
) -> Result<Response, ApiError> {
    if request.hive_id.is_empty() || request.agent_id.is_empty() {
        return Err(ApiaryError::validation("agent_id and hive_id are required").into());
    }
    let hive = state.registry().get_or_spawn(&request.hive_id).await?;
    let challenge = hive
        .issue_challenge(&request.agent_id, &request.pubkey)
        .await?;
    debug!(
        hive_id = %request.hive_id,
        agent_id = %request.agent_id,
        "challenge issued"
    );
    Ok(Json(challenge).into_response())
}

/// A join can only consume a challenge the named hive actually issued, so an
/// unknown hive is the same rejection as an unknown nonce.
async fn join(
    State(state): State<ApiState>,
    ApiJson(request): ApiJson<JoinRequest>,
) -> Result<Response, ApiError> {
    let hive = state
        .registry()
        .get(&request.hive_id)
        .await
        .ok_or(AuthFailure::ChallengeNotFound)?;

    let agent_id = request.agent_id.clone();
    let hive_id = request.hive_id.clone();
    match hive.join(request).await {
        Ok(grant) => {
            info!(hive_id = %hive_id, agent_id = %agent_id, "agent joined");
            Ok(Json(JoinResponse::new(grant.token, &grant.session)).into_response())
        }
        Err(err) => {
            debug!(hive_id = %hive_id, agent_id = %agent_id, %err, "join rejected");
            Err(err.into())
        }
    }
}

async fn post_message(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<PostMessageRequest>,
) -> Result<Json<PostMessageResponse>, ApiError> {
    let session = authorize(&state, &headers).await?;

    let candidate = MessageCandidate::local(
        &session.hive_id,
        &session.agent_id,
        request.content,
        request.channel,
        request.uid,
    );
    candidate.validate().map_err(ApiaryError::validation)?;

    // The session proves the hive exists, but its actor can only be absent
    // after a restart; treat that like an expired session.
    let hive = state
        .registry()
        .get(&session.hive_id)
        .await
        .ok_or(AuthFailure::InvalidSession)?;
    let stored = hive.append(candidate).await?;
    let duplicate = stored.is_none();
    Ok(Json(PostMessageResponse {
        message: stored,
        duplicate,
    }))
}

async fn read_messages(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let session = authorize(&state, &headers).await?;
    let since = parse_param(&params, "since", 0i64)?;
    let limit = parse_param(&params, "limit", protocol::READ_LIMIT_DEFAULT)?;

    let hive = state
        .registry()
        .get(&session.hive_id)
        .await
        .ok_or(AuthFailure::InvalidSession)?;
    let messages = hive.read_since(since, limit).await?;
    Ok(Json(MessagesResponse { messages }))
}

/// Peer pull feed. A hive this server does not host has nothing to say, so
/// the feed is empty rather than an error.
async fn gossip_feed(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<GossipFeed>, ApiError> {
    check_gossip_secret(&state, &headers)?;
    let hive_id = params
        .get("hive_id")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiaryError::validation("query parameter 'hive_id' is required"))?
        .clone();
    let since_ms = parse_param(&params, "since_ms", 0i64)?;
    let limit = parse_param(&params, "limit", protocol::READ_LIMIT_CAP)?;

    let messages = match state.registry().get(&hive_id).await {
        Some(hive) => hive.read_since_time(since_ms, limit).await?,
        None => Vec::new(),
    };
    Ok(Json(GossipFeed { hive_id, messages }))
}

/// Peer push. The pusher already hosts the hive, so this server starts
/// hosting it too.
async fn gossip_push(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiJson(push): ApiJson<GossipPush>,
) -> Result<Json<GossipPushOutcome>, ApiError> {
    check_gossip_secret(&state, &headers)?;
    if push.hive_id.is_empty() {
        return Err(ApiaryError::validation("hive_id is required").into());
    }

    let hive = state.registry().get_or_spawn(&push.hive_id).await?;
    let merge = gossip::merge_batch(&hive, &push.hive_id, push.messages).await?;
    debug!(
        hive_id = %push.hive_id,
        accepted = merge.accepted,
        skipped = merge.skipped,
        "gossip push merged"
    );
    Ok(Json(GossipPushOutcome {
        accepted: merge.accepted,
        skipped: merge.skipped,
    }))
}
