//! The HTTP surface the homeserver pushes to:
//! - `PUT /transactions/:txn_id` - a batch of room events
//! - `GET /users/:user_id` - does this puppet exist?
//! - `GET /rooms/:alias` - never provided
//!
//! Every route is also served under `/_matrix/app/v1`.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::{get, put};
use axum::{Json, Router};
use bridge_core::matrix::RoomEvent;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::matrix::MatrixManager;

const LEGACY_PREFIX: &str = "";
const V1_PREFIX: &str = "/_matrix/app/v1";

#[derive(Clone)]
pub struct AppState {
    pub matrix: Arc<MatrixManager>,
    pub hs_token: Arc<str>,
}

impl AppState {
    pub fn new(matrix: Arc<MatrixManager>, hs_token: &str) -> Self {
        Self {
            matrix,
            hs_token: Arc::from(hs_token),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub errcode: &'static str,
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, errcode: &'static str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            errcode,
            error: message.into(),
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    access_token: Option<String>,
}

/// Checks the homeserver token, from the query string or a bearer header.
fn authorize(state: &AppState, query: &TokenQuery, headers: &HeaderMap) -> Result<(), ApiError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let token = query.access_token.as_deref().or(bearer);
    match token {
        None => Err(error(
            StatusCode::UNAUTHORIZED,
            "M_UNAUTHORIZED",
            "missing access token",
        )),
        Some(token) if token == &*state.hs_token => Ok(()),
        Some(_) => Err(error(
            StatusCode::FORBIDDEN,
            "M_FORBIDDEN",
            "invalid access token",
        )),
    }
}

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new();
    for prefix in [LEGACY_PREFIX, V1_PREFIX] {
        router = router
            .route(&format!("{prefix}/transactions/:txn_id"), put(push_transaction))
            .route(&format!("{prefix}/users/:user_id"), get(query_user))
            .route(&format!("{prefix}/rooms/:alias"), get(query_room));
    }
    router.with_state(state)
}

async fn push_transaction(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &query, &headers)?;

    let raw = body
        .get("events")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let events: Vec<RoomEvent> = raw
        .into_iter()
        .filter_map(|event| match serde_json::from_value(event) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(target: "Matrix/AS", "Transaction {txn_id}: skipping unreadable event: {e}");
                None
            }
        })
        .collect();

    state.matrix.process_transaction(&txn_id, events).await;
    Ok(Json(json!({})))
}

async fn query_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &query, &headers)?;

    match state.matrix.query_user(&user_id).await {
        Ok(true) => Ok(Json(json!({}))),
        Ok(false) => Err(error(
            StatusCode::NOT_FOUND,
            "M_NOT_FOUND",
            format!("{user_id} is not a bridged user"),
        )),
        Err(e) => {
            warn!(target: "Matrix/AS", "Unable to provision {user_id}: {e}");
            Err(error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "M_UNKNOWN",
                e.to_string(),
            ))
        }
    }
}

async fn query_room(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &query, &headers)?;

    state.matrix.query_room(&alias);
    Err(error(
        StatusCode::NOT_FOUND,
        "M_NOT_FOUND",
        format!("{alias} is not provided by this bridge"),
    ))
}

/// Serves the application service API until the listener fails.
pub async fn serve(bind: &str, router: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(target: "Matrix/AS", "Application service listening on {bind}");
    axum::serve(listener, router).await?;
    Ok(())
}
