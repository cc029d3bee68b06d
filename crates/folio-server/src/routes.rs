//! HTTP routes

use std::sync::Arc;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use folio_core::{DocumentId, WorkspaceId};
use folio_session::{ConnectParams, SessionManager};
use folio_storage::DocumentRecord;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::user_from_headers;
use crate::ws::serve_socket;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/documents/{id}", put(create_document).get(get_document))
        .route("/sync", get(sync))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Health {
    accepting: bool,
    sessions: usize,
}

async fn health(State(state): State<AppState>) -> Response {
    let health = Health {
        accepting: state.manager.is_accepting(),
        sessions: state.manager.live_count(),
    };
    let status = if health.accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

#[derive(Debug, Deserialize)]
struct NewDocument {
    workspace_id: WorkspaceId,
    #[serde(default)]
    title: Option<String>,
}

/// Register a document record; an existing record is left as is
async fn create_document(
    State(state): State<AppState>,
    Path(id): Path<DocumentId>,
    Json(body): Json<NewDocument>,
) -> Response {
    let store = &state.manager.context().store;
    match store.get_document(&id).await {
        Ok(Some(record)) => return (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => {}
        Err(e) => return internal_error(e),
    }

    let mut record = DocumentRecord::new(id.clone(), body.workspace_id);
    if let Some(title) = body.title {
        record = record.with_title(title);
    }
    match store.put_document(&record).await {
        Ok(()) => {
            info!(document_id = %id, "Document registered");
            (StatusCode::CREATED, Json(record)).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn get_document(State(state): State<AppState>, Path(id): Path<DocumentId>) -> Response {
    match state.manager.context().store.get_document(&id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let Some(user) = user_from_headers(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !state.manager.is_accepting() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let manager = state.manager.clone();
    upgrade.on_upgrade(move |socket| serve_socket(socket, manager, user, params))
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!(error = %e, "Request failed");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
