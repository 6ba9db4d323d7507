use std::collections::BTreeMap;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use dashlite_api::{bearer_token, DashError};
use dashlite_core::{Identity, LabelSelector, ResourceKind};
use dashlite_kubehub::WatchState;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{ws, AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/k8s/namespaces", get(namespaces))
        .route("/api/k8s/namespaces/summary", get(namespace_summaries))
        .route("/api/k8s/controllers", get(controllers))
        .route("/api/k8s/controllers/:namespace/:name", get(controller_detail))
        .route("/api/k8s/pods", get(pods))
        .route("/api/k8s/pods/:namespace/:name", get(pod_detail))
        .route("/api/k8s/cache/clear", post(clear_cache))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub(crate) struct ApiError(pub DashError);

impl From<DashError> for ApiError {
    fn from(e: DashError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self.0 {
            DashError::UpstreamUnavailable(m)
            | DashError::NotFound(m)
            | DashError::Unauthorized(m)
            | DashError::Forbidden(m)
            | DashError::Validation(m)
            | DashError::Internal(m) => m.clone(),
        };
        (status, Json(json!({ "error": self.0.code(), "message": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// The resolved caller of an authenticated route.
pub(crate) struct Caller(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = match parts.headers.get(AUTHORIZATION) {
            Some(v) => Some(
                v.to_str()
                    .ok()
                    .and_then(bearer_token)
                    .ok_or_else(|| DashError::Unauthorized("malformed authorization header".into()))?,
            ),
            None => None,
        };
        Ok(Caller(state.identities.resolve(token)?))
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    kubernetes_connected: bool,
    connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    watchers: Option<BTreeMap<ResourceKind, WatchState>>,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let failed = state.watch.as_ref().is_some_and(|w| w.any_failed());
    let synced = [ResourceKind::Namespace, ResourceKind::Pod].into_iter().all(|k| state.store.is_synced(k));
    Json(Health {
        status: if failed { "degraded" } else { "ok" },
        version: env!("CARGO_PKG_VERSION"),
        kubernetes_connected: synced && !failed,
        connections: state.hub.connection_count(),
        watchers: state.watch.as_ref().map(|w| w.snapshot()),
    })
}

async fn namespaces(State(state): State<AppState>, Caller(who): Caller) -> ApiResult<impl Serialize> {
    Ok(Json(state.api.list_namespaces(&who).await?))
}

async fn namespace_summaries(State(state): State<AppState>, Caller(who): Caller) -> ApiResult<impl Serialize> {
    Ok(Json(state.api.namespace_summaries(&who).await?))
}

#[derive(Debug, Default, Deserialize)]
struct ControllersQuery {
    namespace: Option<String>,
    /// Comma-separated name patterns.
    pattern: Option<String>,
}

async fn controllers(
    State(state): State<AppState>,
    Caller(who): Caller,
    Query(q): Query<ControllersQuery>,
) -> ApiResult<impl Serialize> {
    let patterns: Vec<String> = q
        .pattern
        .as_deref()
        .map(|p| p.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    Ok(Json(state.api.list_controllers(&who, q.namespace.as_deref(), &patterns).await?))
}

async fn controller_detail(
    State(state): State<AppState>,
    Caller(who): Caller,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<impl Serialize> {
    Ok(Json(state.api.controller_detail(&who, &namespace, &name).await?))
}

#[derive(Debug, Default, Deserialize)]
struct PodsQuery {
    namespace: Option<String>,
    label_selector: Option<String>,
}

async fn pods(State(state): State<AppState>, Caller(who): Caller, Query(q): Query<PodsQuery>) -> ApiResult<impl Serialize> {
    let selector: LabelSelector = match q.label_selector.as_deref() {
        Some(raw) => raw.parse::<LabelSelector>().map_err(DashError::Validation)?,
        None => LabelSelector::default(),
    };
    Ok(Json(state.api.list_pods(&who, q.namespace.as_deref(), &selector).await?))
}

async fn pod_detail(
    State(state): State<AppState>,
    Caller(who): Caller,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<impl Serialize> {
    Ok(Json(state.api.pod_detail(&who, &namespace, &name).await?))
}

async fn clear_cache(State(state): State<AppState>, Caller(who): Caller) -> ApiResult<serde_json::Value> {
    state.api.clear_cache().await?;
    tracing::info!(user = %who.username, "server: cache cleared on request");
    Ok(Json(json!({ "status": "ok" })))
}
