//! JSON HTTP API: public reads, the deletion-flag workflow, and the
//! token-gated admin surface (CSV uploads, refresh triggers, flag review).

mod auth;
mod error;
mod handlers;

#[cfg(test)]
mod tests;

pub use auth::constant_time_eq;
pub use error::{ApiError, ApiResult};

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use oncomap_storage::Store;
use oncomap_sync::RefreshEngine;

pub const CRATE_NAME: &str = "oncomap-web";

const DEFAULT_CSV_UPLOAD_MAX_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub admin_token: Option<String>,
    pub cors_origin: String,
    pub refresh_health_max_age_minutes: i64,
    pub csv_upload_max_bytes: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            admin_token: None,
            cors_origin: "*".to_string(),
            refresh_health_max_age_minutes: 130,
            csv_upload_max_bytes: DEFAULT_CSV_UPLOAD_MAX_BYTES,
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("ONCOMAP_WEB_PORT")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            cors_origin: std::env::var("CORS_ORIGIN").unwrap_or(defaults.cors_origin),
            refresh_health_max_age_minutes: std::env::var("REFRESH_HEALTH_MAX_AGE_MINUTES")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.refresh_health_max_age_minutes),
            csv_upload_max_bytes: std::env::var("CSV_UPLOAD_MAX_BYTES")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.csv_upload_max_bytes),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub engine: Arc<RefreshEngine>,
    pub config: Arc<WebConfig>,
}

impl AppState {
    pub fn new(store: Store, engine: Arc<RefreshEngine>, config: WebConfig) -> Self {
        Self {
            store,
            engine,
            config: Arc::new(config),
        }
    }
}

pub fn app(state: AppState) -> Router {
    let admin = Router::new()
        .route("/centers/upload-csv", post(handlers::upload_centers_csv))
        .route("/companies/upload-csv", post(handlers::upload_companies_csv))
        .route("/companies", get(handlers::list_companies))
        .route("/refresh-center/{id}", post(handlers::refresh_center))
        .route("/refresh-batch", post(handlers::refresh_batch))
        .route("/refresh-all", post(handlers::refresh_all))
        .route("/offices/deletion-flags", get(handlers::list_deletion_flags))
        .route(
            "/offices/deletion-flags/{flagId}/decision",
            post(handlers::decide_deletion_flag),
        )
        .route("/status", get(handlers::admin_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin,
        ));

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/centers", get(handlers::list_centers))
        .route("/api/centers/{id}", get(handlers::get_center))
        .route("/api/centers/{id}/offices", get(handlers::list_center_offices))
        .route("/api/offices/flag-deletion", post(handlers::flag_deletion))
        .nest("/api/admin", admin)
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .layer(DefaultBodyLimit::max(state.config.csv_upload_max_bytes))
        .with_state(state)
}

/// CORS on every response; bare `OPTIONS` short-circuits to 204.
async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(&mut response, &state.config.cors_origin);
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors_headers(&mut response, &state.config.cors_origin);
    response
}

fn apply_cors_headers(response: &mut Response, origin: &str) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert("access-control-allow-origin", value);
    }
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("authorization, content-type"),
    );
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port = state.config.port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}
