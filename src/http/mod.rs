//! HTTP JSON API.
//!
//! A thin facade: read endpoints render snapshots under a short-held read
//! lock; write endpoints validate the PIN and body, then post a command to
//! the serial task and wait on the oneshot reply. Request bodies are capped
//! at 16 KiB; oversize requests answer 413 before any handler runs.

pub mod admin;
pub mod calibration;
pub mod contacts;
pub mod history;
pub mod relay;
pub mod response;
pub mod serial;
pub mod tanks;

use crate::state::{Command, SharedState};
use axum::{
    extract::DefaultBodyLimit,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tower_http::{services::ServeDir, trace::TraceLayer};

/// Maximum accepted request body.
pub const MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub state: SharedState,
    pub tx: mpsc::Sender<Command>,
}

pub fn build_router(app: AppState, dashboard_dir: Option<PathBuf>) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(admin::healthz))
        .route("/api/tanks", get(tanks::list_tanks))
        .route("/api/clients", get(tanks::list_clients))
        .route("/api/unloads", get(tanks::list_unloads))
        .route("/api/history", get(history::get_history))
        .route("/api/history/compare", get(history::compare_months))
        .route("/api/history/yoy", get(history::year_over_year))
        .route(
            "/api/calibration",
            get(calibration::get_calibration).post(calibration::post_calibration),
        )
        .route(
            "/api/contacts",
            get(contacts::get_contacts).post(contacts::post_contacts),
        )
        .route("/api/config", post(admin::post_config))
        .route("/api/server-settings", post(admin::post_server_settings))
        .route("/api/pin", post(admin::post_pin))
        .route("/api/refresh", post(admin::post_refresh))
        .route("/api/pause", post(admin::post_pause))
        .route("/api/relay", post(relay::post_relay))
        .route("/api/relay/clear", post(relay::post_relay_clear))
        .route("/api/serial-logs", get(serial::get_serial_logs))
        .route("/api/serial-export", get(serial::get_serial_export))
        .route("/api/serial-request", post(serial::post_serial_request));

    if let Some(dir) = dashboard_dir {
        router = router.fallback_service(ServeDir::new(dir));
    } else {
        router = router.fallback(not_found_fallback);
    }

    router
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

async fn not_found_fallback() -> Response {
    response::not_found("unknown path").into_response()
}

/// PIN gate for mutating endpoints. An unconfigured PIN refuses everything.
pub(crate) async fn require_pin(
    app: &AppState,
    body: &serde_json::Value,
) -> Result<(), Response> {
    let pin = body.get("pin").and_then(|v| v.as_str()).unwrap_or("");
    let st = app.state.read().await;
    if st.settings.pin_matches(pin) {
        Ok(())
    } else {
        Err(response::forbidden("missing or invalid PIN"))
    }
}
