//! API version 1 endpoints.

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::RwLock;

use crate::poller::{PollEvent, PollState};
use crate::report::Report;
use crate::tracing::prelude::*;

/// Controller status as seen through published events.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Status {
    /// `idle` or `error`
    pub state: String,
    /// Message of the last failure, cleared by the next success
    pub error: Option<String>,
    /// Entries in the published window
    pub entries: usize,
    pub latest_block: Option<u64>,
    /// Published entries whose data was partly lost to failed batch slices
    pub lost_entries: usize,
    /// RFC 3339 time of the last published report
    pub updated_at: Option<String>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: PollState::Idle.as_ref().to_string(),
            error: None,
            entries: 0,
            latest_block: None,
            lost_entries: 0,
            updated_at: None,
        }
    }
}

/// API error response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Shared application state for API endpoints.
///
/// Holds a published copy of the latest report; the window itself stays
/// with the poll controller.
#[derive(Clone, Default)]
pub struct AppState {
    pub report: Arc<RwLock<Option<Report>>>,
    pub status: Arc<RwLock<Status>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a controller event into the published state.
    pub async fn record(&self, event: &PollEvent) {
        let mut status = self.status.write().await;
        match event {
            PollEvent::Updated(report) => {
                status.state = PollState::Idle.as_ref().to_string();
                status.error = None;
                status.entries = report.entries;
                status.latest_block = report.latest.as_ref().map(|e| e.block_number);
                status.lost_entries = report.lost_entries;
                status.updated_at = OffsetDateTime::now_utc().format(&Rfc3339).ok();
                *self.report.write().await = Some(report.clone());
            }
            PollEvent::Unchanged => {
                status.state = PollState::Idle.as_ref().to_string();
                status.error = None;
            }
            PollEvent::Failed { message } => {
                status.state = PollState::Error(String::new()).as_ref().to_string();
                status.error = Some(message.clone());
            }
        }
        debug!(state = %status.state, entries = status.entries, "API state updated");
    }
}

/// Health check endpoint handler.
async fn health() -> &'static str {
    "OK"
}

/// Latest report, or 404 until the first refresh succeeds.
///
/// # Example
/// ```bash
/// curl http://localhost:7786/api/v1/report
/// ```
async fn report(State(state): State<AppState>) -> Response {
    match state.report.read().await.as_ref() {
        Some(report) => Json(report).into_response(),
        None => {
            let error = ErrorResponse {
                error: "No report yet".to_string(),
            };
            (StatusCode::NOT_FOUND, Json(error)).into_response()
        }
    }
}

async fn status(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.read().await.clone())
}

/// Build the v1 API routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/report", get(report))
        .route("/status", get(status))
        .with_state(state)
}
