//! Dashboard HTTP API.
//!
//! Presentation layer for the reconciliation loop: a drain task consumes
//! row-change events into a table snapshot, and handlers read that
//! snapshot. Handlers never reach into the loop's own state; the change
//! channel is the only bridge. Manual pin/unpin endpoints poke the
//! reconciliation trigger after a successful call so the table catches up
//! without waiting for the next timer tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::herd::{RowChange, ThumbnailCache, Trigger};
use crate::pup::{ContentId, PinTarget};

/// Budget for a manually requested pin/unpin call.
const MANUAL_PIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One dashboard row: a hash, its filename, and one pin flag per backend.
#[derive(Debug, Clone, Serialize)]
pub struct PinRow {
    pub hash: ContentId,
    pub filename: String,
    pub pinned: Vec<bool>,
}

/// Ordered row table built from change events. Rows keep their arrival
/// order, matching how the original dashboard grew downward.
#[derive(Default)]
pub struct PinTable {
    order: Vec<ContentId>,
    rows: HashMap<ContentId, PinRow>,
}

impl PinTable {
    /// Apply one change event, creating the row on first sight.
    pub fn apply(&mut self, change: RowChange, columns: usize) {
        if !self.rows.contains_key(&change.hash) {
            self.order.push(change.hash.clone());
            self.rows.insert(
                change.hash.clone(),
                PinRow {
                    hash: change.hash.clone(),
                    filename: change.filename.clone(),
                    pinned: vec![false; columns],
                },
            );
        }
        let row = self.rows.get_mut(&change.hash).expect("row just ensured");
        if change.column < row.pinned.len() {
            row.pinned[change.column] = change.pinned;
        }
    }

    pub fn snapshot(&self) -> Vec<PinRow> {
        self.order
            .iter()
            .filter_map(|hash| self.rows.get(hash).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Shared state for API handlers.
pub struct ApiState {
    /// Configured backends, in column order.
    pub targets: Vec<PinTarget>,

    /// Presentation table, mutated only by the drain task.
    pub table: RwLock<PinTable>,

    /// Thumbnail bytes by hash, filled by the reconciliation loop.
    pub thumbs: ThumbnailCache,

    /// Poke the reconciliation loop for an immediate cycle.
    pub trigger: Trigger,
}

impl ApiState {
    pub fn new(targets: Vec<PinTarget>, thumbs: ThumbnailCache, trigger: Trigger) -> Self {
        Self {
            targets,
            table: RwLock::new(PinTable::default()),
            thumbs,
            trigger,
        }
    }
}

/// Consume row-change events into the presentation table. This task is the
/// sole writer of visible dashboard state.
pub fn spawn_drain(state: Arc<ApiState>, mut changes: mpsc::Receiver<RowChange>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let columns = state.targets.len();
        while let Some(change) = changes.recv().await {
            state.table.write().await.apply(change, columns);
        }
        tracing::info!("presentation drain task shutting down (change channel closed)");
    })
}

/// Status response.
#[derive(Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub backends: Vec<String>,
    pub rows: usize,
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let rows = state.table.read().await.len();
    Json(StatusResponse {
        status: "ok".to_string(),
        backends: state.targets.iter().map(|t| t.name.clone()).collect(),
        rows,
    })
}

async fn list_pins(State(state): State<Arc<ApiState>>) -> Json<Vec<PinRow>> {
    Json(state.table.read().await.snapshot())
}

/// Serve a cached thumbnail, or 404 while it has not been fetched yet.
async fn thumbnail(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<bytes::Bytes, StatusCode> {
    let hash = ContentId::new(id);
    state
        .thumbs
        .read()
        .await
        .get(&hash)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)
}

fn target_for<'a>(
    state: &'a ApiState,
    index: usize,
) -> Result<&'a PinTarget, (StatusCode, String)> {
    state.targets.get(index).ok_or((
        StatusCode::NOT_FOUND,
        format!("no backend at column {index}"),
    ))
}

async fn pin_on_target(
    State(state): State<Arc<ApiState>>,
    Path((hash, index)): Path<(String, usize)>,
) -> Result<StatusCode, (StatusCode, String)> {
    let target = target_for(&state, index)?;
    let hash = ContentId::new(hash);

    match tokio::time::timeout(MANUAL_PIN_TIMEOUT, target.backend.pin(&hash)).await {
        Ok(Ok(())) => {
            tracing::info!(%hash, backend = %target.name, "manual pin accepted");
            state.trigger.fire();
            Ok(StatusCode::NO_CONTENT)
        }
        Ok(Err(error)) => {
            tracing::warn!(%hash, backend = %target.name, %error, "manual pin failed");
            Err((StatusCode::BAD_GATEWAY, error.to_string()))
        }
        Err(_) => Err((
            StatusCode::GATEWAY_TIMEOUT,
            format!("{}: pin timed out", target.name),
        )),
    }
}

async fn unpin_on_target(
    State(state): State<Arc<ApiState>>,
    Path((hash, index)): Path<(String, usize)>,
) -> Result<StatusCode, (StatusCode, String)> {
    let target = target_for(&state, index)?;
    let hash = ContentId::new(hash);

    match tokio::time::timeout(MANUAL_PIN_TIMEOUT, target.backend.unpin(&hash)).await {
        Ok(Ok(())) => {
            tracing::info!(%hash, backend = %target.name, "manual unpin accepted");
            state.trigger.fire();
            Ok(StatusCode::NO_CONTENT)
        }
        Ok(Err(error)) => {
            tracing::warn!(%hash, backend = %target.name, %error, "manual unpin failed");
            Err((StatusCode::BAD_GATEWAY, error.to_string()))
        }
        Err(_) => Err((
            StatusCode::GATEWAY_TIMEOUT,
            format!("{}: unpin timed out", target.name),
        )),
    }
}

/// Build the API router with all routes.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/status", get(status))
        .route("/api/v1/pins", get(list_pins))
        .route(
            "/api/v1/pins/:hash/targets/:index",
            post(pin_on_target).delete(unpin_on_target),
        )
        .route("/hash/:id", get(thumbnail))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http().on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    let status = response.status();
                    if !status.is_success() {
                        tracing::warn!(
                            status = %status,
                            latency_ms = latency.as_millis(),
                            "request failed"
                        );
                    }
                },
            ),
        )
        .with_state(state)
}

/// Start the API server.
pub async fn serve(state: Arc<ApiState>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    tracing::info!("dashboard API listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(hash: &str, column: usize, pinned: bool) -> RowChange {
        RowChange {
            hash: ContentId::from(hash),
            filename: format!("{hash}.jpg"),
            column,
            pinned,
        }
    }

    #[test]
    fn apply_creates_row_with_all_columns_false_then_sets_one() {
        let mut table = PinTable::default();
        table.apply(change("QmX", 1, true), 3);

        let rows = table.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pinned, vec![false, true, false]);
        assert_eq!(rows[0].filename, "QmX.jpg");
    }

    #[test]
    fn apply_toggles_existing_rows_in_place() {
        let mut table = PinTable::default();
        table.apply(change("QmX", 0, true), 2);
        table.apply(change("QmX", 0, false), 2);
        table.apply(change("QmX", 1, true), 2);

        let rows = table.snapshot();
        assert_eq!(rows[0].pinned, vec![false, true]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn snapshot_preserves_arrival_order() {
        let mut table = PinTable::default();
        table.apply(change("QmC", 0, true), 1);
        table.apply(change("QmA", 0, true), 1);
        table.apply(change("QmB", 0, true), 1);

        let hashes: Vec<String> = table
            .snapshot()
            .iter()
            .map(|r| r.hash.as_str().to_string())
            .collect();
        assert_eq!(hashes, vec!["QmC", "QmA", "QmB"]);
    }

    #[test]
    fn out_of_range_column_is_ignored() {
        let mut table = PinTable::default();
        table.apply(change("QmX", 5, true), 2);
        assert_eq!(table.snapshot()[0].pinned, vec![false, false]);
    }
}
