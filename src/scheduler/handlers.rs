use super::progress::ProgressBoard;
use super::types::Progress;

use axum::{Extension, Json, Router, http::StatusCode, routing::get};
use std::sync::Arc;

pub async fn handle_get_progress(
    Extension(board): Extension<Arc<ProgressBoard>>,
) -> (StatusCode, Json<Progress>) {
    let progress = board.snapshot();
    tracing::debug!(
        "Progress requested: {}/{} completed for {}",
        progress.completed,
        progress.total,
        progress.command
    );
    (StatusCode::OK, Json(progress))
}

pub fn progress_router(board: Arc<ProgressBoard>) -> Router {
    Router::new()
        .route("/progress", get(handle_get_progress))
        .layer(Extension(board))
}
