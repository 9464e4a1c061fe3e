use axum::{extract::State, Json};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::schedule::format_time;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub db_ok: bool,
    pub telegram: bool,
    /// Salon wall clock, `YYYY-MM-DD HH:MM`.
    pub local_time: String,
    pub opening_hours: String,
}

async fn check_db(db: &SqlitePool) -> bool {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM _migrations")
        .fetch_one(db)
        .await
    {
        Ok(applied) => applied > 0,
        Err(e) => {
            tracing::warn!("health check failed: {}", e);
            false
        }
    }
}

/// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db_ok = check_db(&state.db).await;
    let hours = state.config.hours;

    Json(HealthResponse {
        status: if db_ok { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        db_ok,
        telegram: !state.config.bot_token.is_empty(),
        local_time: state.config.local_now().format("%Y-%m-%d %H:%M").to_string(),
        opening_hours: format!("{}-{}", format_time(hours.open()), format_time(hours.close())),
    })
}
