use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tollgate_db::DbPool;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub open_requests: Option<i64>,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let (database, open_requests) = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "tollgate-server accepting requests".to_string(),
        },
        database,
        open_requests,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> (HealthCheck, Option<i64>) {
    let open = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM approval_request WHERE status IN ('PENDING', 'IN_PROGRESS')",
    )
    .fetch_one(pool)
    .await;

    match open {
        Ok(count) => (
            HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
            Some(count),
        ),
        Err(error) => (
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") },
            None,
        ),
    }
}
