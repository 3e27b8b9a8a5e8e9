//! Service health endpoints used for liveness/readiness checks and tests.

use crate::error::ApiError;
use rocket::serde::json::Json;
use rocket::{State, get};
use rocket_db_pools::sqlx::{self, PgPool};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

/// Basic response payload describing API health.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    /// `ok` when the check passed.
    pub status: String,
}

/// Liveness check; never touches the database.
#[openapi(tag = "Health")]
#[get("/health")]
pub fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check: the lead database answers a trivial query.
#[openapi(tag = "Health")]
#[get("/health/ready")]
pub async fn readiness_check(pool: &State<PgPool>) -> Result<Json<HealthResponse>, ApiError> {
    sqlx::query("SELECT 1").execute(pool.inner()).await?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
    }))
}
