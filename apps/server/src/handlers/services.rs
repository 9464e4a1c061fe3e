use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use sqlx::SqlitePool;
use std::sync::Arc;

use super::{ok, ApiResult};
use crate::auth;
use crate::error::AppError;
use crate::models::*;
use crate::AppState;

const SERVICE_COLUMNS: &str =
    "id, name, category, description, price, duration_min, is_active, created_at";

async fn find_service(db: &SqlitePool, id: i64) -> Result<Service, AppError> {
    sqlx::query_as::<_, Service>(&format!("SELECT {SERVICE_COLUMNS} FROM services WHERE id = ?"))
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::NotFound("service not found".into()))
}

fn validate_fields(
    name: Option<&str>,
    category: Option<&str>,
    price: Option<i64>,
    duration_min: Option<i64>,
) -> Result<(), AppError> {
    if name.is_some_and(|n| n.trim().is_empty()) {
        return Err(AppError::Validation("name must not be empty".into()));
    }
    if category.is_some_and(|c| c.trim().is_empty()) {
        return Err(AppError::Validation("category must not be empty".into()));
    }
    if price.is_some_and(|p| p < 0) {
        return Err(AppError::Validation("price must not be negative".into()));
    }
    if duration_min.is_some_and(|d| !(1..=24 * 60).contains(&d)) {
        return Err(AppError::Validation(
            "duration must be between 1 and 1440 minutes".into(),
        ));
    }
    Ok(())
}

/// GET /api/services: active services only
pub async fn list_services(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Service>> {
    let services = sqlx::query_as::<_, Service>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services WHERE is_active = 1 ORDER BY category, name"
    ))
    .fetch_all(&state.db)
    .await?;
    ok(services)
}

/// GET /api/admin/services: including inactive ones
pub async fn list_all_services(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<Service>> {
    auth::require_admin(&headers, &state.config.jwt_secret)?;

    let services = sqlx::query_as::<_, Service>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services ORDER BY is_active DESC, category, name"
    ))
    .fetch_all(&state.db)
    .await?;
    ok(services)
}

/// POST /api/admin/services
pub async fn create_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateServiceRequest>,
) -> ApiResult<Service> {
    auth::require_admin(&headers, &state.config.jwt_secret)?;
    validate_fields(
        Some(&body.name),
        Some(&body.category),
        Some(body.price),
        Some(body.duration_min),
    )?;

    let id = sqlx::query(
        "INSERT INTO services (name, category, description, price, duration_min)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(body.name.trim())
    .bind(body.category.trim())
    .bind(body.description.as_deref().unwrap_or(""))
    .bind(body.price)
    .bind(body.duration_min)
    .execute(&state.db)
    .await?
    .last_insert_rowid();

    tracing::info!(service_id = id, "service created");
    ok(find_service(&state.db, id).await?)
}

/// PUT /api/admin/services/{id}: partial update. Existing bookings keep
/// the duration they were admitted with.
pub async fn update_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<UpdateServiceRequest>,
) -> ApiResult<Service> {
    auth::require_admin(&headers, &state.config.jwt_secret)?;
    validate_fields(
        body.name.as_deref(),
        body.category.as_deref(),
        body.price,
        body.duration_min,
    )?;

    let updated = sqlx::query(
        "UPDATE services SET
            name = COALESCE(?, name),
            category = COALESCE(?, category),
            description = COALESCE(?, description),
            price = COALESCE(?, price),
            duration_min = COALESCE(?, duration_min),
            is_active = COALESCE(?, is_active)
         WHERE id = ?",
    )
    .bind(body.name.as_deref().map(str::trim))
    .bind(body.category.as_deref().map(str::trim))
    .bind(body.description.as_deref())
    .bind(body.price)
    .bind(body.duration_min)
    .bind(body.is_active)
    .bind(id)
    .execute(&state.db)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(AppError::NotFound("service not found".into()));
    }
    tracing::info!(service_id = id, "service updated");
    ok(find_service(&state.db, id).await?)
}

/// POST /api/admin/services/{id}/toggle
pub async fn toggle_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Service> {
    auth::require_admin(&headers, &state.config.jwt_secret)?;

    let updated = sqlx::query("UPDATE services SET is_active = NOT is_active WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(AppError::NotFound("service not found".into()));
    }

    let service = find_service(&state.db, id).await?;
    tracing::info!(service_id = id, active = service.is_active, "service toggled");
    ok(service)
}

/// DELETE /api/admin/services/{id}: only services no booking refers to.
pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<i64> {
    auth::require_admin(&headers, &state.config.jwt_secret)?;
    find_service(&state.db, id).await?;

    let referenced: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM bookings WHERE service_id = ?")
            .bind(id)
            .fetch_one(&state.db)
            .await?;
    if referenced {
        return Err(AppError::Conflict(
            "service has bookings, deactivate it instead".into(),
        ));
    }

    sqlx::query("DELETE FROM services WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    tracing::info!(service_id = id, "service deleted");
    ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_rules() {
        assert!(validate_fields(Some("Peeling"), Some("face"), Some(0), Some(60)).is_ok());
        assert!(validate_fields(None, None, None, None).is_ok());
        assert!(validate_fields(Some("  "), None, None, None).is_err());
        assert!(validate_fields(None, Some(""), None, None).is_err());
        assert!(validate_fields(None, None, Some(-1), None).is_err());
        assert!(validate_fields(None, None, None, Some(0)).is_err());
        assert!(validate_fields(None, None, None, Some(2000)).is_err());
    }
}
