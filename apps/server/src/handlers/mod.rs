pub mod admin;
pub mod auth;
pub mod bookings;
pub mod health;
pub mod services;
pub mod telegram;

use axum::Json;
use sqlx::SqlitePool;

use crate::error::AppError;
use crate::models::{ApiResponse, BookingDetail};

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;

pub fn ok<T: serde::Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

/// Booking joined with service and client, shared by client and admin listings.
pub const BOOKING_DETAIL_SELECT: &str = "SELECT b.id, b.user_id, b.service_id,
        s.name AS service_name, s.price AS service_price,
        b.date, b.start_time, b.duration_min, b.status, b.comment, b.notify, b.created_at,
        u.name AS client_name, u.surname AS client_surname, u.phone AS client_phone
    FROM bookings b
    JOIN services s ON s.id = b.service_id
    JOIN users u ON u.id = b.user_id";

pub async fn booking_detail(db: &SqlitePool, booking_id: i64) -> Result<BookingDetail, AppError> {
    sqlx::query_as::<_, BookingDetail>(&format!("{BOOKING_DETAIL_SELECT} WHERE b.id = ?"))
        .bind(booking_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::NotFound("booking not found".into()))
}
