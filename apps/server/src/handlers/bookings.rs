use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

use super::{booking_detail, ok, ApiResult, BOOKING_DETAIL_SELECT};
use crate::auth;
use crate::booking::Actor;
use crate::error::AppError;
use crate::models::*;
use crate::schedule::format_time;
use crate::AppState;

/// GET /api/availability?service_id=1&date=2026-03-11
pub async fn availability(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AvailabilityQuery>,
) -> ApiResult<AvailabilityResponse> {
    let (service, slots) = state
        .desk
        .available_slots(query.service_id, &query.date, state.config.local_now())
        .await?;

    let slots = slots
        .map(|slot| SlotView {
            start_time: format_time(slot.start),
            end_time: format_time(slot.end),
            available: slot.available,
        })
        .collect();

    ok(AvailabilityResponse {
        service_id: service.id,
        date: query.date,
        duration_min: service.duration_min,
        slots,
    })
}

/// POST /api/bookings: admitted as `pending`, or 409 when the slot is gone.
pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBookingRequest>,
) -> ApiResult<BookingDetail> {
    let claims = auth::authenticate(&headers, &state.config.jwt_secret)?;
    let booking = state
        .desk
        .admit(claims.sub, &body, state.config.local_now())
        .await?;
    ok(booking_detail(&state.db, booking.id).await?)
}

/// GET /api/bookings/my
pub async fn my_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<BookingDetail>> {
    let claims = auth::authenticate(&headers, &state.config.jwt_secret)?;

    let bookings = sqlx::query_as::<_, BookingDetail>(&format!(
        "{BOOKING_DETAIL_SELECT} WHERE b.user_id = ? ORDER BY b.date DESC, b.start_time DESC"
    ))
    .bind(claims.sub)
    .fetch_all(&state.db)
    .await?;
    ok(bookings)
}

/// GET /api/bookings/{id}: owner or admin.
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<BookingDetail> {
    let claims = auth::authenticate(&headers, &state.config.jwt_secret)?;
    let detail = booking_detail(&state.db, id).await?;
    if detail.user_id != claims.sub && !claims.is_admin() {
        return Err(AppError::Forbidden("booking belongs to another client".into()));
    }
    ok(detail)
}

/// POST /api/bookings/{id}/cancel
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<BookingDetail> {
    let claims = auth::authenticate(&headers, &state.config.jwt_secret)?;
    let booking = state.desk.cancel(id, Actor::from(&claims)).await?;
    ok(booking_detail(&state.db, booking.id).await?)
}
