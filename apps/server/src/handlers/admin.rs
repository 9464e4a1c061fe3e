use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use super::{booking_detail, ok, ApiResult, BOOKING_DETAIL_SELECT};
use crate::auth;
use crate::booking::{Actor, BookingError};
use crate::error::AppError;
use crate::models::*;
use crate::schedule;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ClientCard {
    pub client: ClientDetails,
    pub bookings: Vec<BookingDetail>,
}

/// GET /api/admin/bookings?date=YYYY-MM-DD&status=pending
pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AdminBookingsQuery>,
) -> ApiResult<Vec<BookingDetail>> {
    auth::require_admin(&headers, &state.config.jwt_secret)?;
    if let Some(date) = &query.date {
        schedule::parse_date(date).map_err(|e| AppError::Validation(e.to_string()))?;
    }
    let status = query.status.map(|s| s.as_str());

    let bookings = sqlx::query_as::<_, BookingDetail>(&format!(
        "{BOOKING_DETAIL_SELECT}
         WHERE (?1 IS NULL OR b.date = ?1) AND (?2 IS NULL OR b.status = ?2)
         ORDER BY b.date ASC, b.start_time ASC"
    ))
    .bind(query.date.as_deref())
    .bind(status)
    .fetch_all(&state.db)
    .await?;
    ok(bookings)
}

/// POST /api/admin/bookings/{id}/status {"status": "confirmed"}
pub async fn update_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<UpdateStatusRequest>,
) -> ApiResult<BookingDetail> {
    auth::require_admin(&headers, &state.config.jwt_secret)?;
    let booking = state.desk.set_status(id, body.status).await?;
    ok(booking_detail(&state.db, booking.id).await?)
}

/// POST /api/admin/bookings/{id}/cancel
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<BookingDetail> {
    let claims = auth::require_admin(&headers, &state.config.jwt_secret)?;
    let booking = state.desk.cancel(id, Actor::from(&claims)).await?;
    ok(booking_detail(&state.db, booking.id).await?)
}

/// GET /api/admin/clients
pub async fn list_clients(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<ClientSummary>> {
    auth::require_admin(&headers, &state.config.jwt_secret)?;

    let clients = sqlx::query_as::<_, ClientSummary>(
        "SELECT u.id, u.name, u.surname, u.phone, u.email, u.telegram_username,
                COUNT(b.id) AS total_bookings,
                MAX(b.date) AS last_booking
         FROM users u
         LEFT JOIN bookings b ON b.user_id = u.id
         WHERE u.role = 'client'
         GROUP BY u.id
         ORDER BY u.surname, u.name",
    )
    .fetch_all(&state.db)
    .await?;
    ok(clients)
}

/// GET /api/admin/clients/{id}
pub async fn client_details(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<ClientCard> {
    auth::require_admin(&headers, &state.config.jwt_secret)?;

    let client = sqlx::query_as::<_, ClientDetails>(
        "SELECT u.id, u.name, u.surname, u.phone, u.email, u.telegram_username, u.created_at,
                COUNT(b.id) AS total_bookings,
                COALESCE(SUM(b.status = 'completed'), 0) AS completed_bookings,
                COALESCE(SUM(b.status = 'pending'), 0) AS pending_bookings,
                MAX(b.date) AS last_booking
         FROM users u
         LEFT JOIN bookings b ON b.user_id = u.id
         WHERE u.id = ? AND u.role = 'client'
         GROUP BY u.id",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::NotFound("client not found".into()))?;

    let bookings = sqlx::query_as::<_, BookingDetail>(&format!(
        "{BOOKING_DETAIL_SELECT} WHERE b.user_id = ? ORDER BY b.date DESC, b.start_time DESC"
    ))
    .bind(id)
    .fetch_all(&state.db)
    .await?;

    ok(ClientCard { client, bookings })
}

/// GET /api/admin/reconcile?date=YYYY-MM-DD: overlapping active bookings.
pub async fn reconcile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ReconcileQuery>,
) -> ApiResult<Vec<OverlapView>> {
    auth::require_admin(&headers, &state.config.jwt_secret)?;

    let overlaps: Vec<OverlapView> = state
        .desk
        .overlaps_for(&query.date)
        .await?
        .into_iter()
        .map(|(first, second)| OverlapView {
            first_booking_id: first,
            second_booking_id: second,
            date: query.date.clone(),
        })
        .collect();

    if let Some(pair) = overlaps.first() {
        let err = BookingError::DoubleBookingDetected {
            first: pair.first_booking_id,
            second: pair.second_booking_id,
        };
        tracing::error!(date = %query.date, count = overlaps.len(), "{}", err);
    }
    ok(overlaps)
}
