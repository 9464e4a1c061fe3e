//! Booking admission.
//!
//! Every admission for a date runs under that date's in-process lock and
//! inside a write transaction whose first statement bumps the
//! `booking_days` row, so SQLite hands out its write lock before any
//! conflict check reads the calendar. Two requests for the same date are
//! therefore checked and inserted one after the other, even across
//! processes sharing the database file.

use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::auth::Claims;
use crate::models::{Booking, BookingStatus, CreateBookingRequest, Service};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::schedule::{self, BusinessHours, Interval, ScheduleError, Slots};

const MAX_COMMENT_LEN: usize = 500;

const BOOKING_COLUMNS: &str = "id, user_id, service_id, date, start_time, duration_min, status,
    comment, notify, reminder_sent, created_at, updated_at, cancelled_at";

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("service not found or inactive")]
    InvalidService,
    #[error("{0}")]
    InvalidDate(String),
    #[error("{0}")]
    Validation(String),
    #[error("slot is no longer available")]
    SlotUnavailable,
    #[error("booking not found")]
    NotFound,
    #[error("booking belongs to another client")]
    NotOwner,
    #[error("booking cannot move from {} to {}", from.as_str(), to.as_str())]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("bookings {first} and {second} overlap")]
    DoubleBookingDetected { first: i64, second: i64 },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<ScheduleError> for BookingError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::InvalidDate(_) => BookingError::InvalidDate(err.to_string()),
            _ => BookingError::Validation(err.to_string()),
        }
    }
}

/// Who is acting on a booking.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user_id: i64,
    pub is_admin: bool,
}

impl From<&Claims> for Actor {
    fn from(claims: &Claims) -> Self {
        Self {
            user_id: claims.sub,
            is_admin: claims.is_admin(),
        }
    }
}

pub struct BookingDesk {
    db: SqlitePool,
    hours: BusinessHours,
    notifier: Notifier,
    day_locks: DashMap<NaiveDate, Arc<Mutex<()>>>,
}

impl BookingDesk {
    pub fn new(db: SqlitePool, hours: BusinessHours, notifier: Notifier) -> Self {
        Self {
            db,
            hours,
            notifier,
            day_locks: DashMap::new(),
        }
    }

    fn day_lock(&self, date: NaiveDate) -> Arc<Mutex<()>> {
        self.day_locks
            .entry(date)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop locks for past dates that nobody is holding.
    pub fn prune_locks(&self, today: NaiveDate) {
        self.day_locks
            .retain(|date, lock| *date >= today || Arc::strong_count(lock) > 1);
    }

    /// Slot grid for `service_id` on `date`, marked against the day's active
    /// bookings. Recomputed from the database on every call.
    pub async fn available_slots(
        &self,
        service_id: i64,
        date: &str,
        now: NaiveDateTime,
    ) -> Result<(Service, Slots), BookingError> {
        let day = schedule::parse_date(date)?;
        if day < now.date() {
            return Err(BookingError::InvalidDate("date is in the past".into()));
        }

        let mut conn = self.db.acquire().await?;
        let service = active_service(&mut *conn, service_id).await?;
        let busy = active_intervals(&mut *conn, &day.format("%Y-%m-%d").to_string())
            .await?
            .into_iter()
            .map(|(_, iv)| iv)
            .collect();

        let slots = schedule::compute_slots(
            self.hours,
            service.duration_min as u32,
            busy,
            schedule::cutoff_for(day, now),
        );
        Ok((service, slots))
    }

    /// Re-check the requested slot and insert it atomically.
    pub async fn admit(
        &self,
        client_id: i64,
        req: &CreateBookingRequest,
        now: NaiveDateTime,
    ) -> Result<Booking, BookingError> {
        let day = schedule::parse_date(&req.date)?;
        let date = day.format("%Y-%m-%d").to_string();
        let start = schedule::parse_time(&req.time)?;
        let comment = req
            .comment
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        if comment.is_some_and(|c| c.chars().count() > MAX_COMMENT_LEN) {
            return Err(BookingError::Validation(format!(
                "comment must be at most {MAX_COMMENT_LEN} characters"
            )));
        }

        let lock = self.day_lock(day);
        let guard = lock.lock().await;

        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO booking_days (date, admissions) VALUES (?, 1)
             ON CONFLICT(date) DO UPDATE SET admissions = admissions + 1",
        )
        .bind(&date)
        .execute(&mut *tx)
        .await?;

        let service = active_service(&mut *tx, req.service_id).await?;

        if schedule::is_past(day, Some(start), now) {
            return Err(BookingError::InvalidDate(
                "requested time is in the past".into(),
            ));
        }
        if !self.hours.is_on_grid(start) {
            return Err(BookingError::Validation(format!(
                "start time must fall on the {}-minute grid",
                self.hours.step()
            )));
        }
        let requested = Interval::new(start, service.duration_min as u32);
        if !self.hours.contains(&requested) {
            return Err(BookingError::Validation(format!(
                "booking must fit between {} and {}",
                schedule::format_time(self.hours.open()),
                schedule::format_time(self.hours.close())
            )));
        }

        let busy = active_intervals(&mut *tx, &date).await?;
        if let Some((other, _)) = busy.iter().find(|(_, iv)| iv.overlaps(&requested)) {
            tracing::info!(
                date = %date,
                time = %req.time,
                conflicting_booking = other,
                "slot taken"
            );
            return Err(BookingError::SlotUnavailable);
        }

        let booking_id = sqlx::query(
            "INSERT INTO bookings (user_id, service_id, date, start_time, duration_min, comment, notify)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(client_id)
        .bind(service.id)
        .bind(&date)
        .bind(schedule::format_time(start))
        .bind(service.duration_min)
        .bind(comment)
        .bind(req.notify)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let booking = fetch_booking(&mut *tx, booking_id).await?;
        tx.commit().await?;
        drop(guard);

        tracing::info!(
            booking_id,
            client_id,
            service_id = service.id,
            date = %booking.date,
            time = %booking.start_time,
            "booking admitted"
        );

        self.notifier.dispatch(Notification {
            client_id,
            booking_id,
            kind: NotificationKind::Created,
        });
        Ok(booking)
    }

    pub async fn get(&self, booking_id: i64) -> Result<Booking, BookingError> {
        let mut conn = self.db.acquire().await?;
        fetch_booking(&mut *conn, booking_id).await
    }

    /// Cancel on behalf of the owner or an admin. Cancelling twice returns
    /// the booking unchanged.
    pub async fn cancel(&self, booking_id: i64, actor: Actor) -> Result<Booking, BookingError> {
        let booking = self.get(booking_id).await?;
        if !actor.is_admin && booking.user_id != actor.user_id {
            return Err(BookingError::NotOwner);
        }
        self.move_to(booking, BookingStatus::Cancelled).await
    }

    /// Admin status change, restricted to the booking state machine.
    pub async fn set_status(
        &self,
        booking_id: i64,
        status: BookingStatus,
    ) -> Result<Booking, BookingError> {
        let booking = self.get(booking_id).await?;
        self.move_to(booking, status).await
    }

    async fn move_to(&self, booking: Booking, to: BookingStatus) -> Result<Booking, BookingError> {
        if !booking.status.is_active() && to == BookingStatus::Cancelled {
            return Ok(booking);
        }
        if !booking.status.can_transition_to(to) {
            return Err(BookingError::InvalidTransition {
                from: booking.status,
                to,
            });
        }

        let updated = sqlx::query(
            "UPDATE bookings
             SET status = ?,
                 updated_at = datetime('now'),
                 cancelled_at = CASE WHEN ? = 'cancelled' THEN datetime('now') ELSE cancelled_at END
             WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(to.as_str())
        .bind(booking.id)
        .bind(booking.status)
        .execute(&self.db)
        .await?
        .rows_affected();

        let current = self.get(booking.id).await?;
        if updated == 0 {
            // lost a race with another status change
            if current.status == to && to == BookingStatus::Cancelled {
                return Ok(current);
            }
            return Err(BookingError::InvalidTransition {
                from: current.status,
                to,
            });
        }

        tracing::info!(
            booking_id = current.id,
            from = booking.status.as_str(),
            to = to.as_str(),
            "booking status changed"
        );

        if let Some(kind) = NotificationKind::for_status(to) {
            self.notifier.dispatch(Notification {
                client_id: current.user_id,
                booking_id: current.id,
                kind,
            });
        }
        Ok(current)
    }

    /// Overlapping pairs among the date's active bookings.
    pub async fn overlaps_for(&self, date: &str) -> Result<Vec<(i64, i64)>, BookingError> {
        let day = schedule::parse_date(date)?;
        let mut conn = self.db.acquire().await?;
        let active = active_intervals(&mut *conn, &day.format("%Y-%m-%d").to_string()).await?;
        Ok(schedule::find_overlaps(&active))
    }
}

async fn active_service(
    conn: &mut SqliteConnection,
    service_id: i64,
) -> Result<Service, BookingError> {
    sqlx::query_as::<_, Service>(
        "SELECT id, name, category, description, price, duration_min, is_active, created_at
         FROM services WHERE id = ? AND is_active = 1",
    )
    .bind(service_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(BookingError::InvalidService)
}

async fn active_intervals(
    conn: &mut SqliteConnection,
    date: &str,
) -> Result<Vec<(i64, Interval)>, BookingError> {
    let rows: Vec<(i64, String, i64)> = sqlx::query_as(
        "SELECT id, start_time, duration_min FROM bookings
         WHERE date = ? AND status != 'cancelled'",
    )
    .bind(date)
    .fetch_all(&mut *conn)
    .await?;

    let mut intervals = Vec::with_capacity(rows.len());
    for (id, start_time, duration) in rows {
        let start = schedule::parse_time(&start_time).map_err(|e| {
            sqlx::Error::Decode(format!("booking {id} has a bad start time: {e}").into())
        })?;
        intervals.push((id, Interval::new(start, duration as u32)));
    }
    Ok(intervals)
}

async fn fetch_booking(conn: &mut SqliteConnection, booking_id: i64) -> Result<Booking, BookingError> {
    sqlx::query_as::<_, Booking>(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = ?"))
        .bind(booking_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(BookingError::NotFound)
}
