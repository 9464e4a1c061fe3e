use serde::{Deserialize, Serialize};

// ── Database models ──

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub description: String,
    pub price: i64,
    pub duration_min: i64,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Client,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub surname: String,
    pub phone: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub telegram_id: Option<i64>,
    pub telegram_username: Option<String>,
    pub created_at: String,
}

/// Booking lifecycle. `Cancelled` and `Completed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    pub fn is_active(&self) -> bool {
        *self != BookingStatus::Cancelled
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Booking {
    pub id: i64,
    pub user_id: i64,
    pub service_id: i64,
    pub date: String,
    pub start_time: String,
    pub duration_min: i64,
    pub status: BookingStatus,
    pub comment: Option<String>,
    pub notify: bool,
    pub reminder_sent: bool,
    pub created_at: String,
    pub updated_at: String,
    pub cancelled_at: Option<String>,
}

/// Booking joined with its service and client, as shown in listings.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BookingDetail {
    pub id: i64,
    pub user_id: i64,
    pub service_id: i64,
    pub service_name: String,
    pub service_price: i64,
    pub date: String,
    pub start_time: String,
    pub duration_min: i64,
    pub status: BookingStatus,
    pub comment: Option<String>,
    pub notify: bool,
    pub created_at: String,
    pub client_name: String,
    pub client_surname: String,
    pub client_phone: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ClientSummary {
    pub id: i64,
    pub name: String,
    pub surname: String,
    pub phone: String,
    pub email: String,
    pub telegram_username: Option<String>,
    pub total_bookings: i64,
    pub last_booking: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ClientDetails {
    pub id: i64,
    pub name: String,
    pub surname: String,
    pub phone: String,
    pub email: String,
    pub telegram_username: Option<String>,
    pub created_at: String,
    pub total_bookings: i64,
    pub completed_bookings: i64,
    pub pending_bookings: i64,
    pub last_booking: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TelegramLink {
    pub telegram_id: Option<i64>,
    pub telegram_username: Option<String>,
    pub is_verified: bool,
}

// ── API request/response types ──

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub surname: String,
    pub phone: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub phone_or_email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct AdminLoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub id: i64,
    pub name: String,
    pub surname: String,
    pub email: String,
    pub phone: String,
    pub role: Role,
    pub telegram_connected: bool,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            surname: user.surname.clone(),
            email: user.email.clone(),
            phone: user.phone.clone(),
            role: user.role,
            telegram_connected: user.telegram_id.is_some(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub service_id: i64,
    pub date: String,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub service_id: i64,
    pub date: String,
    pub duration_min: i64,
    pub slots: Vec<SlotView>,
}

#[derive(Debug, Serialize)]
pub struct SlotView {
    pub start_time: String,
    pub end_time: String,
    pub available: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub service_id: i64,
    pub date: String,
    pub time: String,
    pub comment: Option<String>,
    #[serde(default = "default_notify")]
    pub notify: bool,
}

fn default_notify() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AdminBookingsQuery {
    pub date: Option<String>,
    pub status: Option<BookingStatus>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: BookingStatus,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileQuery {
    pub date: String,
}

#[derive(Debug, Serialize)]
pub struct OverlapView {
    pub first_booking_id: i64,
    pub second_booking_id: i64,
    pub date: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub category: String,
    pub description: Option<String>,
    pub price: i64,
    pub duration_min: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServiceRequest {
    pub name: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub price: Option<i64>,
    pub duration_min: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct LinkCodeResponse {
    pub link_code: String,
}

#[derive(Debug, Serialize)]
pub struct LinkStatusResponse {
    pub linked: bool,
    pub telegram_id: Option<i64>,
    pub telegram_username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            retryable: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
            retryable: None,
        }
    }

    pub fn retryable_error(msg: impl Into<String>) -> Self {
        Self {
            retryable: Some(true),
            ..Self::error(msg)
        }
    }
}
