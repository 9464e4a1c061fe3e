use axum::{extract::State, http::HeaderMap, Json};
use sqlx::SqlitePool;
use std::sync::Arc;

use super::{ok, ApiResult};
use crate::auth::{self, AuthError};
use crate::error::AppError;
use crate::models::*;
use crate::AppState;

const USER_COLUMNS: &str = "id, name, surname, phone, email, password_hash, role,
    telegram_id, telegram_username, created_at";

const MIN_PASSWORD_LEN: usize = 6;

pub async fn find_user(db: &SqlitePool, user_id: i64) -> Result<User, AppError> {
    sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
        .bind(user_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".into()))
}

/// Digits with an optional leading `+`; separators are dropped.
fn normalize_phone(raw: &str) -> String {
    raw.trim()
        .chars()
        .enumerate()
        .filter(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '+'))
        .map(|(_, c)| c)
        .collect()
}

fn is_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !s.contains(char::is_whitespace)
        }
        None => false,
    }
}

fn validate_registration(body: &RegisterRequest, phone: &str, email: &str) -> Result<(), AppError> {
    for (field, value) in [("name", &body.name), ("surname", &body.surname)] {
        let len = value.trim().chars().count();
        if !(2..=50).contains(&len) {
            return Err(AppError::Validation(format!(
                "{field} must be between 2 and 50 characters"
            )));
        }
    }
    let digits = phone.trim_start_matches('+').len();
    if !(10..=15).contains(&digits) {
        return Err(AppError::Validation("phone number is invalid".into()));
    }
    if !is_email(email) {
        return Err(AppError::Validation("email is invalid".into()));
    }
    if body.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

async fn insert_user(
    db: &SqlitePool,
    name: &str,
    surname: &str,
    phone: &str,
    email: &str,
    password_hash: &str,
    role: Role,
) -> Result<i64, AppError> {
    let result = sqlx::query(
        "INSERT INTO users (name, surname, phone, email, password_hash, role)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(name)
    .bind(surname)
    .bind(phone)
    .bind(email)
    .bind(password_hash)
    .bind(role)
    .execute(db)
    .await;

    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(AppError::Conflict(
            "a user with this email or phone already exists".into(),
        )),
        Err(e) => Err(e.into()),
    }
}

fn token_response(state: &AppState, user: &User) -> ApiResult<AuthResponse> {
    let token = auth::issue_token(
        user.id,
        &user.email,
        user.role,
        &state.config.jwt_secret,
        state.config.token_ttl_hours,
    )?;
    ok(AuthResponse {
        token,
        user: UserProfile::from(user),
    })
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<AuthResponse> {
    let email = body.email.trim().to_lowercase();
    let phone = normalize_phone(&body.phone);
    validate_registration(&body, &phone, &email)?;

    let taken: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM users WHERE email = ? OR phone = ?")
        .bind(&email)
        .bind(&phone)
        .fetch_one(&state.db)
        .await?;
    if taken {
        return Err(AppError::Conflict(
            "a user with this email or phone already exists".into(),
        ));
    }

    let hash = auth::hash_password(body.password).await?;
    let id = insert_user(
        &state.db,
        body.name.trim(),
        body.surname.trim(),
        &phone,
        &email,
        &hash,
        Role::Client,
    )
    .await?;

    tracing::info!(user_id = id, "client registered");
    let user = find_user(&state.db, id).await?;
    token_response(&state, &user)
}

/// POST /api/auth/login: by phone or email.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<AuthResponse> {
    let ident = body.phone_or_email.trim();
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE email = ? OR phone = ?"
    ))
    .bind(ident.to_lowercase())
    .bind(normalize_phone(ident))
    .fetch_optional(&state.db)
    .await?
    .ok_or(AuthError::BadCredentials)?;

    if !auth::verify_password(body.password, user.password_hash.clone()).await? {
        tracing::warn!(user_id = user.id, "failed login");
        return Err(AuthError::BadCredentials.into());
    }
    token_response(&state, &user)
}

/// POST /api/auth/admin-login
pub async fn admin_login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AdminLoginRequest>,
) -> ApiResult<AuthResponse> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE email = ? AND role = 'admin'"
    ))
    .bind(body.email.trim().to_lowercase())
    .fetch_optional(&state.db)
    .await?
    .ok_or(AuthError::BadCredentials)?;

    if !auth::verify_password(body.password, user.password_hash.clone()).await? {
        tracing::warn!(user_id = user.id, "failed admin login");
        return Err(AuthError::BadCredentials.into());
    }
    tracing::info!(user_id = user.id, "admin signed in");
    token_response(&state, &user)
}

/// GET /api/auth/me
pub async fn me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<UserProfile> {
    let claims = auth::authenticate(&headers, &state.config.jwt_secret)?;
    let user = find_user(&state.db, claims.sub).await?;
    ok(UserProfile::from(&user))
}

/// Create the configured admin account on first start.
pub async fn bootstrap_admin(db: &SqlitePool, email: &str, password: &str) -> anyhow::Result<()> {
    let email = email.trim().to_lowercase();
    let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM users WHERE email = ?")
        .bind(&email)
        .fetch_one(db)
        .await?;
    if exists {
        return Ok(());
    }

    let hash = auth::hash_password(password.to_string())
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    let phone = format!("admin:{email}");
    insert_user(db, "Admin", "Admin", &phone, &email, &hash, Role::Admin)
        .await
        .map_err(|e| anyhow::anyhow!("failed to create admin: {e}"))?;
    tracing::info!(%email, "admin account created");
    Ok(())
}
