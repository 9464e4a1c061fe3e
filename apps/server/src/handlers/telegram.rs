use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use rand::Rng;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;

use super::{ok, ApiResult};
use crate::auth;
use crate::error::AppError;
use crate::models::*;
use crate::AppState;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 6;
const CODE_TTL_MINUTES: i64 = 10;
const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn looks_like_code(text: &str) -> bool {
    text.len() == CODE_LEN && text.bytes().all(|b| CODE_ALPHABET.contains(&b))
}

/// POST /api/telegram/link: replaces any pending code for the caller.
pub async fn create_link(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<LinkCodeResponse> {
    let claims = auth::authenticate(&headers, &state.config.jwt_secret)?;

    sqlx::query("DELETE FROM telegram_links WHERE user_id = ? AND is_verified = 0")
        .bind(claims.sub)
        .execute(&state.db)
        .await?;

    for _ in 0..5 {
        let code = generate_code();
        let inserted = sqlx::query("INSERT INTO telegram_links (user_id, link_code) VALUES (?, ?)")
            .bind(claims.sub)
            .bind(&code)
            .execute(&state.db)
            .await;
        match inserted {
            Ok(_) => {
                tracing::info!(user_id = claims.sub, "telegram link code issued");
                return ok(LinkCodeResponse { link_code: code });
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(AppError::Internal(anyhow::anyhow!(
        "could not allocate a unique link code"
    )))
}

/// GET /api/telegram/check-link/{code}
pub async fn check_link(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> ApiResult<LinkStatusResponse> {
    let claims = auth::authenticate(&headers, &state.config.jwt_secret)?;

    let link = sqlx::query_as::<_, TelegramLink>(
        "SELECT telegram_id, telegram_username, is_verified
         FROM telegram_links WHERE link_code = ? AND user_id = ?",
    )
    .bind(code.trim().to_uppercase())
    .bind(claims.sub)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::NotFound("link code not found".into()))?;

    ok(LinkStatusResponse {
        linked: link.is_verified,
        telegram_id: link.telegram_id,
        telegram_username: link.telegram_username,
    })
}

/// POST /api/telegram/unlink
pub async fn unlink(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<bool> {
    let claims = auth::authenticate(&headers, &state.config.jwt_secret)?;

    let mut tx = state.db.begin().await?;
    sqlx::query("UPDATE users SET telegram_id = NULL, telegram_username = NULL WHERE id = ?")
        .bind(claims.sub)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM telegram_links WHERE user_id = ?")
        .bind(claims.sub)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!(user_id = claims.sub, "telegram unlinked");
    ok(true)
}

/// Attach the chat to the account that issued `code`, if the code is still
/// fresh and unused. Returns the linked user id.
pub async fn redeem_code(
    db: &SqlitePool,
    code: &str,
    telegram_id: i64,
    telegram_username: Option<&str>,
) -> Result<Option<i64>, sqlx::Error> {
    let mut tx = db.begin().await?;

    let user_id: Option<i64> = sqlx::query_scalar(&format!(
        "UPDATE telegram_links
         SET is_verified = 1, telegram_id = ?, telegram_username = ?, verified_at = datetime('now')
         WHERE link_code = ? AND is_verified = 0
           AND created_at >= datetime('now', '-{CODE_TTL_MINUTES} minutes')
         RETURNING user_id"
    ))
    .bind(telegram_id)
    .bind(telegram_username)
    .bind(code)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(user_id) = user_id else {
        return Ok(None);
    };

    sqlx::query("UPDATE users SET telegram_id = ?, telegram_username = ? WHERE id = ?")
        .bind(telegram_id)
        .bind(telegram_username)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Some(user_id))
}

// ── Telegram update payload (only the fields we read) ──

#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    pub from: Option<TelegramFrom>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramFrom {
    pub username: Option<String>,
    pub first_name: Option<String>,
}

/// POST /api/telegram/webhook: redeems link codes sent to the bot.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(update): Json<TelegramUpdate>,
) -> ApiResult<bool> {
    let secret = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if state.config.webhook_secret.is_empty() || secret != Some(state.config.webhook_secret.as_str()) {
        return Err(AppError::Forbidden("invalid webhook secret".into()));
    }

    let Some(message) = update.message else {
        return ok(true);
    };
    let Some(text) = message.text.as_deref().map(str::trim) else {
        return ok(true);
    };
    if text.starts_with('/') {
        return ok(true);
    }

    let chat_id = message.chat.id;
    let code = text.to_uppercase();
    let reply = if looks_like_code(&code) {
        let username = message
            .from
            .as_ref()
            .and_then(|f| f.username.clone().or_else(|| f.first_name.clone()));
        match redeem_code(&state.db, &code, chat_id, username.as_deref()).await? {
            Some(user_id) => {
                tracing::info!(user_id, chat_id, "telegram account linked");
                "Account linked. You will now receive booking notifications here."
            }
            None => "This code is invalid, expired or already used. Request a new one in your profile.",
        }
    } else {
        "Send the 6-character code from your profile to link this chat."
    };

    let messenger = state.notifier.messenger().clone();
    tokio::spawn(async move {
        if let Err(e) = messenger.send(chat_id, reply).await {
            tracing::warn!(chat_id, "webhook reply failed: {:#}", e);
        }
    });
    ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::tests::insert_user;
    use crate::db::memory_pool;

    #[test]
    fn test_generated_codes_are_well_formed() {
        for _ in 0..100 {
            let code = generate_code();
            assert!(looks_like_code(&code), "bad code {code}");
        }
        assert!(!looks_like_code("abc123"));
        assert!(!looks_like_code("ABC12"));
    }

    #[tokio::test]
    async fn test_redeem_links_account_once() {
        let pool = memory_pool().await;
        let user = insert_user(&pool, "Anna", "+70000000001", "anna@example.com").await;
        sqlx::query("INSERT INTO telegram_links (user_id, link_code) VALUES (?, 'K7Q2ZP')")
            .bind(user)
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(
            redeem_code(&pool, "K7Q2ZP", 555, Some("anna")).await.unwrap(),
            Some(user)
        );
        assert_eq!(redeem_code(&pool, "K7Q2ZP", 556, None).await.unwrap(), None);

        let linked: Option<i64> = sqlx::query_scalar("SELECT telegram_id FROM users WHERE id = ?")
            .bind(user)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(linked, Some(555));
    }

    #[tokio::test]
    async fn test_expired_code_is_refused() {
        let pool = memory_pool().await;
        let user = insert_user(&pool, "Anna", "+70000000001", "anna@example.com").await;
        sqlx::query(
            "INSERT INTO telegram_links (user_id, link_code, created_at)
             VALUES (?, 'OLD123', datetime('now', '-11 minutes'))",
        )
        .bind(user)
        .execute(&pool)
        .await
        .unwrap();

        assert_eq!(redeem_code(&pool, "OLD123", 555, None).await.unwrap(), None);
    }
}
