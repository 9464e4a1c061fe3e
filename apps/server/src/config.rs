use anyhow::Context;
use chrono::{FixedOffset, NaiveDateTime, Utc};
use std::env;

use crate::schedule::BusinessHours;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    /// Empty disables Telegram delivery; notifications are then only logged.
    pub bot_token: String,
    pub admin_chat_id: Option<i64>,
    pub webhook_secret: String,
    pub webapp_url: Option<String>,
    pub hours: BusinessHours,
    pub tz: FixedOffset,
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        anyhow::ensure!(jwt_secret.len() >= 16, "JWT_SECRET must be at least 16 bytes");

        let step: u32 = parse_var("SLOT_STEP_MIN", 30)?;
        let hours = BusinessHours::parse(
            &env::var("BUSINESS_OPEN").unwrap_or_else(|_| "09:00".into()),
            &env::var("BUSINESS_CLOSE").unwrap_or_else(|_| "18:00".into()),
            step,
        )
        .context("invalid business hours")?;

        let admin_chat_id = match env::var("ADMIN_CHAT_ID") {
            Ok(v) if !v.is_empty() => Some(v.parse().context("ADMIN_CHAT_ID must be a number")?),
            _ => None,
        };

        let tz_offset_hours: i32 = parse_var("TZ_OFFSET_HOURS", 3)?;
        let tz = FixedOffset::east_opt(tz_offset_hours * 3600)
            .context("TZ_OFFSET_HOURS out of range")?;

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parse_var("PORT", 5000)?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:cosmetology.db?mode=rwc".into()),
            jwt_secret,
            token_ttl_hours: parse_var("TOKEN_TTL_HOURS", 24)?,
            bot_token: env::var("BOT_TOKEN").unwrap_or_default(),
            admin_chat_id,
            webhook_secret: env::var("TELEGRAM_WEBHOOK_SECRET").unwrap_or_default(),
            webapp_url: env::var("WEBAPP_URL").ok().filter(|v| !v.is_empty()),
            hours,
            tz,
            admin_email: env::var("ADMIN_EMAIL").ok().filter(|v| !v.is_empty()),
            admin_password: env::var("ADMIN_PASSWORD").ok().filter(|v| !v.is_empty()),
        })
    }

    /// Wall-clock time at the salon.
    pub fn local_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.tz).naive_local()
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} has an invalid value: {v}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
pub fn test_config() -> AppConfig {
    AppConfig {
        host: "127.0.0.1".into(),
        port: 0,
        database_url: "sqlite::memory:".into(),
        jwt_secret: "test-secret-test-secret".into(),
        token_ttl_hours: 24,
        bot_token: String::new(),
        admin_chat_id: Some(999),
        webhook_secret: "hook-secret".into(),
        webapp_url: None,
        hours: BusinessHours::parse("09:00", "18:00", 30).unwrap(),
        tz: FixedOffset::east_opt(3 * 3600).unwrap(),
        admin_email: None,
        admin_password: None,
    }
}
