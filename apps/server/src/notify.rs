//! Outbound messages to clients and the admin chat.
//!
//! Delivery is always best effort: a failed send is logged and never
//! reaches the request that triggered it.

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::models::BookingStatus;

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> anyhow::Result<()>;
}

/// Telegram Bot API `sendMessage`.
pub struct TelegramMessenger {
    bot_token: String,
    http: reqwest::Client,
}

impl TelegramMessenger {
    pub fn new(bot_token: String) -> Self {
        Self {
            bot_token,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        self.http
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Used when no bot token is configured.
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    async fn send(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        tracing::info!(chat_id, "telegram disabled, message not sent: {}", text);
        Ok(())
    }
}

pub fn messenger_from_token(bot_token: &str) -> Arc<dyn Messenger> {
    if bot_token.is_empty() {
        Arc::new(LogMessenger)
    } else {
        Arc::new(TelegramMessenger::new(bot_token.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Created,
    Confirmed,
    Cancelled,
    Completed,
    Reminder,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Created => "created",
            NotificationKind::Confirmed => "confirmed",
            NotificationKind::Cancelled => "cancelled",
            NotificationKind::Completed => "completed",
            NotificationKind::Reminder => "reminder",
        }
    }

    /// Notification sent after an admin moves a booking into `status`.
    pub fn for_status(status: BookingStatus) -> Option<Self> {
        match status {
            BookingStatus::Confirmed => Some(NotificationKind::Confirmed),
            BookingStatus::Cancelled => Some(NotificationKind::Cancelled),
            BookingStatus::Completed => Some(NotificationKind::Completed),
            BookingStatus::Pending => None,
        }
    }

    fn alerts_admin(&self) -> bool {
        matches!(self, NotificationKind::Created | NotificationKind::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub client_id: i64,
    pub booking_id: i64,
    pub kind: NotificationKind,
}

#[derive(Debug, sqlx::FromRow)]
struct NoticeRow {
    id: i64,
    user_id: i64,
    date: String,
    start_time: String,
    duration_min: i64,
    notify: bool,
    service_name: String,
    service_price: i64,
    client_name: String,
    client_surname: String,
    client_phone: String,
    telegram_id: Option<i64>,
}

const NOTICE_SELECT: &str = "SELECT b.id, b.user_id, b.date, b.start_time, b.duration_min, b.notify,
        s.name AS service_name, s.price AS service_price,
        u.name AS client_name, u.surname AS client_surname, u.phone AS client_phone, u.telegram_id
    FROM bookings b
    JOIN services s ON s.id = b.service_id
    JOIN users u ON u.id = b.user_id";

fn client_text(kind: NotificationKind, row: &NoticeRow) -> String {
    let headline = match kind {
        NotificationKind::Created => "Booking received, awaiting confirmation",
        NotificationKind::Confirmed => "Booking confirmed",
        NotificationKind::Cancelled => "Booking cancelled",
        NotificationKind::Completed => "Thank you for your visit",
        NotificationKind::Reminder => "Reminder: your appointment is within 24 hours",
    };
    format!(
        "{headline}\n\n{}\n{} at {}\n{} min, {} RUB\nBooking #{}",
        row.service_name, row.date, row.start_time, row.duration_min, row.service_price, row.id
    )
}

fn admin_text(kind: NotificationKind, row: &NoticeRow) -> String {
    let headline = match kind {
        NotificationKind::Cancelled => "Booking cancelled",
        _ => "New booking",
    };
    format!(
        "{headline} #{}\n{} {} ({})\n{}\n{} at {}, {} min",
        row.id,
        row.client_name,
        row.client_surname,
        row.client_phone,
        row.service_name,
        row.date,
        row.start_time,
        row.duration_min
    )
}

/// Hands booking events to the messenger without blocking the caller.
#[derive(Clone)]
pub struct Notifier {
    db: SqlitePool,
    messenger: Arc<dyn Messenger>,
    admin_chat_id: Option<i64>,
}

impl Notifier {
    pub fn new(db: SqlitePool, messenger: Arc<dyn Messenger>, admin_chat_id: Option<i64>) -> Self {
        Self {
            db,
            messenger,
            admin_chat_id,
        }
    }

    pub fn messenger(&self) -> &Arc<dyn Messenger> {
        &self.messenger
    }

    /// Fire and forget. Delivery runs on its own task.
    pub fn dispatch(&self, notification: Notification) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.deliver(notification).await {
                tracing::warn!(
                    booking_id = notification.booking_id,
                    kind = notification.kind.as_str(),
                    "notification failed: {:#}",
                    e
                );
            }
        });
    }

    /// Send one notification now. Clients without a linked chat, or who
    /// opted out, are skipped silently.
    pub async fn deliver(&self, notification: Notification) -> anyhow::Result<()> {
        let row = sqlx::query_as::<_, NoticeRow>(&format!("{NOTICE_SELECT} WHERE b.id = ?"))
            .bind(notification.booking_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| anyhow::anyhow!("booking {} not found", notification.booking_id))?;

        anyhow::ensure!(
            row.user_id == notification.client_id,
            "booking {} does not belong to client {}",
            row.id,
            notification.client_id
        );

        if notification.kind.alerts_admin() {
            if let Some(chat_id) = self.admin_chat_id {
                self.messenger
                    .send(chat_id, &admin_text(notification.kind, &row))
                    .await?;
            }
        }

        match row.telegram_id {
            Some(chat_id) if row.notify => {
                self.messenger
                    .send(chat_id, &client_text(notification.kind, &row))
                    .await?;
                tracing::info!(
                    booking_id = row.id,
                    kind = notification.kind.as_str(),
                    "client notified"
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Remind clients of active bookings starting within the next 24 hours.
    /// A booking is marked only after its reminder went out, so failed sends
    /// are retried on the next sweep.
    pub async fn send_reminders(&self, now: NaiveDateTime) -> anyhow::Result<usize> {
        let from = now.format("%Y-%m-%d %H:%M").to_string();
        let until = (now + Duration::hours(24)).format("%Y-%m-%d %H:%M").to_string();

        let due: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT id, user_id FROM bookings
             WHERE status IN ('pending', 'confirmed')
               AND notify = 1 AND reminder_sent = 0
               AND (date || ' ' || start_time) > ?
               AND (date || ' ' || start_time) <= ?
             ORDER BY date, start_time",
        )
        .bind(&from)
        .bind(&until)
        .fetch_all(&self.db)
        .await?;

        let mut sent = 0;
        for (booking_id, client_id) in due {
            let notification = Notification {
                client_id,
                booking_id,
                kind: NotificationKind::Reminder,
            };
            if let Err(e) = self.deliver(notification).await {
                tracing::warn!(booking_id, "reminder failed: {:#}", e);
                continue;
            }
            sqlx::query("UPDATE bookings SET reminder_sent = 1 WHERE id = ?")
                .bind(booking_id)
                .execute(&self.db)
                .await?;
            sent += 1;
        }
        Ok(sent)
    }
}

/// Records every message instead of sending it.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingMessenger {
    pub sent: std::sync::Mutex<Vec<(i64, String)>>,
    pub fail: bool,
}

#[cfg(test)]
impl RecordingMessenger {
    pub fn messages(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("telegram unreachable");
        }
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    const ADMIN_CHAT: i64 = 999;

    async fn seed(pool: &SqlitePool, telegram_id: Option<i64>, notify: bool, date: &str, time: &str) -> i64 {
        let user_id = sqlx::query(
            "INSERT INTO users (name, surname, phone, email, password_hash, telegram_id)
             VALUES ('Anna', 'Petrova', '+79990000001', 'anna@example.com', 'x', ?)",
        )
        .bind(telegram_id)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid();
        let service_id = sqlx::query(
            "INSERT INTO services (name, category, price, duration_min) VALUES ('Peeling', 'face', 2500, 60)",
        )
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid();
        sqlx::query(
            "INSERT INTO bookings (user_id, service_id, date, start_time, duration_min, notify)
             VALUES (?, ?, ?, ?, 60, ?)",
        )
        .bind(user_id)
        .bind(service_id)
        .bind(date)
        .bind(time)
        .bind(notify)
        .execute(pool)
        .await
        .unwrap();
        user_id
    }

    fn notifier(pool: SqlitePool, messenger: Arc<RecordingMessenger>) -> Notifier {
        Notifier::new(pool, messenger, Some(ADMIN_CHAT))
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    #[tokio::test]
    async fn test_created_goes_to_client_and_admin() {
        let pool = memory_pool().await;
        let client_id = seed(&pool, Some(555), true, "2026-03-11", "10:00").await;
        let rec = Arc::new(RecordingMessenger::default());

        notifier(pool, rec.clone())
            .deliver(Notification {
                client_id,
                booking_id: 1,
                kind: NotificationKind::Created,
            })
            .await
            .unwrap();

        let sent = rec.messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, ADMIN_CHAT);
        assert!(sent[0].1.contains("Anna Petrova"));
        assert_eq!(sent[1].0, 555);
        assert!(sent[1].1.contains("Peeling"));
        assert!(sent[1].1.contains("2026-03-11 at 10:00"));
    }

    #[tokio::test]
    async fn test_confirmation_skips_admin() {
        let pool = memory_pool().await;
        let client_id = seed(&pool, Some(555), true, "2026-03-11", "10:00").await;
        let rec = Arc::new(RecordingMessenger::default());

        notifier(pool, rec.clone())
            .deliver(Notification {
                client_id,
                booking_id: 1,
                kind: NotificationKind::Confirmed,
            })
            .await
            .unwrap();

        let sent = rec.messages();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.starts_with("Booking confirmed"));
    }

    #[tokio::test]
    async fn test_opted_out_client_not_messaged() {
        let pool = memory_pool().await;
        let client_id = seed(&pool, Some(555), false, "2026-03-11", "10:00").await;
        let rec = Arc::new(RecordingMessenger::default());

        notifier(pool, rec.clone())
            .deliver(Notification {
                client_id,
                booking_id: 1,
                kind: NotificationKind::Created,
            })
            .await
            .unwrap();

        let sent = rec.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ADMIN_CHAT);
    }

    #[tokio::test]
    async fn test_wrong_client_rejected() {
        let pool = memory_pool().await;
        seed(&pool, Some(555), true, "2026-03-11", "10:00").await;
        let rec = Arc::new(RecordingMessenger::default());

        let res = notifier(pool, rec.clone())
            .deliver(Notification {
                client_id: 42,
                booking_id: 1,
                kind: NotificationKind::Created,
            })
            .await;
        assert!(res.is_err());
        assert!(rec.messages().is_empty());
    }

    #[tokio::test]
    async fn test_reminders_sent_once_within_window() {
        let pool = memory_pool().await;
        seed(&pool, Some(555), true, "2026-03-11", "10:00").await;
        let rec = Arc::new(RecordingMessenger::default());
        let notifier = notifier(pool, rec.clone());

        // more than 24 hours ahead
        assert_eq!(notifier.send_reminders(at("2026-03-10 09:00")).await.unwrap(), 0);

        assert_eq!(notifier.send_reminders(at("2026-03-10 11:00")).await.unwrap(), 1);
        assert_eq!(notifier.send_reminders(at("2026-03-10 12:00")).await.unwrap(), 0);

        let sent = rec.messages();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.starts_with("Reminder"));
    }

    #[tokio::test]
    async fn test_failed_reminder_is_retried() {
        let pool = memory_pool().await;
        seed(&pool, Some(555), true, "2026-03-11", "10:00").await;
        let failing = Arc::new(RecordingMessenger {
            fail: true,
            ..Default::default()
        });

        let sent = notifier(pool.clone(), failing)
            .send_reminders(at("2026-03-10 11:00"))
            .await
            .unwrap();
        assert_eq!(sent, 0);

        let flag: bool = sqlx::query_scalar("SELECT reminder_sent FROM bookings WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(!flag);
    }

    #[test]
    fn test_kind_for_status() {
        assert_eq!(
            NotificationKind::for_status(BookingStatus::Completed),
            Some(NotificationKind::Completed)
        );
        assert_eq!(NotificationKind::for_status(BookingStatus::Pending), None);
    }
}
