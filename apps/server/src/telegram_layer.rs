//! Tracing layer that forwards ERROR events to the admin Telegram chat.
//!
//! At most one alert per `MIN_INTERVAL`, and an identical message is not
//! repeated within `DEDUP_WINDOW`. Sends are spawned onto the runtime.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::notify::Messenger;

const MIN_INTERVAL: Duration = Duration::from_secs(10);
const DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Rate limit plus de-duplication for outgoing alerts.
#[derive(Debug)]
struct Throttle {
    last_sent: Option<Instant>,
    recent: Vec<(u64, Instant)>,
}

impl Throttle {
    fn new() -> Self {
        Self {
            last_sent: None,
            recent: Vec::new(),
        }
    }

    fn should_send(&mut self, hash: u64, now: Instant) -> bool {
        self.recent
            .retain(|(_, at)| now.saturating_duration_since(*at) < DEDUP_WINDOW);

        let duplicate = self.recent.iter().any(|(h, _)| *h == hash);
        let too_soon = self
            .last_sent
            .is_some_and(|last| now.saturating_duration_since(last) < MIN_INTERVAL);
        if duplicate || too_soon {
            return false;
        }

        self.last_sent = Some(now);
        self.recent.push((hash, now));
        true
    }
}

pub struct AlertLayer {
    messenger: Arc<dyn Messenger>,
    chat_id: i64,
    throttle: Mutex<Throttle>,
}

impl AlertLayer {
    pub fn new(messenger: Arc<dyn Messenger>, chat_id: i64) -> Self {
        Self {
            messenger,
            chat_id,
            throttle: Mutex::new(Throttle::new()),
        }
    }
}

impl<S: Subscriber> Layer<S> for AlertLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let message = visitor.message();

        let hash = {
            let mut h = DefaultHasher::new();
            message.hash(&mut h);
            h.finish()
        };
        let allowed = match self.throttle.lock() {
            Ok(mut throttle) => throttle.should_send(hash, Instant::now()),
            Err(_) => false,
        };
        if !allowed {
            return;
        }

        let text = alert_text(
            &message,
            event.metadata().target(),
            event.metadata().file(),
            event.metadata().line(),
        );
        let messenger = self.messenger.clone();
        let chat_id = self.chat_id;
        runtime.spawn(async move {
            let _ = messenger.send(chat_id, &text).await;
        });
    }
}

fn alert_text(message: &str, target: &str, file: Option<&str>, line: Option<u32>) -> String {
    let location = match (file, line) {
        (Some(file), Some(line)) => format!("{file}:{line}"),
        (Some(file), None) => file.to_string(),
        _ => "unknown".to_string(),
    };
    format!(
        "Server error\n\n{message}\n\n{target} ({location})\n{}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )
}

/// Collects the `message` field and any structured fields of an event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn message(&self) -> String {
        let extras = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        match (self.message.is_empty(), extras.is_empty()) {
            (_, true) => self.message.clone(),
            (true, false) => extras,
            (false, false) => format!("{} ({extras})", self.message),
        }
    }

    fn push(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingMessenger;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_first_alert_goes_out() {
        let mut throttle = Throttle::new();
        assert!(throttle.should_send(1, Instant::now()));
    }

    #[test]
    fn test_burst_is_rate_limited() {
        let mut throttle = Throttle::new();
        let t0 = Instant::now();
        assert!(throttle.should_send(1, t0));
        assert!(!throttle.should_send(2, t0 + Duration::from_secs(3)));
        assert!(throttle.should_send(2, t0 + MIN_INTERVAL));
    }

    #[test]
    fn test_repeat_suppressed_until_window_passes() {
        let mut throttle = Throttle::new();
        let t0 = Instant::now();
        assert!(throttle.should_send(1, t0));
        assert!(!throttle.should_send(1, t0 + Duration::from_secs(30)));
        assert!(throttle.should_send(1, t0 + DEDUP_WINDOW + Duration::from_secs(1)));
    }

    #[test]
    fn test_visitor_joins_fields() {
        let visitor = MessageVisitor {
            message: "database failure".into(),
            fields: vec![("error".into(), "disk full".into())],
        };
        assert_eq!(visitor.message(), "database failure (error=disk full)");

        let visitor = MessageVisitor {
            message: String::new(),
            fields: vec![("booking_id".into(), "4".into())],
        };
        assert_eq!(visitor.message(), "booking_id=4");
    }

    #[test]
    fn test_alert_text_has_location() {
        let text = alert_text("boom", "cosmetology_server::db", Some("src/db.rs"), Some(12));
        assert!(text.contains("boom"));
        assert!(text.contains("src/db.rs:12"));
    }

    #[tokio::test]
    async fn test_only_errors_are_forwarded() {
        let rec = Arc::new(RecordingMessenger::default());
        let subscriber = tracing_subscriber::registry().with(AlertLayer::new(rec.clone(), 42));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("just a warning");
            tracing::error!(booking_id = 9, "reminder sweep failed");
        });

        for _ in 0..50 {
            if !rec.messages().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = rec.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 42);
        assert!(sent[0].1.contains("reminder sweep failed (booking_id=9)"));
    }
}
