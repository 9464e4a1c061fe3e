mod auth;
mod booking;
mod config;
mod db;
mod error;
mod handlers;
mod models;
mod notify;
mod rate_limit;
mod schedule;
mod telegram_layer;


use axum::{
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use booking::BookingDesk;
use config::AppConfig;
use notify::Notifier;
use rate_limit::{
    rate_limit_admin, rate_limit_auth, rate_limit_booking, rate_limit_public, RateLimiter,
};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: AppConfig,
    pub desk: BookingDesk,
    pub notifier: Notifier,
    pub started_at: Instant,
}

/// Reminder scan interval (seconds).
const REMINDER_INTERVAL_SECS: u64 = 3600;
/// Rate limit and day-lock cleanup interval (seconds).
const CLEANUP_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    let messenger = notify::messenger_from_token(&config.bot_token);

    // ── Tracing: console + optional Telegram error alerts ──
    let env_filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());

    match config.admin_chat_id {
        Some(chat_id) if !config.bot_token.is_empty() => {
            registry
                .with(telegram_layer::AlertLayer::new(messenger.clone(), chat_id))
                .init();
        }
        _ => registry.init(),
    }

    if config.bot_token.is_empty() {
        tracing::warn!("BOT_TOKEN not set, notifications will only be logged");
    }

    // ── Database ──
    let pool = db::connect(&config.database_url).await?;
    if let (Some(email), Some(password)) = (&config.admin_email, &config.admin_password) {
        handlers::auth::bootstrap_admin(&pool, email, password).await?;
    }

    let notifier = Notifier::new(pool.clone(), messenger, config.admin_chat_id);
    let desk = BookingDesk::new(pool.clone(), config.hours, notifier.clone());
    let state = Arc::new(AppState {
        db: pool,
        config,
        desk,
        notifier,
        started_at: Instant::now(),
    });

    // ── Background task: appointment reminders ──
    let reminder_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(REMINDER_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let now = reminder_state.config.local_now();
            match reminder_state.notifier.send_reminders(now).await {
                Ok(0) => {}
                Ok(sent) => tracing::info!(sent, "reminders delivered"),
                Err(e) => tracing::error!("reminder scan failed: {:#}", e),
            }
        }
    });

    let rate_limiter = RateLimiter::with_defaults();

    // ── Background task: drop stale rate limit entries and day locks ──
    let cleanup_limiter = rate_limiter.clone();
    let cleanup_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(CLEANUP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup();
            cleanup_state
                .desk
                .prune_locks(cleanup_state.config.local_now().date());
        }
    });

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let cors = cors_layer(state.config.webapp_url.as_deref())?;
    let app = app(state, rate_limiter).layer(cors);

    tracing::info!("Cosmetology booking server starting on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Whitelist WEBAPP_URL when configured, otherwise allow any origin.
fn cors_layer(webapp_url: Option<&str>) -> anyhow::Result<CorsLayer> {
    let layer = match webapp_url {
        Some(url) => {
            let origins: Vec<axum::http::HeaderValue> = vec![
                url.parse()
                    .map_err(|_| anyhow::anyhow!("WEBAPP_URL is not a valid origin: {url}"))?,
                axum::http::HeaderValue::from_static("http://localhost:5173"),
            ];
            CorsLayer::new().allow_origin(AllowOrigin::list(origins))
        }
        None => CorsLayer::new().allow_origin(Any),
    };
    Ok(layer.allow_methods(Any).allow_headers(Any))
}

/// All API routes, grouped by rate-limit tier.
pub fn app(state: Arc<AppState>, limiter: RateLimiter) -> Router {
    // 1. No limit: health checks + Telegram webhook
    let no_limit_routes = Router::new()
        .route("/api/health", get(handlers::health::health))
        .route("/api/telegram/webhook", post(handlers::telegram::webhook));

    // 2. Public: catalogue and availability
    let public_routes = Router::new()
        .route("/api/services", get(handlers::services::list_services))
        .route("/api/availability", get(handlers::bookings::availability))
        .layer(from_fn_with_state(limiter.clone(), rate_limit_public));

    // 3. Booking creation: strictest limit
    let booking_routes = Router::new()
        .route("/api/bookings", post(handlers::bookings::create_booking))
        .layer(from_fn_with_state(limiter.clone(), rate_limit_booking));

    // 4. Auth and client account endpoints
    let auth_routes = Router::new()
        .route("/api/auth/register", post(handlers::auth::register))
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/admin-login", post(handlers::auth::admin_login))
        .route("/api/auth/me", get(handlers::auth::me))
        .route("/api/bookings/my", get(handlers::bookings::my_bookings))
        .route("/api/bookings/{id}", get(handlers::bookings::get_booking))
        .route(
            "/api/bookings/{id}/cancel",
            post(handlers::bookings::cancel_booking),
        )
        .route("/api/telegram/link", post(handlers::telegram::create_link))
        .route(
            "/api/telegram/check-link/{code}",
            get(handlers::telegram::check_link),
        )
        .route("/api/telegram/unlink", post(handlers::telegram::unlink))
        .layer(from_fn_with_state(limiter.clone(), rate_limit_auth));

    // 5. Admin
    let admin_routes = Router::new()
        .route(
            "/api/admin/services",
            get(handlers::services::list_all_services).post(handlers::services::create_service),
        )
        .route(
            "/api/admin/services/{id}",
            put(handlers::services::update_service).delete(handlers::services::delete_service),
        )
        .route(
            "/api/admin/services/{id}/toggle",
            post(handlers::services::toggle_service),
        )
        .route("/api/admin/bookings", get(handlers::admin::list_bookings))
        .route(
            "/api/admin/bookings/{id}/status",
            post(handlers::admin::update_status),
        )
        .route(
            "/api/admin/bookings/{id}/cancel",
            post(handlers::admin::cancel_booking),
        )
        .route("/api/admin/clients", get(handlers::admin::list_clients))
        .route(
            "/api/admin/clients/{id}",
            get(handlers::admin::client_details),
        )
        .route("/api/admin/reconcile", get(handlers::admin::reconcile))
        .layer(from_fn_with_state(limiter, rate_limit_admin));

    Router::new()
        .merge(no_limit_routes)
        .merge(public_routes)
        .merge(booking_routes)
        .merge(auth_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
