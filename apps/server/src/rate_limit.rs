use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::ApiResponse;

/// Route groups, each with its own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Catalogue and availability reads.
    Public,
    /// Login, registration and the signed-in client's own data.
    Auth,
    /// Booking creation.
    Booking,
    Admin,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Public, Tier::Auth, Tier::Booking, Tier::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Public => "public",
            Tier::Auth => "auth",
            Tier::Booking => "booking",
            Tier::Admin => "admin",
        }
    }

    pub fn default_config(&self) -> RateLimitConfig {
        let (max_requests, secs) = match self {
            Tier::Public => (60, 60),
            Tier::Auth => (30, 60),
            Tier::Booking => (10, 300),
            Tier::Admin => (120, 60),
        };
        RateLimitConfig {
            max_requests,
            window: Duration::from_secs(secs),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

type Hits = DashMap<IpAddr, Vec<Instant>>;

/// Per-IP sliding-window counters, one window per tier.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    tiers: Arc<DashMap<Tier, (RateLimitConfig, Hits)>>,
}

impl RateLimiter {
    /// A limiter with no tiers configured lets everything through.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let limiter = Self::new();
        for tier in Tier::ALL {
            limiter.set_tier(tier, tier.default_config());
        }
        limiter
    }

    pub fn set_tier(&self, tier: Tier, config: RateLimitConfig) {
        self.tiers.insert(tier, (config, DashMap::new()));
    }

    /// `Err(retry_after_secs)` once `ip` has used up the tier's window.
    pub fn check(&self, tier: Tier, ip: IpAddr) -> Result<(), u64> {
        let Some(entry) = self.tiers.get(&tier) else {
            return Ok(());
        };
        let (config, hits) = entry.value();
        let now = Instant::now();

        let mut stamps = hits.entry(ip).or_default();
        stamps.retain(|t| now.duration_since(*t) < config.window);

        if stamps.len() >= config.max_requests as usize {
            let retry_after = stamps
                .first()
                .map(|oldest| (*oldest + config.window).saturating_duration_since(now))
                .unwrap_or(config.window)
                .as_secs()
                .max(1);
            tracing::warn!(tier = tier.as_str(), %ip, retry_after, "rate limited");
            return Err(retry_after);
        }

        stamps.push(now);
        Ok(())
    }

    /// Forget clients idle for two windows. Run from a background task.
    pub fn cleanup(&self) {
        let now = Instant::now();
        for entry in self.tiers.iter() {
            let (config, hits) = entry.value();
            let horizon = config.window * 2;
            hits.retain(|_, stamps| {
                stamps.retain(|t| now.duration_since(*t) < horizon);
                !stamps.is_empty()
            });
        }
    }
}

/// First `X-Forwarded-For` hop when behind the proxy, else the peer address.
pub fn client_ip(req: &Request) -> IpAddr {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok());

    forwarded
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip())
        })
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn too_many_requests(retry_after: u64) -> Response {
    let body = ApiResponse::<()>::error(format!(
        "Too many requests. Try again in {retry_after} seconds"
    ));
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", retry_after.to_string())],
        Json(body),
    )
        .into_response()
}

async fn enforce(limiter: &RateLimiter, tier: Tier, req: Request, next: Next) -> Result<Response, Response> {
    limiter
        .check(tier, client_ip(&req))
        .map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

pub async fn rate_limit_public(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    enforce(&limiter, Tier::Public, req, next).await
}

pub async fn rate_limit_auth(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    enforce(&limiter, Tier::Auth, req, next).await
}

pub async fn rate_limit_booking(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    enforce(&limiter, Tier::Booking, req, next).await
}

pub async fn rate_limit_admin(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    enforce(&limiter, Tier::Admin, req, next).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use axum::Router;
    use std::thread::sleep;
    use tower::ServiceExt;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn limiter(tier: Tier, max_requests: u32, window: Duration) -> RateLimiter {
        let limiter = RateLimiter::new();
        limiter.set_tier(
            tier,
            RateLimitConfig {
                max_requests,
                window,
            },
        );
        limiter
    }

    #[test]
    fn test_budget_then_reject() {
        let limiter = limiter(Tier::Booking, 2, Duration::from_secs(300));
        assert!(limiter.check(Tier::Booking, ip(1)).is_ok());
        assert!(limiter.check(Tier::Booking, ip(1)).is_ok());
        let retry_after = limiter.check(Tier::Booking, ip(1)).unwrap_err();
        assert!((1..=300).contains(&retry_after));
    }

    #[test]
    fn test_ips_and_tiers_are_isolated() {
        let limiter = limiter(Tier::Public, 1, Duration::from_secs(60));
        limiter.set_tier(Tier::Admin, Tier::Admin.default_config());

        assert!(limiter.check(Tier::Public, ip(1)).is_ok());
        assert!(limiter.check(Tier::Public, ip(1)).is_err());
        assert!(limiter.check(Tier::Public, ip(2)).is_ok());
        assert!(limiter.check(Tier::Admin, ip(1)).is_ok());
    }

    #[test]
    fn test_unconfigured_tier_is_unlimited() {
        let limiter = RateLimiter::new();
        for _ in 0..1000 {
            assert!(limiter.check(Tier::Auth, ip(1)).is_ok());
        }
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter(Tier::Auth, 1, Duration::from_millis(80));
        assert!(limiter.check(Tier::Auth, ip(1)).is_ok());
        assert!(limiter.check(Tier::Auth, ip(1)).is_err());
        sleep(Duration::from_millis(120));
        assert!(limiter.check(Tier::Auth, ip(1)).is_ok());
    }

    #[test]
    fn test_cleanup_only_drops_idle_clients() {
        let limiter = limiter(Tier::Public, 2, Duration::from_millis(40));
        limiter.check(Tier::Public, ip(1)).unwrap();
        sleep(Duration::from_millis(100));
        limiter.check(Tier::Public, ip(2)).unwrap();

        limiter.cleanup();

        let entry = limiter.tiers.get(&Tier::Public).unwrap();
        assert!(!entry.value().1.contains_key(&ip(1)));
        assert!(entry.value().1.contains_key(&ip(2)));
    }

    #[test]
    fn test_default_booking_budget() {
        let limiter = RateLimiter::with_defaults();
        for _ in 0..10 {
            assert!(limiter.check(Tier::Booking, ip(7)).is_ok());
        }
        assert!(limiter.check(Tier::Booking, ip(7)).is_err());
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req), "203.0.113.9".parse::<IpAddr>().unwrap());

        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_ip(&req), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_middleware_returns_429_with_retry_after() {
        let limiter = limiter(Tier::Booking, 1, Duration::from_secs(300));
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(limiter, rate_limit_booking));

        let first = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key("retry-after"));
    }
}
