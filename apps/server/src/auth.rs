use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::models::Role;

type HmacSha256 = Hmac<Sha256>;

/// The only JOSE header accepted or produced.
const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    Expired,
    #[error("invalid credentials")]
    BadCredentials,
    #[error("admin access required")]
    AdminOnly,
    #[error("password hashing failed: {0}")]
    Hash(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub email: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

fn sign(secret: &str, signing_input: &str) -> Result<HmacSha256, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AuthError::InvalidToken)?;
    mac.update(signing_input.as_bytes());
    Ok(mac)
}

/// Issue an HS256 token for `user_id`, valid for `ttl_hours`.
pub fn issue_token(
    user_id: i64,
    email: &str,
    role: Role,
    secret: &str,
    ttl_hours: i64,
) -> Result<String, AuthError> {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id,
        email: email.to_string(),
        role,
        iat: now,
        exp: now + ttl_hours * 3600,
    };
    encode(&claims, secret)
}

fn encode(claims: &Claims, secret: &str) -> Result<String, AuthError> {
    let payload = serde_json::to_vec(claims).map_err(|_| AuthError::InvalidToken)?;
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(JWT_HEADER),
        URL_SAFE_NO_PAD.encode(payload)
    );
    let signature = sign(secret, &signing_input)?.finalize().into_bytes();
    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
}

/// Check signature and expiry, returning the embedded claims.
pub fn verify_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let (signing_input, signature) = token.rsplit_once('.').ok_or(AuthError::InvalidToken)?;
    let (header_b64, payload_b64) = signing_input
        .split_once('.')
        .ok_or(AuthError::InvalidToken)?;

    let header = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| AuthError::InvalidToken)?;
    if header != JWT_HEADER.as_bytes() {
        return Err(AuthError::InvalidToken);
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| AuthError::InvalidToken)?;
    sign(secret, signing_input)?
        .verify_slice(&signature)
        .map_err(|_| AuthError::InvalidToken)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::InvalidToken)?;
    let claims: Claims = serde_json::from_slice(&payload).map_err(|_| AuthError::InvalidToken)?;

    if claims.exp <= chrono::Utc::now().timestamp() {
        return Err(AuthError::Expired);
    }
    Ok(claims)
}

/// Extract and verify the `Authorization: Bearer <jwt>` header.
pub fn authenticate(headers: &HeaderMap, secret: &str) -> Result<Claims, AuthError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)?;
    verify_token(token.trim(), secret)
}

pub fn require_admin(headers: &HeaderMap, secret: &str) -> Result<Claims, AuthError> {
    let claims = authenticate(headers, secret)?;
    if !claims.is_admin() {
        tracing::warn!(user_id = claims.sub, "non-admin tried an admin endpoint");
        return Err(AuthError::AdminOnly);
    }
    Ok(claims)
}

/// Hashing runs on the blocking pool.
pub async fn hash_password(password: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| AuthError::Hash(e.to_string()))
    })
    .await
    .map_err(|e| AuthError::Hash(e.to_string()))?
}

pub async fn verify_password(password: String, hash: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash).map_err(|e| AuthError::Hash(e.to_string()))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|e| AuthError::Hash(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret-test-secret";

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_token_roundtrip() {
        let token = issue_token(7, "anna@example.com", Role::Client, SECRET, 24).unwrap();
        let claims = verify_token(&token, SECRET).unwrap();
        assert_eq!(claims.sub, 7);
        assert_eq!(claims.email, "anna@example.com");
        assert_eq!(claims.role, Role::Client);
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_token(7, "a@b.c", Role::Client, SECRET, 24).unwrap();
        assert_eq!(
            verify_token(&token, "another-secret-value"),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let token = issue_token(7, "a@b.c", Role::Client, SECRET, 24).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged_claims = Claims {
            sub: 7,
            email: "a@b.c".into(),
            role: Role::Admin,
            iat: 0,
            exp: i64::MAX,
        };
        let forged = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        let token = format!("{}.{}.{}", parts[0], forged, parts[2]);
        assert_eq!(verify_token(&token, SECRET), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = issue_token(7, "a@b.c", Role::Client, SECRET, -1).unwrap();
        assert_eq!(verify_token(&token, SECRET), Err(AuthError::Expired));
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert_eq!(verify_token("abc", SECRET), Err(AuthError::InvalidToken));
        assert_eq!(verify_token("a.b.c", SECRET), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_authenticate_requires_bearer() {
        assert_eq!(
            authenticate(&HeaderMap::new(), SECRET),
            Err(AuthError::MissingToken)
        );

        let token = issue_token(3, "a@b.c", Role::Client, SECRET, 1).unwrap();
        assert_eq!(authenticate(&bearer(&token), SECRET).unwrap().sub, 3);
    }

    #[test]
    fn test_require_admin() {
        let client = issue_token(3, "a@b.c", Role::Client, SECRET, 1).unwrap();
        assert_eq!(
            require_admin(&bearer(&client), SECRET),
            Err(AuthError::AdminOnly)
        );

        let admin = issue_token(1, "admin@b.c", Role::Admin, SECRET, 1).unwrap();
        assert!(require_admin(&bearer(&admin), SECRET).unwrap().is_admin());
    }

    #[tokio::test]
    async fn test_password_hash_verifies() {
        let hash = hash_password("hunter22".into()).await.unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("hunter22".into(), hash.clone()).await.unwrap());
        assert!(!verify_password("hunter23".into(), hash).await.unwrap());
    }
}
