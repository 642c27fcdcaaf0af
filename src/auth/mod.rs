//! User registration, login and session tokens.
//!
//! Passwords and session tokens are stored only as SHA-256 digests keyed by
//! the configured secret. The raw token travels in the `Authorization` header.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use chrono::{Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{AppError, AppResult, AuthError};
use crate::ledger::models::User;
use crate::ledger::LedgerStore;

/// Authentication settings
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub session_ttl: Duration,
}

/// A freshly issued session.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: User,
    pub token: String,
}

pub struct AuthService {
    ledger: Arc<dyn LedgerStore>,
    config: AuthConfig,
}

impl AuthService {
    pub fn new(ledger: Arc<dyn LedgerStore>, config: AuthConfig) -> Self {
        Self { ledger, config }
    }

    pub async fn register(&self, login: &str, password: &str) -> AppResult<Session> {
        let password_hash = hash_password(&self.config.secret, login, password);
        let user = self.ledger.create_user(login, &password_hash).await?;
        info!(user_id = user.id, login = %user.login, "👤 User registered");

        self.open_session(user).await
    }

    pub async fn login(&self, login: &str, password: &str) -> AppResult<Session> {
        let user = self
            .ledger
            .find_user_by_login(login)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if user.password_hash != hash_password(&self.config.secret, login, password) {
            debug!(login, "Password mismatch");
            return Err(AuthError::InvalidCredentials.into());
        }

        self.open_session(user).await
    }

    /// Resolve a raw session token to its user.
    pub async fn authenticate(&self, token: &str) -> AppResult<User> {
        let token_hash = hash_token(&self.config.secret, token);
        self.ledger
            .find_user_by_session(&token_hash, Utc::now())
            .await?
            .ok_or_else(|| AuthError::InvalidToken.into())
    }

    async fn open_session(&self, user: User) -> AppResult<Session> {
        let token = new_session_token();
        let expires_at = Utc::now() + self.config.session_ttl;
        self.ledger
            .store_session(user.id, &hash_token(&self.config.secret, &token), expires_at)
            .await?;

        Ok(Session { user, token })
    }
}

pub fn hash_password(secret: &str, login: &str, password: &str) -> String {
    keyed_digest(secret, &[b"password", login.as_bytes(), password.as_bytes()])
}

pub fn hash_token(secret: &str, token: &str) -> String {
    keyed_digest(secret, &[b"session", token.as_bytes()])
}

/// 32 random bytes, hex encoded.
pub fn new_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

fn keyed_digest(secret: &str, parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    for part in parts {
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Accepts both `<token>` and `Bearer <token>`.
fn session_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

/// Authenticated caller, resolved from the `Authorization` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<AuthService>: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers).ok_or(AuthError::MissingToken)?;
        let auth = Arc::<AuthService>::from_ref(state);
        let user = auth.authenticate(token).await?;

        Ok(AuthUser { user_id: user.id })
    }
}
