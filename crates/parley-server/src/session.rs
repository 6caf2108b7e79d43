//! Cookie-based user sessions.
//!
//! The signed-in user's display name is kept in a `chat_user` cookie as
//! `<name>.<signature>`, where the signature is a hex HMAC-SHA256 of the name
//! under the server's [`SessionKey`]. Names are restricted to a cookie-safe
//! alphabet so they never need encoding. A cookie that fails verification is
//! treated as if it were absent.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde_json::json;
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Name of the session cookie.
pub const COOKIE_NAME: &str = "chat_user";

/// Maximum user name length.
pub const MAX_NAME_LENGTH: usize = 64;

/// Minimum length of a configured cookie secret, in bytes.
pub const MIN_SECRET_LENGTH: usize = 32;

/// Validate a user name.
///
/// # Errors
///
/// Returns an error message if the name is invalid.
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Name cannot be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err("Name too long");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("Name contains invalid characters");
    }
    Ok(())
}

/// Key used to sign and verify session cookies.
#[derive(Clone)]
pub struct SessionKey {
    mac: HmacSha256,
}

impl SessionKey {
    /// Build a key from a configured secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is shorter than [`MIN_SECRET_LENGTH`].
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        if secret.len() < MIN_SECRET_LENGTH {
            bail!(
                "Session cookie secret must be at least {} bytes, got {}",
                MIN_SECRET_LENGTH,
                secret.len()
            );
        }
        let mac = HmacSha256::new_from_slice(secret).context("Invalid session cookie secret")?;
        Ok(Self { mac })
    }

    /// Generate a random key. Cookies signed with it do not survive a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be initialized.
    pub fn generate() -> Result<Self> {
        let mut secret = [0u8; MIN_SECRET_LENGTH];
        rand::thread_rng().fill(&mut secret);
        Self::from_secret(&secret)
    }

    fn mac_for(&self, name: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(name.as_bytes());
        mac
    }

    /// Sign a user name into a cookie value.
    #[must_use]
    pub fn sign(&self, name: &str) -> String {
        let tag = self.mac_for(name).finalize().into_bytes();
        format!("{}.{}", name, hex::encode(tag))
    }

    /// Verify a cookie value, returning the user name it carries.
    #[must_use]
    pub fn verify<'a>(&self, value: &'a str) -> Option<&'a str> {
        let (name, tag) = value.rsplit_once('.')?;
        validate_name(name).ok()?;
        let tag = hex::decode(tag).ok()?;
        self.mac_for(name).verify_slice(&tag).ok()?;
        Some(name)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Build the `Set-Cookie` value that signs a user in.
#[must_use]
pub fn login_cookie(key: &SessionKey, name: &str) -> String {
    format!(
        "{COOKIE_NAME}={}; Path=/; HttpOnly; SameSite=Lax",
        key.sign(name)
    )
}

/// Build the `Set-Cookie` value that signs the user out.
#[must_use]
pub fn logout_cookie() -> String {
    format!("{COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

/// Read the signed-in user's name from the request cookies.
///
/// Only a cookie whose signature verifies under `key` counts.
#[must_use]
pub fn user_from_headers(headers: &HeaderMap, key: &SessionKey) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .filter(|(name, _)| *name == COOKIE_NAME)
        .find_map(|(_, value)| key.verify(value))
        .map(str::to_string)
}

/// The signed-in user, extracted from the session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub String);

/// Rejection for requests without a valid session.
#[derive(Debug)]
pub struct AuthRejection;

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Not signed in" })),
        )
            .into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    SessionKey: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let key = SessionKey::from_ref(state);
        user_from_headers(&parts.headers, &key)
            .map(CurrentUser)
            .ok_or(AuthRejection)
    }
}
