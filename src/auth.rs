// src/auth.rs
use crate::error::ApiError;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::Error as JwtError;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::{Filter, Rejection};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Signs an HS256 token for `user_id`. Used by the login service that shares
/// the secret, and by tests.
pub fn create_token(user_id: &str, secret: &str, ttl: Duration) -> Result<String, JwtError> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (Utc::now() + ttl).timestamp().max(0) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, JwtError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
}

/// Resolves the calling user id from `Authorization: Bearer <jwt>`.
pub fn with_user(
    secret: Arc<String>,
) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization").and_then(move |header: Option<String>| {
        let secret = secret.clone();
        async move { authorize(header.as_deref(), &secret).map_err(warp::reject::custom) }
    })
}

fn authorize(header: Option<&str>, secret: &str) -> Result<String, ApiError> {
    let token = header
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;
    let claims = verify_token(token, secret)
        .map_err(|e| ApiError::Unauthorized(format!("invalid token: {e}")))?;
    if claims.sub.is_empty() {
        return Err(ApiError::Unauthorized("token has no subject".into()));
    }
    Ok(claims.sub)
}
