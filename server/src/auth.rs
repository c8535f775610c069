//! Session authentication: HS256 tokens, the revocation blacklist, and the
//! HTTP middleware that gates authenticated routes (including the WebSocket
//! upgrade).
//!
//! A token is effective iff its signature verifies, it is unexpired, and it
//! has not been blacklisted by a sign-out.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{ChatError, Result};
use crate::models::{ErrorResponse, Session};
use crate::state::SharedState;

/// Name of the cookie carrying the session token.
pub const AUTH_COOKIE: &str = "auth_token";

const ISSUER: &str = "palaver";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iss: String,
}

/// Issues and validates sessions against the store's blacklist.
#[derive(Clone)]
pub struct AuthService {
    db: Database,
    encoding: EncodingKey,
    decoding: DecodingKey,
    token_ttl: Duration,
}

impl AuthService {
    pub fn new(db: Database, secret: &[u8], token_ttl: Duration) -> Self {
        Self {
            db,
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            token_ttl,
        }
    }

    /// Verifies credentials and mints a session token.
    pub async fn new_session(&self, username: &str, password: &str) -> Result<Session> {
        let user = self
            .db
            .get_user_by_username(username)
            .await?
            .ok_or(ChatError::BadCredentials)?;

        if !self.db.compare_password(username, password).await? {
            return Err(ChatError::BadCredentials);
        }

        let expires_at = Utc::now() + self.token_ttl;
        let claims = Claims {
            sub: user.username.clone(),
            exp: expires_at.timestamp(),
            iss: ISSUER.to_string(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;

        Ok(Session {
            username: user.username,
            token,
            expires_at,
        })
    }

    /// Revokes the session's token until the token's own expiry.
    pub async fn destroy_session(&self, session: &Session) -> Result<()> {
        self.db
            .blacklist_token(&session.token, session.expires_at)
            .await
    }

    /// Resolves a bearer token to its session, or `Unauthenticated`.
    pub async fn session(&self, token: &str) -> Result<Session> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| ChatError::Unauthenticated)?;

        if self.db.is_token_blacklisted(token).await? {
            return Err(ChatError::Unauthenticated);
        }

        let expires_at: DateTime<Utc> = Utc
            .timestamp_opt(data.claims.exp, 0)
            .single()
            .ok_or(ChatError::Unauthenticated)?;

        Ok(Session {
            username: data.claims.sub,
            token: token.to_string(),
            expires_at,
        })
    }
}

/// Pulls the named cookie out of a Cookie header value.
fn cookie_value<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}

/// Middleware validating the `auth_token` cookie and attaching the session
/// to the request. Rejection happens before any upgrade, so a revoked token
/// never reaches the connection manager.
pub async fn auth_middleware(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| cookie_value(cookies, AUTH_COOKIE))
        .map(str::to_owned);

    let Some(token) = token else {
        return unauthenticated("missing authentication token");
    };

    match state.auth.session(&token).await {
        Ok(session) => {
            request.extensions_mut().insert(session);
            next.run(request).await
        }
        Err(ChatError::Unauthenticated) => unauthenticated("invalid or expired token"),
        Err(err) => {
            tracing::error!("session lookup failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "internal error".into(),
                    code: 500,
                }),
            )
                .into_response()
        }
    }
}

fn unauthenticated(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.into(),
            code: 401,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_value_finds_named_cookie() {
        let header = "theme=dark; auth_token=abc.def.ghi; lang=en";
        assert_eq!(cookie_value(header, "auth_token"), Some("abc.def.ghi"));
        assert_eq!(cookie_value(header, "missing"), None);
    }

    #[test]
    fn cookie_value_handles_single_cookie() {
        assert_eq!(cookie_value("auth_token=tok", "auth_token"), Some("tok"));
    }
}
