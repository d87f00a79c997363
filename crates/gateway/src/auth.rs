//! Authentication — HS256 JWTs plus bootstrap users.
//!
//! `AUTH_MODE=none` bypasses verification (every caller becomes a
//! development admin). `AUTH_MODE=jwt` verifies `Authorization: Bearer`
//! on REST and the `?token=` query parameter at the WebSocket handshake.
//! Bootstrap users come from `AUTH_USERS` (`user:pass:role;...`); their
//! password digests are computed once at startup and compared in constant
//! time.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use parley_domain::config::Role;
use parley_domain::error::{Error, ErrorCode, Result};

use crate::settings::{AuthMode, Settings};
use crate::state::AppState;

/// Token lifetime for bootstrap logins.
const TOKEN_TTL_SECS: i64 = 12 * 60 * 60;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity & claims
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The authenticated caller, attached to requests and sessions.
#[derive(Debug, Clone)]
pub struct Identity {
    pub sub: String,
    pub role: Role,
}

impl Identity {
    /// The identity used when verification is bypassed (`AUTH_MODE=none`).
    pub fn dev() -> Self {
        Self {
            sub: "dev".into(),
            role: Role::Admin,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: String,
    exp: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct BootstrapUser {
    username: String,
    password_hash: Vec<u8>,
    role: Role,
}

pub struct AuthService {
    mode: AuthMode,
    encoding: EncodingKey,
    decoding: DecodingKey,
    users: Vec<BootstrapUser>,
}

impl AuthService {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let users = parse_users(&settings.auth_users)?;
        if settings.auth_mode == AuthMode::Jwt && users.is_empty() {
            tracing::warn!("AUTH_MODE=jwt with no AUTH_USERS — only externally-issued tokens will work");
        }
        Ok(Self {
            mode: settings.auth_mode,
            encoding: EncodingKey::from_secret(settings.auth_secret.as_bytes()),
            decoding: DecodingKey::from_secret(settings.auth_secret.as_bytes()),
            users,
        })
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Verify a bearer token. In `none` mode every token (including none at
    /// all) resolves to the development admin.
    pub fn verify(&self, token: &str) -> Result<Identity> {
        if self.mode == AuthMode::None {
            return Ok(Identity::dev());
        }
        let data = decode::<Claims>(
            token,
            &self.decoding,
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| Error::Auth(format!("invalid token: {e}")))?;

        let role = data.claims.role.parse()?;
        Ok(Identity {
            sub: data.claims.sub,
            role,
        })
    }

    pub fn issue(&self, sub: &str, role: Role) -> Result<String> {
        let claims = Claims {
            sub: sub.to_owned(),
            role: role.as_str().to_owned(),
            exp: (chrono::Utc::now() + chrono::Duration::seconds(TOKEN_TTL_SECS)).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Auth(format!("signing token: {e}")))
    }

    /// Check bootstrap credentials; on success returns a fresh token.
    /// Password digests are compared in constant time.
    pub fn login(&self, username: &str, password: &str) -> Result<String> {
        let provided_hash = Sha256::digest(password.as_bytes());
        let user = self
            .users
            .iter()
            .find(|u| {
                u.username == username
                    && bool::from(provided_hash.ct_eq(u.password_hash.as_slice()))
            })
            .ok_or_else(|| Error::api(ErrorCode::Unauthorized, "invalid credentials"))?;
        self.issue(&user.username, user.role)
    }
}

fn parse_users(raw: &str) -> Result<Vec<BootstrapUser>> {
    let mut users = Vec::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(3, ':');
        let (Some(username), Some(password), Some(role)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Config(format!(
                "AUTH_USERS entry {entry:?} is not user:pass:role"
            )));
        };
        users.push(BootstrapUser {
            username: username.to_owned(),
            password_hash: Sha256::digest(password.as_bytes()).to_vec(),
            role: role.parse()?,
        });
    }
    Ok(users)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Axum middleware enforcing bearer-token auth on protected routes. The
/// resolved [`Identity`] is inserted into request extensions.
pub async fn require_identity(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    match state.auth.verify(token) {
        Ok(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(e) => (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "error": ErrorCode::Unauthorized,
                "message": e.to_string(),
            })),
        )
            .into_response(),
    }
}
