//! Account registration and login.
//!
//! Passwords are stored as bcrypt hashes. A successful login returns an
//! HS256 JWT naming the account, which `/auth/me` accepts as a bearer
//! token. Accounts are independent of presence: registering does not add
//! anyone to the user list, identifying does.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::server::SharedState;

/// Build the auth router (shares state with the main server).
pub fn routes() -> Router<Arc<SharedState>> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/me", get(me))
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("All fields required")]
    MissingFields,
    #[error("Username already exists")]
    UsernameTaken,
    #[error("User not found")]
    UnknownUser,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Missing bearer token")]
    MissingToken,
    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("Password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("Server error")]
    Storage,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MissingFields
            | AuthError::UsernameTaken
            | AuthError::UnknownUser
            | AuthError::InvalidCredentials => StatusCode::BAD_REQUEST,
            AuthError::MissingToken | AuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            AuthError::Hash(ref e) => {
                tracing::error!("bcrypt error: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AuthError::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "Server error".to_string(),
            _ => self.to_string(),
        };
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

/// Claims carried by a login token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and checks login tokens.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: u64,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl_secs,
        }
    }

    pub fn issue(&self, username: &str) -> Result<String, AuthError> {
        let iat = Utc::now().timestamp();
        let claims = Claims {
            sub: username.to_string(),
            username: username.to_string(),
            iat,
            exp: iat + self.ttl_secs as i64,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let validation = Validation::new(Algorithm::HS256);
        Ok(decode::<Claims>(token, &self.decoding, &validation)?.claims)
    }
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    fn require(&self) -> Result<(), AuthError> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(AuthError::MissingFields);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub message: &'static str,
    pub token: String,
    pub user: LoginUser,
}

#[derive(Debug, Serialize)]
pub struct LoginUser {
    pub username: String,
}

pub async fn register(
    State(state): State<Arc<SharedState>>,
    Json(creds): Json<Credentials>,
) -> Result<(StatusCode, Json<serde_json::Value>), AuthError> {
    creds.require()?;
    let password = creds.password.clone();
    let cost = state.config.bcrypt_cost;
    let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| {
            tracing::error!("bcrypt task failed: {e}");
            AuthError::Storage
        })??;

    let created = state
        .with_db(|db| db.create_account(&creds.username, &hash))
        .ok_or(AuthError::Storage)?;
    if !created {
        return Err(AuthError::UsernameTaken);
    }
    tracing::info!(username = %creds.username, "Account registered");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "message": "User registered successfully" })),
    ))
}

pub async fn login(
    State(state): State<Arc<SharedState>>,
    Json(creds): Json<Credentials>,
) -> Result<Json<LoginResponse>, AuthError> {
    creds.require()?;
    let account = state
        .with_db(|db| db.get_account(&creds.username))
        .ok_or(AuthError::Storage)?
        .ok_or(AuthError::UnknownUser)?;

    let password = creds.password.clone();
    let matches = tokio::task::spawn_blocking(move || bcrypt::verify(password, &account.password_hash))
        .await
        .map_err(|e| {
            tracing::error!("bcrypt task failed: {e}");
            AuthError::Storage
        })??;
    if !matches {
        return Err(AuthError::InvalidCredentials);
    }

    let token = state.tokens.issue(&creds.username)?;
    tracing::info!(username = %creds.username, "Login succeeded");
    Ok(Json(LoginResponse {
        message: "Login successful",
        token,
        user: LoginUser { username: creds.username },
    }))
}

/// The account named by the request's bearer token.
pub async fn me(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<LoginUser>, AuthError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)?;
    let claims = state.tokens.verify(token)?;
    Ok(Json(LoginUser { username: claims.username }))
}
