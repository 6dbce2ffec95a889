//! Token issuing/verification and password hashing.
//!
//! Requests carry the `Authorization` header value in their `auth` field.
//! Operations that need an identity call [`authorize`] and receive an explicit
//! [`RequestContext`]; there is no ambient "current user".

use crate::ipc::error::AppError;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const INSECURE_DEFAULT_SECRET: &str = "obetrack-insecure-development-secret";

/// bcrypt cost used unless configured otherwise.
pub const DEFAULT_PASSWORD_COST: u32 = 10;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(AppError::BadParams(format!(
                "role must be user or admin, got {}",
                other
            ))),
        }
    }
}

/// What an operation requires of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    User,
    Admin,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_secs: i64,
    pub bootstrap_admin: Option<String>,
    pub password_cost: u32,
}

impl AuthConfig {
    pub fn is_insecure_default(&self) -> bool {
        self.jwt_secret == INSECURE_DEFAULT_SECRET
    }

    /// Role granted to a new account.
    pub fn signup_role(&self, email: &str) -> Role {
        match &self.bootstrap_admin {
            Some(admin) if admin.eq_ignore_ascii_case(email) => Role::Admin,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Identity of the caller, derived from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub subject_id: String,
    pub role: Role,
}

pub fn issue_token(
    config: &AuthConfig,
    user_id: &str,
    email: &str,
    role: Role,
) -> Result<String, AppError> {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        role,
        iat: now,
        exp: now + config.token_ttl_secs,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("failed to sign token: {}", e)))
}

pub fn verify_token(config: &AuthConfig, token: &str) -> Result<Claims, AppError> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            AppError::Unauthorized("token expired".to_string())
        }
        _ => AppError::Unauthorized("invalid token".to_string()),
    })
}

/// Verifies the `Authorization` value (`Bearer <jwt>`) and checks the role.
pub fn authorize(
    config: &AuthConfig,
    header: Option<&str>,
    access: Access,
) -> Result<RequestContext, AppError> {
    let token = header
        .and_then(|h| h.trim().strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("access denied: missing bearer token".to_string()))?;
    let claims = verify_token(config, token)?;
    if access == Access::Admin && claims.role != Role::Admin {
        return Err(AppError::Forbidden("admin role required".to_string()));
    }
    Ok(RequestContext {
        subject_id: claims.sub,
        role: claims.role,
    })
}

/// Returns a bcrypt hash carrying its own salt and cost.
pub fn hash_password(config: &AuthConfig, password: &str) -> Result<String, AppError> {
    bcrypt::hash(password, config.password_cost)
        .map_err(|e| AppError::Internal(format!("password hashing failed: {}", e)))
}

/// Unreadable stored hashes never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    bcrypt::verify(password, stored).unwrap_or(false)
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}
