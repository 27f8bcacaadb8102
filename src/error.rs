use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

use crate::auth::RateLimitTier;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::DatabaseError(DatabaseError::NotFound),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                AppError::DatabaseError(DatabaseError::ConnectionError(err.to_string()))
            }
            _ => AppError::DatabaseError(DatabaseError::QueryError(err.to_string())),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::DatabaseError(DatabaseError::QueryError(err.to_string()))
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AppError::AuthError(AuthError::TokenGenerationFailure(err.to_string()))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl AppError {
    /// Whether this error is the uniform refresh-token rejection.
    pub fn is_token_rejection(&self) -> bool {
        matches!(self, AppError::AuthError(AuthError::InvalidOrExpiredToken(_)))
    }

    /// Message safe to hand to a client. Internal details and token
    /// rejection sub-reasons stay in the logs.
    fn public_message(&self) -> String {
        match self {
            AppError::AuthError(AuthError::TokenGenerationFailure(_))
            | AppError::DatabaseError(_)
            | AppError::ConfigError(_)
            | AppError::InternalError(_) => "Internal server error".to_string(),
            AppError::AuthError(AuthError::ExternalServiceFailure(_)) => {
                "Service temporarily unavailable".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let mut error = json!({
            "status": status.as_u16(),
            "message": self.public_message(),
        });
        if let AppError::AuthError(AuthError::AccountLocked { until }) = self {
            error["locked_until"] = json!(until.to_rfc3339());
        }

        HttpResponse::build(status).json(json!({ "error": error }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
                AuthError::AccountLocked { .. } => StatusCode::LOCKED,
                AuthError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                AuthError::ExternalServiceFailure(_) => StatusCode::BAD_GATEWAY,
                AuthError::InvalidOrExpiredToken(_) => StatusCode::UNAUTHORIZED,
                AuthError::TokenGenerationFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
                AuthError::VerificationFailed => StatusCode::UNAUTHORIZED,
                AuthError::InvalidDestination(_) => StatusCode::BAD_REQUEST,
            },
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account locked until {until}")]
    AccountLocked { until: DateTime<Utc> },

    #[error("Rate limit exceeded")]
    RateLimitExceeded { tier: RateLimitTier },

    #[error("External service failure: {0}")]
    ExternalServiceFailure(String),

    #[error("Invalid or expired token")]
    InvalidOrExpiredToken(TokenRejection),

    #[error("Token generation failed: {0}")]
    TokenGenerationFailure(String),

    #[error("Verification failed")]
    VerificationFailed,

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),
}

/// Why a refresh token was refused. Only ever logged; clients see the
/// uniform `InvalidOrExpiredToken` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Unknown,
    Revoked,
    Expired,
    IpMismatch,
    DeviceMismatch,
    Blacklisted,
    Malformed,
}

impl TokenRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenRejection::Unknown => "unknown",
            TokenRejection::Revoked => "revoked",
            TokenRejection::Expired => "expired",
            TokenRejection::IpMismatch => "ip_mismatch",
            TokenRejection::DeviceMismatch => "device_mismatch",
            TokenRejection::Blacklisted => "blacklisted",
            TokenRejection::Malformed => "malformed",
        }
    }
}

impl std::fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Record not found")]
    NotFound,

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}
