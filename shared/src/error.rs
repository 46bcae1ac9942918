//! Error types for Trapline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid or expired token")]
    InvalidToken,

    #[error("admin token required")]
    AdminRequired,

    #[error("invalid admin token")]
    InvalidAdminToken,

    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("not found")]
    NotFound,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: i64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("listener bind error: {0}")]
    Bind(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Construct a validation error for a named field.
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code surfaced at the API boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidToken => "invalid_token",
            Error::AdminRequired => "admin_required",
            Error::InvalidAdminToken => "invalid_admin_token",
            Error::Validation { .. } => "validation_error",
            Error::NotFound => "not_found",
            Error::StorageUnavailable(_) => "storage_unavailable",
            Error::RateLimited { .. } => "rate_limited",
            Error::Config(_) => "config_error",
            Error::Bind(_) => "bind_error",
            Error::Protocol(_) => "protocol_error",
            Error::Serialize(_) | Error::Io(_) => "internal_error",
        }
    }

    /// HTTP status matching the error kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidToken => 401,
            Error::AdminRequired | Error::InvalidAdminToken => 403,
            Error::Validation { .. } => 400,
            Error::NotFound => 404,
            Error::StorageUnavailable(_) => 503,
            Error::RateLimited { .. } => 429,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        assert_eq!(Error::InvalidToken.code(), "invalid_token");
        assert_eq!(Error::InvalidToken.http_status(), 401);
        assert_eq!(Error::AdminRequired.code(), "admin_required");
        assert_eq!(Error::AdminRequired.http_status(), 403);
        assert_eq!(Error::NotFound.http_status(), 404);
        assert_eq!(
            Error::StorageUnavailable("timeout".into()).http_status(),
            503
        );

        let e = Error::validation("path", "leading slash");
        assert_eq!(e.code(), "validation_error");
        assert_eq!(e.http_status(), 400);
        assert_eq!(e.to_string(), "invalid path: leading slash");
    }
}
