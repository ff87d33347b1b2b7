use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("Forbidden: {0}")]
    Forbidden(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl AppError {
    /// Status code a transport façade should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized(_) => 401,
            AppError::Forbidden(_) => 403,
            AppError::NotFound(_) => 404,
            AppError::ServiceUnavailable => 503,
            AppError::InternalError(_) | AppError::DatabaseError(_) | AppError::ConfigError(_) => {
                500
            }
        }
    }

    /// Message safe to show an end user. Operational failures never leak
    /// their underlying cause.
    pub fn public_message(&self) -> String {
        match self {
            AppError::BadRequest(err) => err.to_string(),
            AppError::NotFound(_) => "Not found".to_string(),
            AppError::Unauthorized(_) => "Unauthorized".to_string(),
            AppError::Forbidden(_) => "Forbidden".to_string(),
            AppError::ServiceUnavailable => "Service unavailable".to_string(),
            AppError::InternalError(_) | AppError::DatabaseError(_) | AppError::ConfigError(_) => {
                "Internal server error".to_string()
            }
        }
    }

    /// Whether operators need to hear about this error (log at error level, alert).
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            AppError::InternalError(_)
                | AppError::DatabaseError(_)
                | AppError::ConfigError(_)
                | AppError::ServiceUnavailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operational_errors_hide_details() {
        let err = AppError::DatabaseError(anyhow::anyhow!("connection refused on 10.0.0.5"));
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.public_message(), "Internal server error");
        assert!(err.is_operational());
    }

    #[test]
    fn test_forbidden_is_user_facing() {
        let err = AppError::Forbidden(anyhow::anyhow!("row owned by someone else"));
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.public_message(), "Forbidden");
        assert!(!err.is_operational());
    }
}
