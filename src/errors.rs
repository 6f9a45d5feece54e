use http::StatusCode;
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    /// Requested quantity exceeds what the material can currently provide.
    #[error("Insufficient material '{material_name}': requested {requested}, available {available}")]
    InsufficientMaterial {
        material_id: Uuid,
        material_name: String,
        requested: Decimal,
        available: Decimal,
    },

    /// Reservation is not in a state that permits the requested operation.
    #[error("Invalid reservation state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Illegal order status transition from '{from}' to '{to}'")]
    IllegalTransition { from: String, to: String },

    #[error("Order is closed with terminal status '{0}'")]
    TerminalOrderState(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Wraps a database error, for use with `map_err`.
    pub fn db_error(error: DbErr) -> Self {
        ServiceError::DatabaseError(error)
    }

    /// Returns the HTTP status code a boundary adapter should report for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::InvalidOperation(_)
            | Self::IllegalTransition { .. } => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Conflict(_)
            | Self::ConcurrentModification(_)
            | Self::InvalidStateTransition(_)
            | Self::TerminalOrderState(_) => StatusCode::CONFLICT,
            Self::InsufficientStock(_) | Self::InsufficientMaterial { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
        }
    }

    /// Returns the message suitable for showing to an end user.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::ConcurrentModification(id) => {
                format!("Concurrent modification for ID {}, please retry", id)
            }
            _ => self.to_string(),
        }
    }

    /// True for errors the caller can fix by changing the request or retrying.
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_)
        )
    }
}
