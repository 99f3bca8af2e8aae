//! Error types for the credit engine

use crate::amount::Amount;
use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
///
/// Every business rejection is returned before any staged write is committed,
/// so a caller never observes a partially applied transition.
#[derive(Error, Debug)]
pub enum Error {
    /// Referenced entity absent
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("contribution", "cycle", ...)
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Business rule blocks the requested transition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Contribution or cycle share was already paid
    #[error("Already paid: {0}")]
    AlreadyPaid(Uuid),

    /// Credit is exhausted or expired
    #[error("Credit {0} is not active")]
    InactiveCredit(Uuid),

    /// Product stock cannot cover the requested quantity
    #[error(
        "Insufficient stock for product {product_id}: \
         requested {requested}, available {available}"
    )]
    InsufficientStock {
        /// Product being consumed
        product_id: Uuid,
        /// Quantity requested across all lines
        requested: u64,
        /// Quantity currently on hand
        available: u64,
    },

    /// Purchase total exceeds the credit's remaining amount
    #[error("Insufficient balance: requested {requested}, remaining {remaining}")]
    InsufficientBalance {
        /// Purchase total
        requested: Amount,
        /// Remaining credit amount
        remaining: Amount,
    },

    /// Malformed input (non-positive amount, unknown enum value, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Identity lookup collaborator failed
    #[error("Identity lookup failed: {0}")]
    Identity(String),

    /// Stored state breaks a ledger invariant
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for rejections caused by the request rather than the store
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::Conflict(_)
                | Error::AlreadyPaid(_)
                | Error::InactiveCredit(_)
                | Error::InsufficientStock { .. }
                | Error::InsufficientBalance { .. }
                | Error::Validation(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let id = Uuid::nil();
        let err = Error::not_found("cycle", id);
        assert_eq!(
            err.to_string(),
            "cycle not found: 00000000-0000-0000-0000-000000000000"
        );
        assert!(err.is_business_rejection());
    }

    #[test]
    fn test_storage_is_not_business_rejection() {
        let err = Error::Storage("disk full".to_string());
        assert!(!err.is_business_rejection());
    }
}
