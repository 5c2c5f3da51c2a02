use crate::domain::commission::{CommissionEvent, CommissionStatus};
use thiserror::Error;
use uuid::Uuid;

/// Failures reported by the payment processor adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessorError {
    #[error("declined by processor: {0}")]
    Declined(String),
    #[error("processor object not found: {0}")]
    NotFound(String),
    #[error("processor unavailable: {0}")]
    Unavailable(String),
    #[error("processor call timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Illegal transition: cannot apply {event} to a commission in state {from}")]
    IllegalTransition {
        from: CommissionStatus,
        event: CommissionEvent,
    },
    #[error("Payee {0} is not eligible for payouts (account must be active with payouts enabled)")]
    IneligiblePayee(Uuid),
    #[error("Revision limit exceeded: at most {max} revisions are allowed")]
    RevisionLimitExceeded { max: u32 },
    #[error("A payout for commission {0} is already queued")]
    AlreadyQueued(Uuid),
    #[error("Settlement event {0} was already applied")]
    DuplicateSettlementEvent(String),
    #[error("Insufficient liquidity: needed {needed}, remaining {remaining}")]
    InsufficientLiquidity {
        needed: rust_decimal::Decimal,
        remaining: rust_decimal::Decimal,
    },
    #[error("External processor error: {0}")]
    ExternalProcessor(#[from] ProcessorError),
    #[error("Unresolvable settlement event: {0}")]
    UnresolvableEvent(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for SettlementError {
    fn from(e: rocksdb::Error) -> Self {
        SettlementError::StorageError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SettlementError>;
