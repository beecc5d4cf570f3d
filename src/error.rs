use crate::model::PointsTransaction;

/// Failures produced by the ledger, catalog and redemption engines.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: i64, required: i64 },

    #[error("item {item_id} is out of stock")]
    OutOfStock { item_id: String },

    /// An earning transaction already exists for the same source event.
    /// Award paths absorb this; it is never sent to clients.
    #[error("source event already recorded as transaction {}", .existing.id)]
    DuplicateSourceEvent { existing: Box<PointsTransaction> },

    #[error("resource busy, retry later")]
    Busy,

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("storage failure: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable wire code used in IPC error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::OutOfStock { .. } => "out_of_stock",
            Self::DuplicateSourceEvent { .. } => "duplicate_source_event",
            Self::Busy => "busy",
            Self::NotFound { .. } => "not_found",
            Self::InvalidInput(_) => "bad_params",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Storage(_) => "db_query_failed",
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _)
                if matches!(
                    inner.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::Busy
            }
            _ => Self::Storage(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
