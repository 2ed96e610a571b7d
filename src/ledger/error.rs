//! Error types for ledger storage.

use thiserror::Error;

use crate::model::{AccountId, EntryId, EntryStatus};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid entry: {0}")]
    Validation(String),

    #[error("entry {id} cannot move from {from:?} to {to:?}")]
    InvalidStateTransition {
        id: EntryId,
        from: EntryStatus,
        to: EntryStatus,
    },

    #[error("entry {0} would overflow the balances of account {1}")]
    Overflow(EntryId, AccountId),

    #[error("entry {0} not found")]
    NotFound(EntryId),

    #[error("idempotency key '{0}' belongs to another account")]
    KeyConflict(String),

    #[error("journal write failed: {0}")]
    Journal(#[from] std::io::Error),

    #[error("journal line {line} is corrupt: {source}")]
    JournalCorrupt {
        line: usize,
        source: serde_json::Error,
    },
}
