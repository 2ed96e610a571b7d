//! Error types for withdrawals.

use thiserror::Error;

use crate::Amount;
use crate::gateway::GatewayError;
use crate::ledger::LedgerError;
use crate::model::{BankAccountId, EntryId};

#[derive(Debug, Error)]
pub enum WithdrawalError {
    #[error("withdrawal amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("withdrawal amount {amount} is outside the allowed range {min} to {max}")]
    OutOfBounds { amount: Amount, min: Amount, max: Amount },

    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: Amount, requested: Amount },

    #[error("bank account {0} not found")]
    AccountNotFound(BankAccountId),

    #[error("bank account {0} is not verified")]
    AccountNotVerified(BankAccountId),

    #[error("withdrawal {0} not found")]
    EntryNotFound(EntryId),

    #[error("entry {0} is not a withdrawal")]
    NotWithdrawal(EntryId),

    #[error("withdrawal {0} is already settled")]
    NotPending(EntryId),

    #[error("payout for withdrawal {0} is still being dispatched")]
    PayoutInFlight(EntryId),

    #[error("withdrawal {0} has no payout awaiting confirmation")]
    NotRetryable(EntryId),

    #[error("payout for withdrawal {entry} failed: {source}")]
    Gateway {
        entry: EntryId,
        #[source]
        source: GatewayError,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
