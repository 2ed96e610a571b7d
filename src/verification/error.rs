use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::model::BankAccountId;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("bank account {0} is already verified")]
    AlreadyVerified(BankAccountId),

    #[error("a verification for bank account {bank_account} is already in progress")]
    RateLimited {
        bank_account: BankAccountId,
        /// When the outstanding attempt lapses, if known.
        until: Option<DateTime<Utc>>,
    },

    #[error("no active verification for bank account {0}")]
    NoActiveVerification(BankAccountId),

    #[error("verification for bank account {0} has expired")]
    Expired(BankAccountId),

    #[error("incorrect code, {remaining} attempts remaining")]
    IncorrectCode { remaining: u32 },

    #[error("amount does not match, {remaining} attempts remaining")]
    IncorrectAmount { remaining: u32 },

    #[error("verification of bank account {0} was reset while its payout was in flight")]
    Superseded(BankAccountId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("verification gateway failed: {0}")]
    Gateway(#[from] GatewayError),
}
