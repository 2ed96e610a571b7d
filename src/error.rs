//! Top-level error returned by [`WalletService`](crate::WalletService).

use thiserror::Error;

use crate::config::ConfigError;
use crate::intake::DepositError;
use crate::ledger::LedgerError;
use crate::model::Role;
use crate::registry::RegistryError;
use crate::settlement::SettlementError;
use crate::verification::VerificationError;
use crate::withdrawal::WithdrawalError;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("deposit failed: {0}")]
    Deposit(#[from] DepositError),

    #[error("withdrawal failed: {0}")]
    Withdrawal(#[from] WithdrawalError),

    #[error("verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("bank account operation failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("settlement failed: {0}")]
    Settlement(#[from] SettlementError),

    #[error("ledger failure: {0}")]
    Ledger(#[from] LedgerError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("a {role:?} account may not {operation}")]
    Forbidden { role: Role, operation: &'static str },
}
