//! Payment intake: wallet top-ups confirmed by the payment gateway.
//!
//! The gateway reference doubles as the idempotency key, so a webhook delivered
//! twice credits the wallet once.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::Amount;
use crate::event::{EventBus, WalletEvent};
use crate::ledger::{Appended, LedgerError, LedgerStore};
use crate::model::{AccountId, EntryKind, LedgerEntry, NewEntry, meta};

#[derive(Debug, Error)]
pub enum DepositError {
    #[error("deposit amount must be positive, got {0}")]
    InvalidAmount(Amount),
    #[error("a gateway reference is required")]
    MissingReference,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub struct PaymentIntake {
    ledger: Arc<LedgerStore>,
    events: EventBus,
}

impl PaymentIntake {
    pub fn new(ledger: Arc<LedgerStore>, events: EventBus) -> Self {
        Self { ledger, events }
    }

    /// Credit a confirmed gateway payment to `account`'s wallet.
    ///
    /// A reference seen before returns the entry it created; the caller cannot tell
    /// a replay from the first delivery except via [`Appended::is_created`].
    pub async fn record_deposit(
        &self,
        account: AccountId,
        amount: Amount,
        gateway_reference: &str,
    ) -> Result<Appended, DepositError> {
        if !amount.is_positive() {
            return Err(DepositError::InvalidAmount(amount));
        }
        let reference = gateway_reference.trim();
        if reference.is_empty() {
            return Err(DepositError::MissingReference);
        }

        let entry = NewEntry::new(account, EntryKind::Deposit, amount, "Wallet top-up")
            .with_meta(meta::GATEWAY_REFERENCE, reference)
            .with_idempotency_key(deposit_key(reference));
        let appended = self.ledger.append_with(entry, |_| Ok::<_, DepositError>(())).await?;

        match &appended {
            Appended::Created(entry) => {
                self.announce(entry);
            }
            Appended::Existing(entry) => {
                info!(account = %account, entry = %entry.id, reference, "deposit already recorded");
            }
        }
        Ok(appended)
    }

    fn announce(&self, entry: &LedgerEntry) {
        self.events.publish(WalletEvent::DepositRecorded {
            account: entry.account,
            entry: entry.id,
            amount: entry.amount,
        });
    }
}

fn deposit_key(reference: &str) -> String {
    format!("deposit:{reference}")
}
