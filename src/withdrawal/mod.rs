//! Withdrawal orchestration.
//!
//! A withdrawal is validated, written to the ledger as a pending debit, then handed
//! to the payout gateway (or left for back-office processing in manual mode). The
//! balance check and the append happen under the account's ledger lock, so two
//! concurrent requests can never both spend the same funds. The owner's registry
//! lock is held across that step as well, keeping the destination account from
//! being edited or removed between the verified check and the pending entry that
//! pins it.
//!
//! A gateway timeout leaves the entry pending with `payout_state = unknown`. It is
//! then resolved by [`WithdrawalOrchestrator::retry_payout`], which reuses the same
//! idempotency key, or by [`WithdrawalOrchestrator::settle_withdrawal`].

use std::sync::Arc;

use tracing::{info, warn};

use crate::Amount;
use crate::balance::FundingSource;
use crate::config::{PayoutMode, WalletConfig};
use crate::event::{EventBus, WalletEvent};
use crate::gateway::{GatewayError, PayoutGateway, TransferRequest, with_timeout};
use crate::ledger::{LedgerError, LedgerStore};
use crate::model::{
    AccountId, BankAccountId, BankDetails, EntryId, EntryKind, EntryStatus, LedgerEntry, Metadata,
    NewEntry, meta,
};
use crate::registry::BankAccountRegistry;

mod error;
pub use error::WithdrawalError;

/// Values of the `payout_state` metadata key.
pub mod payout_state {
    pub const DISPATCHING: &str = "dispatching";
    pub const AWAITING_OPERATOR: &str = "awaiting_operator";
    pub const UNKNOWN: &str = "unknown";
    pub const PAID: &str = "paid";
    pub const FAILED: &str = "failed";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalRequest {
    /// Positive amount to pay out.
    pub amount: Amount,
    pub bank_account: BankAccountId,
    pub purpose: String,
}

/// Final word on a payout, from an operator or a gateway callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    Paid { reference: String },
    Declined { reason: String },
}

pub struct WithdrawalOrchestrator {
    ledger: Arc<LedgerStore>,
    registry: Arc<BankAccountRegistry>,
    payouts: Arc<dyn PayoutGateway>,
    config: Arc<WalletConfig>,
    events: EventBus,
}

/// Public API
impl WithdrawalOrchestrator {
    pub fn new(
        ledger: Arc<LedgerStore>,
        registry: Arc<BankAccountRegistry>,
        payouts: Arc<dyn PayoutGateway>,
        config: Arc<WalletConfig>,
        events: EventBus,
    ) -> Self {
        Self {
            ledger,
            registry,
            payouts,
            config,
            events,
        }
    }

    /// Withdraw `request.amount` from `owner`'s `source` funds to a verified bank
    /// account.
    ///
    /// Every validation failure is reported before the gateway is contacted. On a
    /// gateway error the returned [`WithdrawalError::Gateway`] names the entry: it
    /// is `failed` after a decline and still `pending` after a timeout.
    pub async fn request_withdrawal(
        &self,
        owner: AccountId,
        source: FundingSource,
        request: WithdrawalRequest,
    ) -> Result<LedgerEntry, WithdrawalError> {
        let result = self.apply_request(owner, source, request).await;
        if let Err(e) = &result {
            info!(owner = %owner, error = %e, "withdrawal rejected");
        }
        result
    }

    /// Complete or fail a pending withdrawal.
    ///
    /// A payout the gateway is still handling cannot be settled from outside; it
    /// becomes settleable once its outcome is known or has been marked unknown.
    pub async fn settle_withdrawal(
        &self,
        entry: EntryId,
        outcome: PayoutOutcome,
    ) -> Result<LedgerEntry, WithdrawalError> {
        let pending = self.pending_withdrawal(entry).await?;
        match outcome {
            PayoutOutcome::Paid { reference } => self.complete(&pending, reference, settleable).await,
            PayoutOutcome::Declined { reason } => self.fail(&pending, reason, settleable).await,
        }
    }

    /// Send again a gateway payout whose outcome is unknown.
    ///
    /// The idempotency key is the one used the first time, so a gateway that did
    /// act on the original request will not pay twice.
    pub async fn retry_payout(
        &self,
        owner: AccountId,
        entry: EntryId,
    ) -> Result<LedgerEntry, WithdrawalError> {
        let pending = self.pending_withdrawal(entry).await?;
        if pending.account != owner {
            return Err(WithdrawalError::EntryNotFound(entry));
        }
        retryable(&pending)?;
        let bank_account = pending
            .bank_account()
            .ok_or(WithdrawalError::NotRetryable(entry))?;
        let destination = self
            .registry
            .get(owner, bank_account)
            .await
            .map_err(|_| WithdrawalError::AccountNotFound(bank_account))?;

        info!(owner = %owner, entry = %entry, "retrying payout");
        let pending = self
            .ledger
            .annotate_where(entry, state(payout_state::DISPATCHING), retryable)
            .await?;
        self.dispatch(pending, destination.details).await
    }
}

/// Private API
impl WithdrawalOrchestrator {
    async fn apply_request(
        &self,
        owner: AccountId,
        source: FundingSource,
        request: WithdrawalRequest,
    ) -> Result<LedgerEntry, WithdrawalError> {
        let WithdrawalRequest {
            amount,
            bank_account,
            purpose,
        } = request;

        if !amount.is_positive() {
            return Err(WithdrawalError::InvalidAmount(amount));
        }
        let (min, max) = (
            self.config.minimum_withdrawal_amount,
            self.config.maximum_withdrawal_amount,
        );
        if amount < min || amount > max {
            return Err(WithdrawalError::OutOfBounds { amount, min, max });
        }

        let book = self.registry.lock_existing(owner).await;
        let destination = book.as_ref().and_then(|book| book.get(bank_account)).cloned();

        let mode = self.config.payout_mode;
        let description = match (purpose.trim(), &destination) {
            ("", Some(destination)) => format!(
                "Withdrawal to {} {}",
                destination.details.bank_name,
                destination.masked_number()
            ),
            ("", None) => "Withdrawal".to_string(),
            (purpose, _) => purpose.to_string(),
        };
        let mut entry = NewEntry::new(owner, EntryKind::Withdrawal, -amount, description)
            .with_meta(meta::BANK_ACCOUNT_ID, bank_account.to_string())
            .with_meta(meta::PAYOUT_MODE, mode.as_str())
            .with_meta(
                meta::PAYOUT_STATE,
                match mode {
                    PayoutMode::Gateway => payout_state::DISPATCHING,
                    PayoutMode::Manual => payout_state::AWAITING_OPERATOR,
                },
            );
        if !purpose.trim().is_empty() {
            entry = entry.with_meta(meta::PURPOSE, purpose.trim());
        }
        if source == FundingSource::Earnings {
            entry = entry.with_meta(meta::EARNINGS_TYPE, meta::EARNINGS_WITHDRAWAL);
        }

        let pending = self
            .ledger
            .append_with(entry, |balances| {
                let available = balances.withdrawable(source);
                if available < amount {
                    return Err(WithdrawalError::InsufficientBalance {
                        available,
                        requested: amount,
                    });
                }
                match &destination {
                    None => Err(WithdrawalError::AccountNotFound(bank_account)),
                    Some(account) if !account.is_verified => {
                        Err(WithdrawalError::AccountNotVerified(bank_account))
                    }
                    Some(_) => Ok(()),
                }
            })
            .await?
            .into_entry();
        drop(book);
        let destination = destination.ok_or(WithdrawalError::AccountNotFound(bank_account))?;

        info!(
            owner = %owner,
            entry = %pending.id,
            bank_account = %bank_account,
            amount = %amount,
            mode = mode.as_str(),
            "withdrawal reserved"
        );

        match mode {
            PayoutMode::Manual => Ok(pending),
            PayoutMode::Gateway => self.dispatch(pending, destination.details).await,
        }
    }

    /// Ask the gateway to pay out `pending` and record what it said.
    async fn dispatch(
        &self,
        pending: LedgerEntry,
        beneficiary: BankDetails,
    ) -> Result<LedgerEntry, WithdrawalError> {
        let request = TransferRequest {
            idempotency_key: payout_key(pending.id),
            amount: pending.amount.abs(),
            beneficiary,
            narration: pending.description.clone(),
        };

        match with_timeout(self.config.gateway_timeout(), self.payouts.transfer(request)).await {
            Ok(receipt) => self.complete(&pending, receipt.reference, dispatching).await,
            Err(source @ GatewayError::Timeout(_)) => {
                self.ledger
                    .annotate(pending.id, state(payout_state::UNKNOWN))
                    .await?;
                warn!(
                    account = %pending.account,
                    entry = %pending.id,
                    error = %source,
                    "payout outcome unknown, withdrawal left pending"
                );
                Err(WithdrawalError::Gateway {
                    entry: pending.id,
                    source,
                })
            }
            Err(source) => {
                self.fail(&pending, source.to_string(), dispatching).await?;
                Err(WithdrawalError::Gateway {
                    entry: pending.id,
                    source,
                })
            }
        }
    }

    async fn complete(
        &self,
        pending: &LedgerEntry,
        reference: String,
        check: fn(&LedgerEntry) -> Result<(), WithdrawalError>,
    ) -> Result<LedgerEntry, WithdrawalError> {
        let mut annotations = state(payout_state::PAID);
        annotations.insert(meta::PAYOUT_REFERENCE.to_string(), reference);
        let entry = self
            .ledger
            .transition_where(pending.id, EntryStatus::Completed, annotations, check)
            .await?;

        info!(account = %entry.account, entry = %entry.id, amount = %entry.amount, "withdrawal completed");
        self.events.publish(WalletEvent::WithdrawalCompleted {
            account: entry.account,
            entry: entry.id,
            amount: entry.amount.abs(),
        });
        Ok(entry)
    }

    async fn fail(
        &self,
        pending: &LedgerEntry,
        reason: String,
        check: fn(&LedgerEntry) -> Result<(), WithdrawalError>,
    ) -> Result<LedgerEntry, WithdrawalError> {
        let mut annotations = state(payout_state::FAILED);
        annotations.insert(meta::FAILURE_REASON.to_string(), reason.clone());
        let entry = self
            .ledger
            .transition_where(pending.id, EntryStatus::Failed, annotations, check)
            .await?;

        warn!(account = %entry.account, entry = %entry.id, reason = %reason, "withdrawal failed");
        self.events.publish(WalletEvent::WithdrawalFailed {
            account: entry.account,
            entry: entry.id,
            reason,
        });
        Ok(entry)
    }

    async fn pending_withdrawal(&self, id: EntryId) -> Result<LedgerEntry, WithdrawalError> {
        let entry = self.ledger.get(id).await.map_err(|e| match e {
            LedgerError::NotFound(id) => WithdrawalError::EntryNotFound(id),
            other => other.into(),
        })?;
        if entry.kind != EntryKind::Withdrawal {
            return Err(WithdrawalError::NotWithdrawal(id));
        }
        if entry.status != EntryStatus::Pending {
            return Err(WithdrawalError::NotPending(id));
        }
        Ok(entry)
    }
}

/// Gateway idempotency key of a withdrawal; stable for the life of the entry.
pub fn payout_key(entry: EntryId) -> String {
    format!("withdrawal-{entry}")
}

/// Outside callers may settle anything the gateway is not working on.
fn settleable(entry: &LedgerEntry) -> Result<(), WithdrawalError> {
    match entry.meta(meta::PAYOUT_STATE) {
        Some(payout_state::DISPATCHING) => Err(WithdrawalError::PayoutInFlight(entry.id)),
        _ => Ok(()),
    }
}

fn retryable(entry: &LedgerEntry) -> Result<(), WithdrawalError> {
    match entry.meta(meta::PAYOUT_STATE) {
        Some(payout_state::UNKNOWN) => Ok(()),
        _ => Err(WithdrawalError::NotRetryable(entry.id)),
    }
}

/// The dispatcher only settles the payout it sent.
fn dispatching(entry: &LedgerEntry) -> Result<(), WithdrawalError> {
    match entry.meta(meta::PAYOUT_STATE) {
        Some(payout_state::DISPATCHING) => Ok(()),
        _ => Err(WithdrawalError::NotPending(entry.id)),
    }
}

fn state(value: &str) -> Metadata {
    Metadata::from([(meta::PAYOUT_STATE.to_string(), value.to_string())])
}
