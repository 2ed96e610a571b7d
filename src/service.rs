//! The wallet service: one entry point wiring the ledger, registry, verification,
//! withdrawals and intake together.
//!
//! Every customer- or designer-facing operation takes the authenticated [`Caller`]
//! and acts only on the caller's own account. Account ids in request payloads are
//! never trusted. Operations without a `Caller` are for trusted back-office and
//! webhook paths.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::Amount;
use crate::balance::{BalanceCache, BalanceCalculator, Balances, FundingSource};
use crate::clock::Clock;
use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::event::{EventBus, WalletEvent};
use crate::gateway::{Gateways, OtpChannel};
use crate::intake::PaymentIntake;
use crate::ledger::{Appended, EntryFilter, LedgerStore, Page};
use crate::model::{
    AccountId, BankAccount, BankAccountId, BankDetails, EntryId, LedgerEntry, Role,
};
use crate::registry::BankAccountRegistry;
use crate::settlement::Settlement;
use crate::verification::{
    BankApiOutcome, OtpChallenge, PennyDropChallenge, VerificationEngine, VerificationStatus,
};
use crate::withdrawal::{PayoutOutcome, WithdrawalOrchestrator, WithdrawalRequest};

/// The authenticated principal behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub account: AccountId,
    pub role: Role,
}

impl Caller {
    pub fn customer(account: AccountId) -> Self {
        Self {
            account,
            role: Role::Customer,
        }
    }

    pub fn designer(account: AccountId) -> Self {
        Self {
            account,
            role: Role::Designer,
        }
    }
}

pub struct WalletService {
    config: Arc<WalletConfig>,
    ledger: Arc<LedgerStore>,
    balances: BalanceCache,
    registry: Arc<BankAccountRegistry>,
    verification: Arc<VerificationEngine>,
    withdrawals: WithdrawalOrchestrator,
    intake: PaymentIntake,
    settlement: Settlement,
    events: EventBus,
}

/// Public API
impl WalletService {
    /// Build a service, replaying the ledger journal when one is configured.
    pub fn new(
        config: WalletConfig,
        gateways: Gateways,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, WalletError> {
        config.validate()?;
        let ledger = match &config.journal_path {
            Some(path) => LedgerStore::open(path, Arc::clone(&clock))?,
            None => LedgerStore::in_memory(Arc::clone(&clock)),
        };

        let config = Arc::new(config);
        let ledger = Arc::new(ledger);
        let events = EventBus::new();
        let registry = Arc::new(BankAccountRegistry::new(
            Arc::clone(&ledger),
            Arc::clone(&clock),
        ));
        let verification = Arc::new(VerificationEngine::new(
            Arc::clone(&registry),
            &gateways,
            Arc::clone(&config),
            clock,
            events.clone(),
        ));
        let withdrawals = WithdrawalOrchestrator::new(
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&gateways.payouts),
            Arc::clone(&config),
            events.clone(),
        );

        info!(
            payout_mode = config.payout_mode.as_str(),
            journal = config.journal_path.is_some(),
            "wallet service ready"
        );

        Ok(Self {
            balances: BalanceCache::new(BalanceCalculator::new(Arc::clone(&ledger))),
            intake: PaymentIntake::new(Arc::clone(&ledger), events.clone()),
            settlement: Settlement::new(Arc::clone(&ledger)),
            config,
            ledger,
            registry,
            verification,
            withdrawals,
            events,
        })
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    /// Domain events for notifiers.
    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    // balances and history

    pub async fn balances(&self, caller: &Caller) -> Balances {
        self.balances.get(caller.account).await
    }

    pub async fn wallet_balance(&self, caller: &Caller) -> Amount {
        self.balances(caller).await.wallet
    }

    pub async fn available_earnings(&self, caller: &Caller) -> Amount {
        self.balances(caller).await.earnings
    }

    /// What the caller could withdraw right now, given their role.
    pub async fn withdrawable(&self, caller: &Caller) -> Amount {
        self.balances(caller)
            .await
            .withdrawable(FundingSource::from(caller.role))
    }

    pub async fn history(&self, caller: &Caller, filter: EntryFilter, page: Page) -> Vec<LedgerEntry> {
        self.ledger.list_by_account(caller.account, filter, page).await
    }

    pub fn history_stream(
        &self,
        caller: &Caller,
        filter: EntryFilter,
        page_size: usize,
        offset: usize,
    ) -> ReceiverStream<LedgerEntry> {
        self.ledger
            .stream_by_account(caller.account, filter, page_size, offset)
    }

    /// Every account with ledger activity. Back-office only.
    pub async fn accounts(&self) -> Vec<AccountId> {
        self.ledger.accounts().await
    }

    /// Balances of any account. Back-office only.
    pub async fn account_balances(&self, account: AccountId) -> Balances {
        self.balances.get(account).await
    }

    // money in

    /// Gateway webhook: credit a confirmed top-up.
    pub async fn record_deposit(
        &self,
        account: AccountId,
        amount: Amount,
        gateway_reference: &str,
    ) -> Result<Appended, WalletError> {
        let result = self
            .intake
            .record_deposit(account, amount, gateway_reference)
            .await;
        self.balances.invalidate(account).await;
        Ok(result?)
    }

    pub async fn pay_for_booking(
        &self,
        caller: &Caller,
        booking_id: &str,
        amount: Amount,
    ) -> Result<Appended, WalletError> {
        Self::require(caller, Role::Customer, "pay for bookings")?;
        let result = self
            .settlement
            .pay_for_booking(caller.account, booking_id, amount)
            .await;
        self.balances.invalidate(caller.account).await;
        Ok(result?)
    }

    /// Booking system: refund part or all of a customer's booking payment.
    pub async fn refund_booking(
        &self,
        customer: AccountId,
        booking_id: &str,
        amount: Amount,
    ) -> Result<Appended, WalletError> {
        let result = self
            .settlement
            .refund_booking(customer, booking_id, amount)
            .await;
        self.balances.invalidate(customer).await;
        Ok(result?)
    }

    /// Booking system: pay a designer for a completed session.
    pub async fn credit_session_earnings(
        &self,
        designer: AccountId,
        booking_id: &str,
        amount: Amount,
    ) -> Result<Appended, WalletError> {
        let result = self
            .settlement
            .credit_session_earnings(designer, booking_id, amount)
            .await;
        self.balances.invalidate(designer).await;
        Ok(result?)
    }

    // bank accounts

    pub async fn add_bank_account(&self, caller: &Caller, details: BankDetails) -> Result<BankAccount, WalletError> {
        Ok(self.registry.add(caller.account, details).await?)
    }

    pub async fn update_bank_account(
        &self,
        caller: &Caller,
        id: BankAccountId,
        details: BankDetails,
    ) -> Result<BankAccount, WalletError> {
        Ok(self.registry.update(caller.account, id, details).await?)
    }

    pub async fn set_primary_bank_account(&self, caller: &Caller, id: BankAccountId) -> Result<BankAccount, WalletError> {
        Ok(self.registry.set_primary(caller.account, id).await?)
    }

    pub async fn remove_bank_account(&self, caller: &Caller, id: BankAccountId) -> Result<BankAccount, WalletError> {
        let removed = self.registry.remove(caller.account, id).await?;
        self.verification.forget(id).await;
        Ok(removed)
    }

    pub async fn bank_account(&self, caller: &Caller, id: BankAccountId) -> Result<BankAccount, WalletError> {
        Ok(self.registry.get(caller.account, id).await?)
    }

    pub async fn bank_accounts(&self, caller: &Caller) -> Vec<BankAccount> {
        self.registry.list_by_owner(caller.account).await
    }

    // verification

    pub async fn initiate_otp(
        &self,
        caller: &Caller,
        id: BankAccountId,
        channel: OtpChannel,
        destination: &str,
    ) -> Result<OtpChallenge, WalletError> {
        Ok(self
            .verification
            .initiate_otp(caller.account, id, channel, destination)
            .await?)
    }

    pub async fn verify_otp(&self, caller: &Caller, id: BankAccountId, code: &str) -> Result<BankAccount, WalletError> {
        Ok(self.verification.verify_otp(caller.account, id, code).await?)
    }

    pub async fn verify_with_bank_api(&self, caller: &Caller, id: BankAccountId) -> Result<BankApiOutcome, WalletError> {
        Ok(self
            .verification
            .verify_with_bank_api(caller.account, id)
            .await?)
    }

    pub async fn initiate_penny_drop(
        &self,
        caller: &Caller,
        id: BankAccountId,
    ) -> Result<PennyDropChallenge, WalletError> {
        Ok(self
            .verification
            .initiate_penny_drop(caller.account, id)
            .await?)
    }

    pub async fn confirm_penny_drop(
        &self,
        caller: &Caller,
        id: BankAccountId,
        amount: Amount,
    ) -> Result<BankAccount, WalletError> {
        Ok(self
            .verification
            .confirm_penny_drop(caller.account, id, amount)
            .await?)
    }

    pub async fn reset_verification(&self, caller: &Caller, id: BankAccountId) -> Result<bool, WalletError> {
        Ok(self.verification.reset(caller.account, id).await?)
    }

    pub async fn verification_status(
        &self,
        caller: &Caller,
        id: BankAccountId,
    ) -> Result<VerificationStatus, WalletError> {
        Ok(self.verification.status(caller.account, id).await?)
    }

    /// Periodically drop expired verification attempts.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        self.verification.spawn_sweeper(period)
    }

    // withdrawals

    /// Withdraw to one of the caller's verified bank accounts. Customers draw on
    /// their wallet, designers on their earnings.
    pub async fn request_withdrawal(
        &self,
        caller: &Caller,
        amount: Amount,
        bank_account: BankAccountId,
        purpose: &str,
    ) -> Result<LedgerEntry, WalletError> {
        let request = WithdrawalRequest {
            amount,
            bank_account,
            purpose: purpose.to_string(),
        };
        let result = self
            .withdrawals
            .request_withdrawal(caller.account, FundingSource::from(caller.role), request)
            .await;
        self.balances.invalidate(caller.account).await;
        Ok(result?)
    }

    pub async fn retry_payout(&self, caller: &Caller, entry: EntryId) -> Result<LedgerEntry, WalletError> {
        let result = self.withdrawals.retry_payout(caller.account, entry).await;
        self.balances.invalidate(caller.account).await;
        Ok(result?)
    }

    /// Back-office or gateway callback: record the final outcome of a payout.
    pub async fn settle_withdrawal(&self, entry: EntryId, outcome: PayoutOutcome) -> Result<LedgerEntry, WalletError> {
        let settled = self.withdrawals.settle_withdrawal(entry, outcome).await?;
        self.balances.invalidate(settled.account).await;
        Ok(settled)
    }
}

/// Private API
impl WalletService {
    fn require(caller: &Caller, role: Role, operation: &'static str) -> Result<(), WalletError> {
        if caller.role != role {
            return Err(WalletError::Forbidden {
                role: caller.role,
                operation,
            });
        }
        Ok(())
    }
}
