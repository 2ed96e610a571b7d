//! Bank account verification.
//!
//! Three ways to prove an owner controls a bank account:
//!
//! - **OTP** (`unverified → otp_sent → verified`): a numeric code is sent by SMS or
//!   email and must be echoed back before it expires, within a fixed number of tries.
//! - **Bank API**: one synchronous registry lookup; a mismatch returns a reason and
//!   changes nothing.
//! - **Micro-deposit** (`unverified → payout_initiated → verified`): a random small
//!   amount is paid into the account and the owner reports what arrived.
//!
//! At most one attempt is live per bank account. Starting another while one is
//! outstanding is rejected rather than replacing it, so two codes or two
//! micro-deposits are never valid at once. Exhausting the tries or letting the attempt
//! expire sends the account back to unverified; [`VerificationEngine::reset`]
//! discards an attempt immediately. External calls are made once, never retried
//! here.
//!
//! Each bank account has its own attempt slot behind an async mutex, so attempts on
//! different accounts never wait on each other. A slot lock is taken before an
//! owner's registry lock, never after.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Amount;
use crate::clock::Clock;
use crate::config::WalletConfig;
use crate::event::{EventBus, WalletEvent};
use crate::gateway::{
    BankDirectory, DirectoryMatch, Gateways, MismatchReason, OtpChannel, OtpDispatcher,
    PayoutGateway, TransferRequest, with_timeout,
};
use crate::model::{AccountId, BankAccount, BankAccountId, VerificationMethod};
use crate::registry::{BankAccountRegistry, RegistryError};

mod attempt;
use attempt::{Challenge, VerificationAttempt};

mod error;
pub use error::VerificationError;

/// Where a bank account stands, without revealing codes or amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    OtpSent {
        method: VerificationMethod,
        expires_at: DateTime<Utc>,
        attempts_remaining: u32,
    },
    /// `reference` and `expires_at` are `None` while the payout is still being
    /// dispatched.
    PayoutInitiated {
        reference: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        attempts_remaining: u32,
    },
    Verified {
        method: VerificationMethod,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OtpChallenge {
    pub bank_account: BankAccountId,
    pub method: VerificationMethod,
    pub expires_at: DateTime<Utc>,
    pub attempts_remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PennyDropChallenge {
    pub bank_account: BankAccountId,
    pub reference: String,
    pub expires_at: DateTime<Utc>,
    pub attempts_remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankApiOutcome {
    Verified(BankAccount),
    Rejected(MismatchReason),
}

#[derive(Debug)]
enum Slot {
    Live(VerificationAttempt),
    /// Micro-deposit payout in flight; the attempt is installed when it returns.
    Dispatching { generation: u64 },
}

/// One bank account's outstanding attempt, if any.
type SlotHandle = Arc<Mutex<Option<Slot>>>;
type SlotGuard = OwnedMutexGuard<Option<Slot>>;

pub struct VerificationEngine {
    registry: Arc<BankAccountRegistry>,
    attempts: RwLock<HashMap<BankAccountId, SlotHandle>>,
    generation: AtomicU64,
    otp: Arc<dyn OtpDispatcher>,
    payouts: Arc<dyn PayoutGateway>,
    directory: Arc<dyn BankDirectory>,
    config: Arc<WalletConfig>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

/// Public API
impl VerificationEngine {
    pub fn new(
        registry: Arc<BankAccountRegistry>,
        gateways: &Gateways,
        config: Arc<WalletConfig>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            attempts: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(1),
            otp: Arc::clone(&gateways.otp),
            payouts: Arc::clone(&gateways.payouts),
            directory: Arc::clone(&gateways.directory),
            config,
            clock,
            events,
        }
    }

    /// Issue a one-time code for `id` and send it to `destination` over `channel`.
    ///
    /// Delivery is fire-and-forget: a failed dispatch is logged, and the owner can
    /// reset and try again.
    pub async fn initiate_otp(
        &self,
        owner: AccountId,
        id: BankAccountId,
        channel: OtpChannel,
        destination: &str,
    ) -> Result<OtpChallenge, VerificationError> {
        if destination.trim().is_empty() {
            return Err(VerificationError::Validation(
                "an OTP destination is required".into(),
            ));
        }

        let now = self.clock.now();
        let (mut slot, account) = self.lock_unverified(owner, id).await?;
        Self::ensure_idle((*slot).as_ref(), id, account.revision, now)?;

        let method = match channel {
            OtpChannel::Sms => VerificationMethod::Sms,
            OtpChannel::Email => VerificationMethod::Email,
        };
        let code = attempt::generate_code(self.config.otp_code_length);
        let salt = attempt::generate_salt();
        let fresh = VerificationAttempt {
            bank_account: id,
            method,
            challenge: Challenge::Otp {
                code_hash: attempt::hash_code(&salt, id, &code),
                salt,
            },
            expires_at: now + self.config.otp_expiry(),
            attempts_remaining: self.config.otp_max_attempts,
            revision: account.revision,
        };
        let challenge = OtpChallenge {
            bank_account: id,
            method,
            expires_at: fresh.expires_at,
            attempts_remaining: fresh.attempts_remaining,
        };
        *slot = Some(Slot::Live(fresh));
        drop(slot);

        info!(owner = %owner, bank_account = %id, %method, "otp issued");

        let dispatched = with_timeout(
            self.config.gateway_timeout(),
            self.otp.dispatch(channel, destination.trim(), &code),
        )
        .await;
        if let Err(e) = dispatched {
            warn!(owner = %owner, bank_account = %id, error = %e, "otp dispatch failed");
        }

        Ok(challenge)
    }

    /// Check a one-time code.
    ///
    /// A wrong code uses up one try; the last wrong try discards the attempt, after
    /// which even the right code is refused until a new one is issued.
    pub async fn verify_otp(
        &self,
        owner: AccountId,
        id: BankAccountId,
        code: &str,
    ) -> Result<BankAccount, VerificationError> {
        let now = self.clock.now();
        let (mut slot, account) = self.lock_unverified(owner, id).await?;

        let mut live = Self::take_live(&mut slot, id, account.revision, now)?;
        if !live.is_otp() {
            *slot = Some(Slot::Live(live));
            return Err(VerificationError::NoActiveVerification(id));
        }

        if !live.matches_code(code) {
            live.attempts_remaining = live.attempts_remaining.saturating_sub(1);
            let remaining = live.attempts_remaining;
            if remaining > 0 {
                *slot = Some(Slot::Live(live));
            }
            info!(owner = %owner, bank_account = %id, remaining, "incorrect otp");
            return Err(VerificationError::IncorrectCode { remaining });
        }

        self.complete(owner, id, live.revision, live.method).await
    }

    /// Verify `id` against the bank registry in one call.
    pub async fn verify_with_bank_api(
        &self,
        owner: AccountId,
        id: BankAccountId,
    ) -> Result<BankApiOutcome, VerificationError> {
        let account = self.unverified(owner, id).await?;

        let lookup = with_timeout(
            self.config.gateway_timeout(),
            self.directory.lookup(&account.details),
        )
        .await?;

        match lookup {
            DirectoryMatch::Mismatch(reason) => {
                info!(owner = %owner, bank_account = %id, ?reason, "bank lookup rejected account");
                Ok(BankApiOutcome::Rejected(reason))
            }
            DirectoryMatch::Matched => {
                let (mut slot, _) = self.lock_slot(owner, id).await?;
                *slot = None;
                let verified = self
                    .complete(owner, id, account.revision, VerificationMethod::BankApi)
                    .await?;
                Ok(BankApiOutcome::Verified(verified))
            }
        }
    }

    /// Pay a random amount between ₹1 and ₹10 into `id` for the owner to confirm.
    pub async fn initiate_penny_drop(
        &self,
        owner: AccountId,
        id: BankAccountId,
    ) -> Result<PennyDropChallenge, VerificationError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let (handle, account) = {
            let (mut slot, account) = self.lock_unverified(owner, id).await?;
            Self::ensure_idle((*slot).as_ref(), id, account.revision, self.clock.now())?;
            *slot = Some(Slot::Dispatching { generation });
            (Arc::clone(OwnedMutexGuard::mutex(&slot)), account)
        };

        let amount = attempt::random_micro_deposit();
        let request = TransferRequest {
            idempotency_key: format!("penny-drop-{id}-{generation}"),
            amount,
            beneficiary: account.details.clone(),
            narration: "Bank account verification".into(),
        };
        let result = with_timeout(self.config.gateway_timeout(), self.payouts.transfer(request)).await;

        let mut slot = handle.lock().await;
        let registered = self
            .attempts
            .read()
            .await
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, &handle));
        let still_ours = registered
            && matches!(
                &*slot,
                Some(Slot::Dispatching { generation: g }) if *g == generation
            );

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(e) => {
                if still_ours {
                    *slot = None;
                }
                warn!(owner = %owner, bank_account = %id, error = %e, "micro-deposit payout failed");
                return Err(e.into());
            }
        };

        if !still_ours {
            warn!(
                owner = %owner,
                bank_account = %id,
                reference = %receipt.reference,
                "micro-deposit sent after the attempt was reset"
            );
            return Err(VerificationError::Superseded(id));
        }

        let fresh = VerificationAttempt {
            bank_account: id,
            method: VerificationMethod::MicroDeposit,
            challenge: Challenge::MicroDeposit {
                expected: amount,
                reference: receipt.reference.clone(),
            },
            expires_at: self.clock.now() + self.config.micro_deposit_expiry(),
            attempts_remaining: self.config.micro_deposit_max_attempts,
            revision: account.revision,
        };
        let challenge = PennyDropChallenge {
            bank_account: id,
            reference: receipt.reference,
            expires_at: fresh.expires_at,
            attempts_remaining: fresh.attempts_remaining,
        };
        *slot = Some(Slot::Live(fresh));

        info!(
            owner = %owner,
            bank_account = %id,
            reference = %challenge.reference,
            "micro-deposit sent"
        );
        Ok(challenge)
    }

    /// Check the amount the owner saw arrive. Comparison is exact to the paisa.
    pub async fn confirm_penny_drop(
        &self,
        owner: AccountId,
        id: BankAccountId,
        amount: Amount,
    ) -> Result<BankAccount, VerificationError> {
        let now = self.clock.now();
        let (mut slot, account) = self.lock_unverified(owner, id).await?;

        let mut live = Self::take_live(&mut slot, id, account.revision, now)?;
        if live.is_otp() {
            *slot = Some(Slot::Live(live));
            return Err(VerificationError::NoActiveVerification(id));
        }

        if !live.matches_amount(amount) {
            live.attempts_remaining = live.attempts_remaining.saturating_sub(1);
            let remaining = live.attempts_remaining;
            if remaining > 0 {
                *slot = Some(Slot::Live(live));
            }
            info!(owner = %owner, bank_account = %id, remaining, "incorrect micro-deposit amount");
            return Err(VerificationError::IncorrectAmount { remaining });
        }

        self.complete(owner, id, live.revision, VerificationMethod::MicroDeposit)
            .await
    }

    /// Discard any outstanding attempt for `id`. Returns whether one existed.
    pub async fn reset(&self, owner: AccountId, id: BankAccountId) -> Result<bool, VerificationError> {
        self.registry.get(owner, id).await?;
        let discarded = match self.existing_slot(id).await {
            Some(mut slot) => slot.take().is_some(),
            None => false,
        };
        if discarded {
            info!(owner = %owner, bank_account = %id, "verification attempt reset");
        }
        Ok(discarded)
    }

    pub async fn status(
        &self,
        owner: AccountId,
        id: BankAccountId,
    ) -> Result<VerificationStatus, VerificationError> {
        let now = self.clock.now();
        let slot = self.existing_slot(id).await;
        let account = self.registry.get(owner, id).await?;

        if account.is_verified {
            return Ok(VerificationStatus::Verified {
                method: account.verification_method,
            });
        }

        let status = match slot.as_deref().and_then(Option::as_ref) {
            Some(Slot::Live(live)) if !live.is_expired(now) && live.revision == account.revision => {
                match &live.challenge {
                    Challenge::Otp { .. } => VerificationStatus::OtpSent {
                        method: live.method,
                        expires_at: live.expires_at,
                        attempts_remaining: live.attempts_remaining,
                    },
                    Challenge::MicroDeposit { reference, .. } => VerificationStatus::PayoutInitiated {
                        reference: Some(reference.clone()),
                        expires_at: Some(live.expires_at),
                        attempts_remaining: live.attempts_remaining,
                    },
                }
            }
            Some(Slot::Dispatching { .. }) => VerificationStatus::PayoutInitiated {
                reference: None,
                expires_at: None,
                attempts_remaining: self.config.micro_deposit_max_attempts,
            },
            _ => VerificationStatus::Unverified,
        };
        Ok(status)
    }

    /// Discard the attempt of a bank account that no longer exists.
    pub(crate) async fn forget(&self, id: BankAccountId) {
        self.attempts.write().await.remove(&id);
    }

    /// Drop every expired attempt. Returns how many were removed.
    ///
    /// Slots that are busy are left for the next sweep; empty slots nobody else
    /// holds are released.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut swept = 0;
        self.attempts.write().await.retain(|_, handle| {
            let Ok(mut slot) = handle.try_lock() else {
                return true;
            };
            if matches!(&*slot, Some(Slot::Live(live)) if live.is_expired(now)) {
                *slot = None;
                swept += 1;
            }
            slot.is_some() || Arc::strong_count(handle) > 1
        });
        if swept > 0 {
            debug!(swept, "expired verification attempts removed");
        }
        swept
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `period` until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                engine.sweep_expired().await;
            }
        })
    }
}

/// Private API
impl VerificationEngine {
    /// Load an owned bank account that still needs verifying.
    async fn unverified(&self, owner: AccountId, id: BankAccountId) -> Result<BankAccount, VerificationError> {
        let account = self.registry.get(owner, id).await?;
        if account.is_verified {
            return Err(VerificationError::AlreadyVerified(id));
        }
        Ok(account)
    }

    /// Lock `id`'s attempt slot, then load the account under it. A slot is only
    /// created for a bank account `owner` actually holds.
    async fn lock_slot(
        &self,
        owner: AccountId,
        id: BankAccountId,
    ) -> Result<(SlotGuard, BankAccount), VerificationError> {
        let existing = self.attempts.read().await.get(&id).cloned();
        let handle = match existing {
            Some(handle) => handle,
            None => {
                self.registry.get(owner, id).await?;
                Arc::clone(self.attempts.write().await.entry(id).or_default())
            }
        };
        let slot = handle.lock_owned().await;
        let account = self.registry.get(owner, id).await?;
        Ok((slot, account))
    }

    async fn lock_unverified(
        &self,
        owner: AccountId,
        id: BankAccountId,
    ) -> Result<(SlotGuard, BankAccount), VerificationError> {
        let (slot, account) = self.lock_slot(owner, id).await?;
        if account.is_verified {
            return Err(VerificationError::AlreadyVerified(id));
        }
        Ok((slot, account))
    }

    async fn existing_slot(&self, id: BankAccountId) -> Option<SlotGuard> {
        let handle = self.attempts.read().await.get(&id).cloned()?;
        Some(handle.lock_owned().await)
    }

    /// Refuse to start a new attempt while another is outstanding. Attempts issued
    /// against older bank details do not count.
    fn ensure_idle(
        slot: Option<&Slot>,
        id: BankAccountId,
        revision: u32,
        now: DateTime<Utc>,
    ) -> Result<(), VerificationError> {
        match slot {
            Some(Slot::Live(live)) if !live.is_expired(now) && live.revision == revision => Err(VerificationError::RateLimited {
                bank_account: id,
                until: Some(live.expires_at),
            }),
            Some(Slot::Dispatching { .. }) => Err(VerificationError::RateLimited {
                bank_account: id,
                until: None,
            }),
            _ => Ok(()),
        }
    }

    /// Take the live attempt out of `slot`, discarding it when it has expired or was
    /// issued against details that have since changed.
    fn take_live(
        slot: &mut Option<Slot>,
        id: BankAccountId,
        revision: u32,
        now: DateTime<Utc>,
    ) -> Result<VerificationAttempt, VerificationError> {
        match slot.take() {
            Some(Slot::Live(live)) if live.revision != revision => {
                Err(VerificationError::NoActiveVerification(id))
            }
            Some(Slot::Live(live)) if live.is_expired(now) => Err(VerificationError::Expired(id)),
            Some(Slot::Live(live)) => Ok(live),
            Some(dispatching @ Slot::Dispatching { .. }) => {
                *slot = Some(dispatching);
                Err(VerificationError::NoActiveVerification(id))
            }
            None => Err(VerificationError::NoActiveVerification(id)),
        }
    }

    /// Mark `id` verified and announce it.
    async fn complete(
        &self,
        owner: AccountId,
        id: BankAccountId,
        revision: u32,
        method: VerificationMethod,
    ) -> Result<BankAccount, VerificationError> {
        let mut book = self
            .registry
            .lock_existing(owner)
            .await
            .ok_or(RegistryError::NotFound(id))?;
        let account = BankAccountRegistry::mark_verified(&mut book, id, revision, method)
            .map_err(|e| match e {
                RegistryError::Conflict(_) => VerificationError::NoActiveVerification(id),
                other => other.into(),
            })?;
        drop(book);

        info!(owner = %owner, bank_account = %id, %method, "bank account verified");
        self.events.publish(WalletEvent::VerificationSucceeded {
            account: owner,
            bank_account: id,
            method,
        });
        Ok(account)
    }
}
