//! Balances derived from ledger entries.
//!
//! Completed entries move the settled figures (`wallet`, `earnings`). Pending debits
//! only reserve funds: they are invisible to [`BalanceCalculator::wallet_balance`]
//! and [`BalanceCalculator::available_earnings`] but are subtracted by
//! [`Balances::withdrawable`], so a request in flight cannot be spent twice.
//! Failed entries contribute nothing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::Amount;
use crate::ledger::LedgerStore;
use crate::model::{AccountId, EntryStatus, LedgerEntry, Role};

/// Which sub-ledger a debit draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingSource {
    Wallet,
    Earnings,
}

impl From<Role> for FundingSource {
    fn from(role: Role) -> Self {
        match role {
            Role::Customer => FundingSource::Wallet,
            Role::Designer => FundingSource::Earnings,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balances {
    /// Signed sum of completed entries.
    pub wallet: Amount,
    /// Completed session credits minus completed earnings withdrawals.
    pub earnings: Amount,
    /// Magnitude of pending debits.
    pub reserved_wallet: Amount,
    /// Magnitude of pending earnings withdrawals.
    pub reserved_earnings: Amount,
}

impl Balances {
    /// Fold a full entry history from scratch. `None` if a running total overflows.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Option<Self> {
        entries
            .into_iter()
            .try_fold(Balances::default(), |balances, entry| balances.recorded(entry))
    }

    /// Balances after a newly appended (or replayed) entry in its current status.
    pub(crate) fn recorded(mut self, entry: &LedgerEntry) -> Option<Self> {
        match entry.status {
            EntryStatus::Completed => self.settle(entry)?,
            EntryStatus::Pending => self.reserve(entry)?,
            EntryStatus::Failed => {}
        }
        Some(self)
    }

    /// Balances after `entry` leaves `Pending` for `to`.
    pub(crate) fn transitioned(mut self, entry: &LedgerEntry, to: EntryStatus) -> Option<Self> {
        self.release(entry)?;
        if to == EntryStatus::Completed {
            self.settle(entry)?;
        }
        Some(self)
    }

    /// Funds a new debit against `source` may draw on.
    ///
    /// Earnings withdrawals also leave the wallet, so they are capped by what the
    /// wallet itself can cover.
    pub fn withdrawable(&self, source: FundingSource) -> Amount {
        let wallet = self.wallet - self.reserved_wallet;
        match source {
            FundingSource::Wallet => wallet,
            FundingSource::Earnings => (self.earnings - self.reserved_earnings).min(wallet),
        }
    }

    fn settle(&mut self, entry: &LedgerEntry) -> Option<()> {
        self.wallet = self.wallet.checked_add(entry.amount)?;
        if entry.is_earnings_credit() || entry.is_earnings_withdrawal() {
            self.earnings = self.earnings.checked_add(entry.amount)?;
        }
        Some(())
    }

    fn reserve(&mut self, entry: &LedgerEntry) -> Option<()> {
        if entry.amount.is_negative() {
            self.reserved_wallet = self.reserved_wallet.checked_add(entry.amount.abs())?;
            if entry.is_earnings_withdrawal() {
                self.reserved_earnings = self.reserved_earnings.checked_add(entry.amount.abs())?;
            }
        }
        Some(())
    }

    fn release(&mut self, entry: &LedgerEntry) -> Option<()> {
        if entry.amount.is_negative() {
            self.reserved_wallet = self.reserved_wallet.checked_sub(entry.amount.abs())?;
            if entry.is_earnings_withdrawal() {
                self.reserved_earnings = self.reserved_earnings.checked_sub(entry.amount.abs())?;
            }
        }
        Some(())
    }
}

/// Read-only view over [`LedgerStore`] balances.
///
/// Each read takes the account's ledger lock, so it never observes half of a
/// multi-step write.
#[derive(Clone)]
pub struct BalanceCalculator {
    ledger: Arc<LedgerStore>,
}

impl BalanceCalculator {
    pub fn new(ledger: Arc<LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Completed deposits and refunds minus completed payments and withdrawals.
    pub async fn wallet_balance(&self, account: AccountId) -> Amount {
        self.ledger.balances(account).await.wallet
    }

    /// Completed session earnings minus completed earnings withdrawals.
    pub async fn available_earnings(&self, account: AccountId) -> Amount {
        self.ledger.balances(account).await.earnings
    }

    pub async fn withdrawable(&self, account: AccountId, source: FundingSource) -> Amount {
        self.ledger.balances(account).await.withdrawable(source)
    }

    pub async fn balances(&self, account: AccountId) -> Balances {
        self.ledger.balances(account).await
    }
}

/// Read-through cache of per-account [`Balances`].
///
/// Writers call [`invalidate`](Self::invalidate) after every ledger mutation. Fills
/// and invalidations are serialized by one lock, so an invalidation can never be
/// overwritten by a value computed before the write it follows.
pub struct BalanceCache {
    calculator: BalanceCalculator,
    cached: Mutex<HashMap<AccountId, Balances>>,
}

impl BalanceCache {
    pub fn new(calculator: BalanceCalculator) -> Self {
        Self {
            calculator,
            cached: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, account: AccountId) -> Balances {
        let mut cached = self.cached.lock().await;
        if let Some(balances) = cached.get(&account) {
            return *balances;
        }
        let balances = self.calculator.balances(account).await;
        cached.insert(account, balances);
        balances
    }

    pub async fn invalidate(&self, account: AccountId) {
        self.cached.lock().await.remove(&account);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryId, EntryKind, Metadata, meta};
    use chrono::Utc;
    use uuid::Uuid;

    fn entry(kind: EntryKind, amount: i64, status: EntryStatus, earnings: Option<&str>) -> LedgerEntry {
        let mut metadata = Metadata::new();
        if let Some(tag) = earnings {
            metadata.insert(meta::EARNINGS_TYPE.to_string(), tag.to_string());
        }
        LedgerEntry {
            id: EntryId(0),
            account: Uuid::nil(),
            amount: Amount::from_major(amount),
            kind,
            status,
            description: "test".into(),
            booking_id: None,
            metadata,
            idempotency_key: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn wallet_counts_only_completed_entries() {
        let entries = [
            entry(EntryKind::Deposit, 500, EntryStatus::Completed, None),
            entry(EntryKind::Refund, 50, EntryStatus::Completed, None),
            entry(EntryKind::Payment, -120, EntryStatus::Completed, None),
            entry(EntryKind::Withdrawal, -100, EntryStatus::Completed, None),
            entry(EntryKind::Withdrawal, -200, EntryStatus::Pending, None),
            entry(EntryKind::Payment, -75, EntryStatus::Failed, None),
        ];
        let balances = Balances::from_entries(&entries).unwrap();
        assert_eq!(balances.wallet, Amount::from_major(330));
        assert_eq!(balances.reserved_wallet, Amount::from_major(200));
        assert_eq!(balances.withdrawable(FundingSource::Wallet), Amount::from_major(130));
    }

    #[test]
    fn earnings_track_tagged_entries_only() {
        let entries = [
            entry(EntryKind::Deposit, 1_000, EntryStatus::Completed, Some(meta::SESSION_COMPLETION)),
            entry(EntryKind::Deposit, 300, EntryStatus::Completed, None),
            entry(EntryKind::Withdrawal, -400, EntryStatus::Completed, Some(meta::EARNINGS_WITHDRAWAL)),
            entry(EntryKind::Withdrawal, -100, EntryStatus::Pending, Some(meta::EARNINGS_WITHDRAWAL)),
        ];
        let balances = Balances::from_entries(&entries).unwrap();
        assert_eq!(balances.earnings, Amount::from_major(600));
        assert_eq!(balances.wallet, Amount::from_major(900));
        assert_eq!(balances.withdrawable(FundingSource::Earnings), Amount::from_major(500));
    }

    #[test]
    fn earnings_withdrawable_is_capped_by_wallet() {
        let entries = [
            entry(EntryKind::Deposit, 1_000, EntryStatus::Completed, Some(meta::SESSION_COMPLETION)),
            entry(EntryKind::Payment, -800, EntryStatus::Completed, None),
        ];
        let balances = Balances::from_entries(&entries).unwrap();
        assert_eq!(balances.earnings, Amount::from_major(1_000));
        assert_eq!(balances.withdrawable(FundingSource::Earnings), Amount::from_major(200));
    }

    #[test]
    fn transition_releases_reservation() {
        let pending = entry(EntryKind::Withdrawal, -100, EntryStatus::Pending, None);
        let before = Balances::from_entries([
            &entry(EntryKind::Deposit, 150, EntryStatus::Completed, None),
            &pending,
        ])
        .unwrap();

        let completed = before.transitioned(&pending, EntryStatus::Completed).unwrap();
        assert_eq!(completed.wallet, Amount::from_major(50));
        assert_eq!(completed.reserved_wallet, Amount::ZERO);

        let failed = before.transitioned(&pending, EntryStatus::Failed).unwrap();
        assert_eq!(failed.wallet, Amount::from_major(150));
        assert_eq!(failed.withdrawable(FundingSource::Wallet), Amount::from_major(150));
    }

    #[test]
    fn overflowing_totals_are_refused() {
        let near_max = Amount::from_minor(i64::MAX - 100);
        let mut huge = entry(EntryKind::Deposit, 0, EntryStatus::Completed, None);
        huge.amount = near_max;
        let balances = Balances::default().recorded(&huge).unwrap();

        assert_eq!(balances.recorded(&huge), None);
        assert_eq!(Balances::from_entries([&huge, &huge]), None);
    }

    #[tokio::test]
    async fn cache_serves_until_invalidated() {
        use crate::clock::SystemClock;
        use crate::model::NewEntry;

        let ledger = Arc::new(LedgerStore::in_memory(Arc::new(SystemClock)));
        let cache = BalanceCache::new(BalanceCalculator::new(Arc::clone(&ledger)));
        let account = Uuid::new_v4();
        let top_up = || NewEntry::new(account, EntryKind::Deposit, Amount::from_major(100), "top-up");

        ledger.append(top_up()).await.unwrap();
        assert_eq!(cache.get(account).await.wallet, Amount::from_major(100));

        ledger.append(top_up()).await.unwrap();
        assert_eq!(cache.get(account).await.wallet, Amount::from_major(100));

        cache.invalidate(account).await;
        assert_eq!(cache.get(account).await.wallet, Amount::from_major(200));
    }

    #[test]
    fn role_picks_funding_source() {
        assert_eq!(FundingSource::from(Role::Customer), FundingSource::Wallet);
        assert_eq!(FundingSource::from(Role::Designer), FundingSource::Earnings);
    }
}
