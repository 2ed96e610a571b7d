//! Bank account registry.
//!
//! Accounts are grouped per owner behind one async mutex each, so the
//! single-primary invariant is maintained by ordinary clear-then-set updates that
//! no other task can observe half-done. Callers that need a bank account to stay
//! put while they act on it (withdrawals, verification) hold the owner's lock via
//! [`BankAccountRegistry::lock_owner`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::info;

use crate::clock::Clock;
use crate::ledger::LedgerStore;
use crate::model::{AccountId, BankAccount, BankAccountId, BankDetails, VerificationMethod};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid bank details: {0}")]
    Validation(String),
    #[error("bank account {0} not found")]
    NotFound(BankAccountId),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// One owner's bank accounts, oldest first.
#[derive(Debug, Default)]
pub struct OwnerBook {
    accounts: Vec<BankAccount>,
}

impl OwnerBook {
    pub fn get(&self, id: BankAccountId) -> Option<&BankAccount> {
        self.accounts.iter().find(|account| account.id == id)
    }

    fn get_mut(&mut self, id: BankAccountId) -> Option<&mut BankAccount> {
        self.accounts.iter_mut().find(|account| account.id == id)
    }

    /// Primary first, then newest first.
    pub fn list(&self) -> Vec<BankAccount> {
        let mut accounts: Vec<_> = self.accounts.iter().rev().cloned().collect();
        accounts.sort_by_key(|account| !account.is_primary);
        accounts
    }

    fn primary_count(&self) -> usize {
        self.accounts.iter().filter(|a| a.is_primary).count()
    }
}

pub type OwnerGuard = OwnedMutexGuard<OwnerBook>;

pub struct BankAccountRegistry {
    owners: RwLock<HashMap<AccountId, Arc<Mutex<OwnerBook>>>>,
    next_id: AtomicU64,
    ledger: Arc<LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl BankAccountRegistry {
    pub fn new(ledger: Arc<LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            owners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            ledger,
            clock,
        }
    }

    /// Exclusive access to `owner`'s bank accounts until the guard is dropped.
    pub async fn lock_owner(&self, owner: AccountId) -> OwnerGuard {
        let book = {
            let owners = self.owners.read().await;
            owners.get(&owner).cloned()
        };
        let book = match book {
            Some(book) => book,
            None => Arc::clone(self.owners.write().await.entry(owner).or_default()),
        };
        book.lock_owned().await
    }

    /// Like [`lock_owner`](Self::lock_owner), but `None` for an owner who never
    /// registered an account.
    pub async fn lock_existing(&self, owner: AccountId) -> Option<OwnerGuard> {
        let book = self.owners.read().await.get(&owner).cloned()?;
        Some(book.lock_owned().await)
    }

    /// Register a new, unverified account. An owner's first account becomes primary.
    pub async fn add(&self, owner: AccountId, details: BankDetails) -> Result<BankAccount, RegistryError> {
        let details = normalize(details)?;
        let mut book = self.lock_owner(owner).await;

        if book.accounts.iter().any(|a| same_destination(&a.details, &details)) {
            return Err(RegistryError::Conflict(format!(
                "account ending {} is already registered",
                last_four(&details.account_number)
            )));
        }

        let account = BankAccount {
            id: BankAccountId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            owner,
            details,
            is_verified: false,
            is_primary: book.accounts.is_empty(),
            verification_method: VerificationMethod::None,
            revision: 0,
            created_at: self.clock.now(),
        };
        book.accounts.push(account.clone());

        info!(
            owner = %owner,
            bank_account = %account.id,
            primary = account.is_primary,
            "bank account added"
        );
        Ok(account)
    }

    /// Edit an account. Changing the account number or routing code drops its
    /// verification.
    pub async fn update(
        &self,
        owner: AccountId,
        id: BankAccountId,
        details: BankDetails,
    ) -> Result<BankAccount, RegistryError> {
        let details = normalize(details)?;
        let mut book = self
            .lock_existing(owner)
            .await
            .ok_or(RegistryError::NotFound(id))?;

        let current = book.get(id).ok_or(RegistryError::NotFound(id))?;
        let destination_changed = !same_destination(&current.details, &details);

        if destination_changed {
            if book
                .accounts
                .iter()
                .any(|a| a.id != id && same_destination(&a.details, &details))
            {
                return Err(RegistryError::Conflict(format!(
                    "account ending {} is already registered",
                    last_four(&details.account_number)
                )));
            }
            if self.ledger.has_pending_withdrawal_to(owner, id).await {
                return Err(RegistryError::Conflict(format!(
                    "bank account {id} has a pending withdrawal"
                )));
            }
        }

        let account = book.get_mut(id).ok_or(RegistryError::NotFound(id))?;
        account.details = details;
        if destination_changed {
            account.is_verified = false;
            account.verification_method = VerificationMethod::None;
            account.revision += 1;
        }

        info!(
            owner = %owner,
            bank_account = %id,
            reverify = destination_changed,
            "bank account updated"
        );
        Ok(account.clone())
    }

    /// Make `id` the owner's only primary account.
    pub async fn set_primary(&self, owner: AccountId, id: BankAccountId) -> Result<BankAccount, RegistryError> {
        let mut book = self
            .lock_existing(owner)
            .await
            .ok_or(RegistryError::NotFound(id))?;
        if book.get(id).is_none() {
            return Err(RegistryError::NotFound(id));
        }

        for account in &mut book.accounts {
            account.is_primary = account.id == id;
        }
        debug_assert_eq!(book.primary_count(), 1);

        info!(owner = %owner, bank_account = %id, "primary bank account changed");
        book.get(id).cloned().ok_or(RegistryError::NotFound(id))
    }

    /// Delete an account that no pending withdrawal targets.
    ///
    /// Removing the primary promotes the newest remaining account.
    pub async fn remove(&self, owner: AccountId, id: BankAccountId) -> Result<BankAccount, RegistryError> {
        let mut book = self
            .lock_existing(owner)
            .await
            .ok_or(RegistryError::NotFound(id))?;
        let pos = book
            .accounts
            .iter()
            .position(|a| a.id == id)
            .ok_or(RegistryError::NotFound(id))?;

        if self.ledger.has_pending_withdrawal_to(owner, id).await {
            return Err(RegistryError::Conflict(format!(
                "bank account {id} has a pending withdrawal"
            )));
        }

        let removed = book.accounts.remove(pos);
        if removed.is_primary {
            if let Some(newest) = book.accounts.last_mut() {
                newest.is_primary = true;
            }
        }

        info!(owner = %owner, bank_account = %id, "bank account removed");
        Ok(removed)
    }

    pub async fn get(&self, owner: AccountId, id: BankAccountId) -> Result<BankAccount, RegistryError> {
        self.lock_existing(owner)
            .await
            .and_then(|book| book.get(id).cloned())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Primary first, then newest first.
    pub async fn list_by_owner(&self, owner: AccountId) -> Vec<BankAccount> {
        match self.lock_existing(owner).await {
            Some(book) => book.list(),
            None => Vec::new(),
        }
    }

    /// Record a successful verification, provided the account number and routing
    /// code are unchanged since `revision`.
    pub(crate) fn mark_verified(
        book: &mut OwnerBook,
        id: BankAccountId,
        revision: u32,
        method: VerificationMethod,
    ) -> Result<BankAccount, RegistryError> {
        let account = book.get_mut(id).ok_or(RegistryError::NotFound(id))?;
        if account.revision != revision {
            return Err(RegistryError::Conflict(format!(
                "bank account {id} changed during verification"
            )));
        }
        account.is_verified = true;
        account.verification_method = method;
        Ok(account.clone())
    }
}

fn same_destination(a: &BankDetails, b: &BankDetails) -> bool {
    a.account_number == b.account_number && a.routing_code == b.routing_code
}

fn last_four(number: &str) -> &str {
    &number[number.len().saturating_sub(4)..]
}

/// Trim and upper-case user input, then check it.
fn normalize(mut details: BankDetails) -> Result<BankDetails, RegistryError> {
    details.bank_name = details.bank_name.trim().to_string();
    details.holder_name = details.holder_name.trim().to_string();
    details.account_number = details.account_number.trim().to_string();
    details.routing_code = details.routing_code.trim().to_ascii_uppercase();

    if details.bank_name.is_empty() {
        return Err(RegistryError::Validation("bank name is required".into()));
    }
    if details.holder_name.is_empty() {
        return Err(RegistryError::Validation("account holder name is required".into()));
    }
    let number = &details.account_number;
    if !(9..=18).contains(&number.len()) || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RegistryError::Validation(
            "account number must be 9 to 18 digits".into(),
        ));
    }
    if !is_ifsc(&details.routing_code) {
        return Err(RegistryError::Validation(format!(
            "'{}' is not a valid IFSC code",
            details.routing_code
        )));
    }
    Ok(details)
}

/// Four-letter bank code, a literal `0`, then a six-character branch code.
fn is_ifsc(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 11
        && bytes[..4].iter().all(u8::is_ascii_uppercase)
        && bytes[4] == b'0'
        && bytes[5..].iter().all(u8::is_ascii_alphanumeric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::clock::SystemClock;
    use crate::model::{AccountType, EntryKind, NewEntry, meta};
    use uuid::Uuid;

    fn registry() -> (Arc<LedgerStore>, BankAccountRegistry) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ledger = Arc::new(LedgerStore::in_memory(Arc::clone(&clock)));
        let registry = BankAccountRegistry::new(Arc::clone(&ledger), clock);
        (ledger, registry)
    }

    fn details(number: &str) -> BankDetails {
        BankDetails {
            bank_name: "HDFC Bank".into(),
            holder_name: "Asha Rao".into(),
            account_number: number.into(),
            routing_code: "hdfc0001234".into(),
            account_type: AccountType::Savings,
        }
    }

    #[tokio::test]
    async fn lookups_do_not_register_owners() {
        let (_, registry) = registry();
        let stranger = Uuid::new_v4();

        assert!(matches!(
            registry.get(stranger, BankAccountId(1)).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(registry.list_by_owner(stranger).await.is_empty());
        assert!(registry.remove(stranger, BankAccountId(1)).await.is_err());
        assert!(registry.lock_existing(stranger).await.is_none());
        assert!(registry.owners.read().await.is_empty());

        registry.add(stranger, details("123456789012")).await.unwrap();
        assert_eq!(registry.owners.read().await.len(), 1);
        assert!(registry.lock_existing(stranger).await.is_some());
    }

    #[tokio::test]
    async fn first_account_becomes_primary() {
        let (_, registry) = registry();
        let owner = Uuid::new_v4();

        let first = registry.add(owner, details("123456789012")).await.unwrap();
        let second = registry.add(owner, details("223456789012")).await.unwrap();

        assert!(first.is_primary);
        assert!(!first.is_verified);
        assert_eq!(first.details.routing_code, "HDFC0001234");
        assert!(!second.is_primary);
    }

    #[tokio::test]
    async fn add_rejects_bad_details() {
        let (_, registry) = registry();
        let owner = Uuid::new_v4();

        for bad in [
            details("12345"),
            details("12345678901234567890"),
            details("12345678901a"),
            BankDetails {
                routing_code: "HDFC1001234".into(),
                ..details("123456789012")
            },
            BankDetails {
                holder_name: " ".into(),
                ..details("123456789012")
            },
        ] {
            let result = registry.add(owner, bad).await;
            assert!(matches!(result, Err(RegistryError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn duplicate_destination_conflicts() {
        let (_, registry) = registry();
        let owner = Uuid::new_v4();
        registry.add(owner, details("123456789012")).await.unwrap();

        let result = registry.add(owner, details("123456789012")).await;
        assert!(matches!(result, Err(RegistryError::Conflict(_))));
    }

    #[tokio::test]
    async fn list_is_primary_then_newest() {
        let (_, registry) = registry();
        let owner = Uuid::new_v4();
        let a = registry.add(owner, details("100000000001")).await.unwrap();
        let b = registry.add(owner, details("100000000002")).await.unwrap();
        let c = registry.add(owner, details("100000000003")).await.unwrap();

        let ids: Vec<_> = registry.list_by_owner(owner).await.iter().map(|x| x.id).collect();
        assert_eq!(ids, vec![a.id, c.id, b.id]);

        registry.set_primary(owner, b.id).await.unwrap();
        let ids: Vec<_> = registry.list_by_owner(owner).await.iter().map(|x| x.id).collect();
        assert_eq!(ids, vec![b.id, c.id, a.id]);
    }

    #[tokio::test]
    async fn set_primary_leaves_exactly_one() {
        let (_, registry) = registry();
        let owner = Uuid::new_v4();
        let a = registry.add(owner, details("100000000001")).await.unwrap();
        let b = registry.add(owner, details("100000000002")).await.unwrap();

        registry.set_primary(owner, b.id).await.unwrap();
        let accounts = registry.list_by_owner(owner).await;
        assert_eq!(accounts.iter().filter(|x| x.is_primary).count(), 1);
        assert!(!registry.get(owner, a.id).await.unwrap().is_primary);
    }

    #[tokio::test]
    async fn other_owners_accounts_are_not_found() {
        let (_, registry) = registry();
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let account = registry.add(owner, details("123456789012")).await.unwrap();

        assert!(matches!(
            registry.set_primary(intruder, account.id).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.update(intruder, account.id, details("999999999999")).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.remove(intruder, account.id).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn changing_number_resets_verification() {
        let (_, registry) = registry();
        let owner = Uuid::new_v4();
        let account = registry.add(owner, details("123456789012")).await.unwrap();
        {
            let mut book = registry.lock_owner(owner).await;
            BankAccountRegistry::mark_verified(&mut book, account.id, 0, VerificationMethod::Sms)
                .unwrap();
        }

        let renamed = registry
            .update(
                owner,
                account.id,
                BankDetails {
                    holder_name: "Asha R".into(),
                    ..details("123456789012")
                },
            )
            .await
            .unwrap();
        assert!(renamed.is_verified);
        assert_eq!(renamed.revision, 0);

        let moved = registry.update(owner, account.id, details("923456789012")).await.unwrap();
        assert!(!moved.is_verified);
        assert_eq!(moved.verification_method, VerificationMethod::None);
        assert_eq!(moved.revision, 1);
    }

    #[tokio::test]
    async fn stale_revision_cannot_be_verified() {
        let (_, registry) = registry();
        let owner = Uuid::new_v4();
        let account = registry.add(owner, details("123456789012")).await.unwrap();
        registry.update(owner, account.id, details("923456789012")).await.unwrap();

        let mut book = registry.lock_owner(owner).await;
        let result =
            BankAccountRegistry::mark_verified(&mut book, account.id, 0, VerificationMethod::Sms);
        assert!(matches!(result, Err(RegistryError::Conflict(_))));
    }

    #[tokio::test]
    async fn remove_blocked_by_pending_withdrawal() {
        let (ledger, registry) = registry();
        let owner = Uuid::new_v4();
        let account = registry.add(owner, details("123456789012")).await.unwrap();
        ledger
            .append(NewEntry::new(owner, EntryKind::Deposit, Amount::from_major(500), "top-up"))
            .await
            .unwrap();
        let pending = ledger
            .append(
                NewEntry::new(owner, EntryKind::Withdrawal, Amount::from_major(-200), "payout")
                    .with_meta(meta::BANK_ACCOUNT_ID, account.id.to_string()),
            )
            .await
            .unwrap();

        assert!(matches!(
            registry.remove(owner, account.id).await,
            Err(RegistryError::Conflict(_))
        ));

        ledger
            .transition(pending.id, crate::model::EntryStatus::Failed)
            .await
            .unwrap();
        assert!(registry.remove(owner, account.id).await.is_ok());
    }

    #[tokio::test]
    async fn removing_primary_promotes_newest() {
        let (_, registry) = registry();
        let owner = Uuid::new_v4();
        let a = registry.add(owner, details("100000000001")).await.unwrap();
        registry.add(owner, details("100000000002")).await.unwrap();
        let c = registry.add(owner, details("100000000003")).await.unwrap();

        registry.remove(owner, a.id).await.unwrap();
        let accounts = registry.list_by_owner(owner).await;
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].id, c.id);
        assert!(accounts[0].is_primary);
        assert_eq!(accounts.iter().filter(|x| x.is_primary).count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_set_primary_never_leaves_two() {
        let (_, registry) = registry();
        let registry = Arc::new(registry);
        let owner = Uuid::new_v4();
        let mut ids = Vec::new();
        for n in 0..5 {
            let number = format!("10000000000{n}");
            ids.push(registry.add(owner, details(&number)).await.unwrap().id);
        }

        let tasks: Vec<_> = ids
            .iter()
            .cycle()
            .take(40)
            .map(|&id| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry.set_primary(owner, id).await.unwrap();
                    let accounts = registry.list_by_owner(owner).await;
                    accounts.iter().filter(|x| x.is_primary).count()
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), 1);
        }
    }
}
