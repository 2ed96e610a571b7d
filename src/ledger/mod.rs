//! Append-only ledger storage.
//!
//! The store is the source of truth for every balance. Each account's entries sit
//! behind their own async mutex: writes to one account are serialized, writes to
//! different accounts run in parallel. [`LedgerStore::append_with`] evaluates a
//! balance check and appends under the same lock, so check-then-act races between
//! concurrent debits are impossible.
//!
//! Lock order is account ledger, then idempotency keys, then the entry index.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::balance::Balances;
use crate::clock::Clock;
use crate::model::{
    AccountId, BankAccountId, EntryId, EntryKind, EntryStatus, LedgerEntry, Metadata, NewEntry,
};

mod state;
pub use state::AccountLedger;

mod error;
pub use error::LedgerError;

mod journal;
use journal::{Journal, Record};

/// Restrict listings to a kind and/or status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub kind: Option<EntryKind>,
    pub status: Option<EntryStatus>,
}

impl EntryFilter {
    pub fn kind(kind: EntryKind) -> Self {
        Self {
            kind: Some(kind),
            status: None,
        }
    }

    pub fn status(status: EntryStatus) -> Self {
        Self {
            kind: None,
            status: Some(status),
        }
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.kind.is_none_or(|k| k == entry.kind) && self.status.is_none_or(|s| s == entry.status)
    }
}

/// Offset/limit window over a newest-first listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// Result of an append that may have been deduplicated by idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Appended {
    Created(LedgerEntry),
    /// An entry with the same key already existed; nothing was written.
    Existing(LedgerEntry),
}

impl Appended {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Appended::Created(entry) | Appended::Existing(entry) => entry,
        }
    }

    pub fn into_entry(self) -> LedgerEntry {
        match self {
            Appended::Created(entry) | Appended::Existing(entry) => entry,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Appended::Created(_))
    }
}

type AccountHandle = Arc<Mutex<AccountLedger>>;

pub struct LedgerStore {
    accounts: RwLock<HashMap<AccountId, AccountHandle>>,
    /// Owning account of every entry
    index: RwLock<HashMap<EntryId, AccountId>>,
    keys: Mutex<HashMap<String, EntryId>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    journal: Option<Journal>,
}

/// Public API
impl LedgerStore {
    /// A store that lives only in memory.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            clock,
            journal: None,
        }
    }

    /// A store backed by the journal at `path`, replaying whatever it already holds.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        let (journal, records) = Journal::open(path)?;
        let replayed = records.len();

        let mut accounts: HashMap<AccountId, AccountLedger> = HashMap::new();
        let mut index = HashMap::new();
        let mut keys = HashMap::new();
        let mut last_id = 0;

        for record in records {
            match record {
                Record::Append { entry } => {
                    last_id = last_id.max(entry.id.0);
                    index.insert(entry.id, entry.account);
                    if let Some(key) = &entry.idempotency_key {
                        keys.insert(key.clone(), entry.id);
                    }
                    accounts.entry(entry.account).or_default().push(entry)?;
                }
                Record::Transition {
                    id,
                    status,
                    metadata,
                } => {
                    match index.get(&id).and_then(|account| accounts.get_mut(account)) {
                        Some(ledger) => {
                            ledger.settle(id, status, metadata)?;
                        }
                        None => warn!(entry = %id, "journal transition for unknown entry"),
                    }
                }
                Record::Annotate { id, metadata } => {
                    let annotated = index
                        .get(&id)
                        .and_then(|account| accounts.get_mut(account))
                        .and_then(|ledger| ledger.annotate(id, metadata));
                    if annotated.is_none() {
                        warn!(entry = %id, "journal annotation for unknown entry");
                    }
                }
            }
        }

        info!(path = %path.display(), records = replayed, "ledger journal replayed");

        Ok(Self {
            accounts: RwLock::new(
                accounts
                    .into_iter()
                    .map(|(id, ledger)| (id, Arc::new(Mutex::new(ledger))))
                    .collect(),
            ),
            index: RwLock::new(index),
            keys: Mutex::new(keys),
            next_id: AtomicU64::new(last_id + 1),
            clock,
            journal: Some(journal),
        })
    }

    /// Append an entry unconditionally.
    pub async fn append(&self, entry: NewEntry) -> Result<LedgerEntry, LedgerError> {
        self.append_with(entry, |_| Ok::<(), LedgerError>(()))
            .await
            .map(Appended::into_entry)
    }

    /// Append an entry if `check` accepts the account's current balances.
    ///
    /// `check` runs while the account is locked, after idempotency deduplication: a
    /// repeated key returns the original entry without consulting `check`.
    pub async fn append_with<E, F>(&self, new: NewEntry, check: F) -> Result<Appended, E>
    where
        E: From<LedgerError>,
        F: FnOnce(&Balances) -> Result<(), E>,
    {
        validate(&new)?;

        let handle = self.account(new.account).await;
        let mut ledger = handle.lock().await;

        let mut keys = None;
        if let Some(key) = &new.idempotency_key {
            let guard = self.keys.lock().await;
            if let Some(&existing) = guard.get(key) {
                drop(guard);
                drop(ledger);
                return Ok(Appended::Existing(
                    self.existing(existing, new.account, key).await?,
                ));
            }
            keys = Some(guard);
        }

        check(&ledger.balances())?;

        let entry = LedgerEntry {
            id: EntryId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            account: new.account,
            amount: new.amount,
            kind: new.kind,
            status: new.kind.initial_status(),
            description: new.description,
            booking_id: new.booking_id,
            metadata: new.metadata,
            idempotency_key: new.idempotency_key,
            created_at: self.clock.now(),
        };

        ledger.admit(&entry)?;
        self.write(&Record::Append {
            entry: entry.clone(),
        })?;

        if let (Some(keys), Some(key)) = (keys.as_mut(), &entry.idempotency_key) {
            keys.insert(key.clone(), entry.id);
        }
        self.index.write().await.insert(entry.id, entry.account);
        ledger.push(entry.clone())?;

        info!(
            account = %entry.account,
            entry = %entry.id,
            kind = %entry.kind,
            amount = %entry.amount,
            status = ?entry.status,
            "ledger entry appended"
        );

        Ok(Appended::Created(entry))
    }

    /// Move a pending entry to `completed` or `failed`.
    pub async fn transition(&self, id: EntryId, to: EntryStatus) -> Result<LedgerEntry, LedgerError> {
        self.transition_with(id, to, Metadata::new()).await
    }

    /// Like [`transition`](Self::transition), merging `annotations` into the entry's
    /// metadata in the same write.
    pub async fn transition_with(
        &self,
        id: EntryId,
        to: EntryStatus,
        annotations: Metadata,
    ) -> Result<LedgerEntry, LedgerError> {
        self.transition_where(id, to, annotations, |_| Ok::<(), LedgerError>(()))
            .await
    }

    /// Like [`transition_with`](Self::transition_with), if `check` accepts the
    /// pending entry. `check` runs while the account is locked.
    pub async fn transition_where<E, F>(
        &self,
        id: EntryId,
        to: EntryStatus,
        annotations: Metadata,
        check: F,
    ) -> Result<LedgerEntry, E>
    where
        E: From<LedgerError>,
        F: FnOnce(&LedgerEntry) -> Result<(), E>,
    {
        let handle = self.handle_of(id).await?;
        let mut ledger = handle.lock().await;

        let current = ledger.get(id).ok_or(LedgerError::NotFound(id))?;
        let from = current.status;
        if from != EntryStatus::Pending || to == EntryStatus::Pending {
            return Err(LedgerError::InvalidStateTransition { id, from, to }.into());
        }
        check(current)?;

        ledger.admit_transition(id, to)?;
        self.write(&Record::Transition {
            id,
            status: to,
            metadata: annotations.clone(),
        })?;
        let entry = ledger.settle(id, to, annotations)?;

        info!(
            account = %entry.account,
            entry = %id,
            kind = %entry.kind,
            status = ?to,
            "ledger entry settled"
        );

        Ok(entry)
    }

    /// Attach metadata to a pending entry. Settled entries are immutable.
    pub async fn annotate(&self, id: EntryId, annotations: Metadata) -> Result<LedgerEntry, LedgerError> {
        self.annotate_where(id, annotations, |_| Ok::<(), LedgerError>(()))
            .await
    }

    /// Like [`annotate`](Self::annotate), if `check` accepts the entry under the
    /// account lock.
    pub async fn annotate_where<E, F>(
        &self,
        id: EntryId,
        annotations: Metadata,
        check: F,
    ) -> Result<LedgerEntry, E>
    where
        E: From<LedgerError>,
        F: FnOnce(&LedgerEntry) -> Result<(), E>,
    {
        let handle = self.handle_of(id).await?;
        let mut ledger = handle.lock().await;

        let current = ledger.get(id).ok_or(LedgerError::NotFound(id))?;
        if current.status.is_terminal() {
            return Err(LedgerError::InvalidStateTransition {
                id,
                from: current.status,
                to: current.status,
            }
            .into());
        }
        check(current)?;

        self.write(&Record::Annotate {
            id,
            metadata: annotations.clone(),
        })?;
        ledger
            .annotate(id, annotations)
            .ok_or_else(|| LedgerError::NotFound(id).into())
    }

    pub async fn get(&self, id: EntryId) -> Result<LedgerEntry, LedgerError> {
        let handle = self.handle_of(id).await?;
        let ledger = handle.lock().await;
        ledger.get(id).cloned().ok_or(LedgerError::NotFound(id))
    }

    /// The entry created with idempotency key `key`, if any.
    pub async fn find_by_key(&self, key: &str) -> Option<LedgerEntry> {
        let id = self.keys.lock().await.get(key).copied()?;
        self.get(id).await.ok()
    }

    /// Newest-first entries of `account` matching `filter`, windowed by `page`.
    pub async fn list_by_account(
        &self,
        account: AccountId,
        filter: EntryFilter,
        page: Page,
    ) -> Vec<LedgerEntry> {
        let Some(handle) = self.existing_account(account).await else {
            return Vec::new();
        };
        let ledger = handle.lock().await;
        ledger
            .newest_first()
            .filter(|entry| filter.matches(entry))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect()
    }

    /// Lazily page through `account`'s entries, newest first, starting at `offset`.
    ///
    /// Pages of `page_size` are fetched only as the consumer drains the stream.
    /// Restart from any position by passing the number of entries already seen.
    pub fn stream_by_account(
        self: &Arc<Self>,
        account: AccountId,
        filter: EntryFilter,
        page_size: usize,
        offset: usize,
    ) -> ReceiverStream<LedgerEntry> {
        let page_size = page_size.max(1);
        let (sender, receiver) = mpsc::channel(page_size);
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut page = Page {
                offset,
                limit: page_size,
            };
            loop {
                let entries = store.list_by_account(account, filter, page).await;
                let exhausted = entries.len() < page_size;
                for entry in entries {
                    if sender.send(entry).await.is_err() {
                        return;
                    }
                }
                if exhausted {
                    return;
                }
                page = page.next();
            }
        });

        ReceiverStream::new(receiver)
    }

    /// Current balances of `account`; zero for accounts with no entries.
    pub async fn balances(&self, account: AccountId) -> Balances {
        match self.existing_account(account).await {
            Some(handle) => handle.lock().await.balances(),
            None => Balances::default(),
        }
    }

    /// Whether any pending withdrawal of `account` targets `bank_account`.
    pub async fn has_pending_withdrawal_to(
        &self,
        account: AccountId,
        bank_account: BankAccountId,
    ) -> bool {
        let Some(handle) = self.existing_account(account).await else {
            return false;
        };
        let ledger = handle.lock().await;
        ledger.newest_first().any(|entry| {
            entry.kind == EntryKind::Withdrawal
                && entry.status == EntryStatus::Pending
                && entry.bank_account() == Some(bank_account)
        })
    }

    /// Every account that has at least one entry.
    pub async fn accounts(&self) -> Vec<AccountId> {
        self.accounts.read().await.keys().copied().collect()
    }
}

/// Private API
impl LedgerStore {
    async fn account(&self, account: AccountId) -> AccountHandle {
        if let Some(handle) = self.existing_account(account).await {
            return handle;
        }
        let mut accounts = self.accounts.write().await;
        Arc::clone(accounts.entry(account).or_default())
    }

    async fn existing_account(&self, account: AccountId) -> Option<AccountHandle> {
        self.accounts.read().await.get(&account).cloned()
    }

    async fn handle_of(&self, id: EntryId) -> Result<AccountHandle, LedgerError> {
        let account = self
            .index
            .read()
            .await
            .get(&id)
            .copied()
            .ok_or(LedgerError::NotFound(id))?;
        self.existing_account(account)
            .await
            .ok_or(LedgerError::NotFound(id))
    }

    /// Resolve a deduplicated append to the entry that already holds `key`.
    async fn existing(
        &self,
        id: EntryId,
        account: AccountId,
        key: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = self.get(id).await?;
        if entry.account != account {
            return Err(LedgerError::KeyConflict(key.to_string()));
        }
        info!(account = %account, entry = %id, key, "duplicate idempotency key, returning original");
        Ok(entry)
    }

    fn write(&self, record: &Record) -> Result<(), LedgerError> {
        match &self.journal {
            Some(journal) => journal.write(record),
            None => Ok(()),
        }
    }
}

/// Reject entries that are malformed regardless of account state.
fn validate(entry: &NewEntry) -> Result<(), LedgerError> {
    if entry.account.is_nil() {
        return Err(LedgerError::Validation("account id is required".into()));
    }
    if entry.amount.is_zero() {
        return Err(LedgerError::Validation("amount must be non-zero".into()));
    }
    if entry.kind.is_credit() && entry.amount.is_negative() {
        return Err(LedgerError::Validation(format!(
            "{} amount must be positive, got {}",
            entry.kind, entry.amount
        )));
    }
    if !entry.kind.is_credit() && entry.amount.is_positive() {
        return Err(LedgerError::Validation(format!(
            "{} amount must be negative, got {}",
            entry.kind, entry.amount
        )));
    }
    if entry.description.trim().is_empty() {
        return Err(LedgerError::Validation("description is required".into()));
    }
    if entry
        .idempotency_key
        .as_deref()
        .is_some_and(|key| key.trim().is_empty())
    {
        return Err(LedgerError::Validation("idempotency key must not be blank".into()));
    }
    Ok(())
}
