//! Core domain types for the wallet ledger.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Amount;

/// Account identifier, as issued by the auth provider.
pub type AccountId = Uuid;

/// Opaque key-value annotations carried by ledger entries.
pub type Metadata = BTreeMap<String, String>;

/// Well-known metadata keys.
pub mod meta {
    pub const EARNINGS_TYPE: &str = "earnings_type";
    pub const SESSION_COMPLETION: &str = "session_completion";
    pub const EARNINGS_WITHDRAWAL: &str = "withdrawal";
    pub const BANK_ACCOUNT_ID: &str = "bank_account_id";
    pub const PURPOSE: &str = "purpose";
    pub const PAYOUT_MODE: &str = "payout_mode";
    pub const PAYOUT_STATE: &str = "payout_state";
    pub const PAYOUT_REFERENCE: &str = "payout_reference";
    pub const GATEWAY_REFERENCE: &str = "gateway_reference";
    pub const FAILURE_REASON: &str = "failure_reason";
}

/// Ledger entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bank account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BankAccountId(pub u64);

impl fmt::Display for BankAccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of user an account belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Books sessions and pays from the wallet.
    Customer,
    /// Runs sessions and withdraws earnings.
    Designer,
}

/// The balance-affecting event an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Deposit,
    Payment,
    Refund,
    Withdrawal,
}

impl EntryKind {
    /// Deposits and refunds credit the account; payments and withdrawals debit it.
    pub fn is_credit(self) -> bool {
        matches!(self, EntryKind::Deposit | EntryKind::Refund)
    }

    /// Credits settle synchronously; debits wait for an explicit transition.
    pub fn initial_status(self) -> EntryStatus {
        if self.is_credit() {
            EntryStatus::Completed
        } else {
            EntryStatus::Pending
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Payment => "payment",
            EntryKind::Refund => "refund",
            EntryKind::Withdrawal => "withdrawal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EntryStatus::Pending)
    }
}

/// Input to [`LedgerStore::append`](crate::ledger::LedgerStore::append).
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub account: AccountId,
    /// Signed from the account's perspective.
    pub amount: Amount,
    pub kind: EntryKind,
    pub description: String,
    pub booking_id: Option<String>,
    pub metadata: Metadata,
    /// At most one entry ever carries a given key.
    pub idempotency_key: Option<String>,
}

impl NewEntry {
    pub fn new(
        account: AccountId,
        kind: EntryKind,
        amount: Amount,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account,
            amount,
            kind,
            description: description.into(),
            booking_id: None,
            metadata: Metadata::new(),
            idempotency_key: None,
        }
    }

    pub fn with_booking(mut self, booking_id: impl Into<String>) -> Self {
        self.booking_id = Some(booking_id.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Immutable record of one balance-affecting event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account: AccountId,
    pub amount: Amount,
    pub kind: EntryKind,
    pub status: EntryStatus,
    pub description: String,
    pub booking_id: Option<String>,
    pub metadata: Metadata,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Credit from a completed design session.
    pub fn is_earnings_credit(&self) -> bool {
        self.kind.is_credit() && self.meta(meta::EARNINGS_TYPE) == Some(meta::SESSION_COMPLETION)
    }

    /// Withdrawal drawn against the earnings sub-ledger.
    pub fn is_earnings_withdrawal(&self) -> bool {
        self.kind == EntryKind::Withdrawal
            && self.meta(meta::EARNINGS_TYPE) == Some(meta::EARNINGS_WITHDRAWAL)
    }

    /// Destination of a withdrawal.
    pub fn bank_account(&self) -> Option<BankAccountId> {
        self.meta(meta::BANK_ACCOUNT_ID)
            .and_then(|id| id.parse().ok())
            .map(BankAccountId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Savings,
    Current,
    Salary,
}

/// How a bank account was proven to belong to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Sms,
    Email,
    BankApi,
    MicroDeposit,
    #[default]
    None,
}

impl fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerificationMethod::Sms => "sms",
            VerificationMethod::Email => "email",
            VerificationMethod::BankApi => "bank_api",
            VerificationMethod::MicroDeposit => "micro_deposit",
            VerificationMethod::None => "none",
        };
        f.write_str(name)
    }
}

/// User-editable part of a bank account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    pub bank_name: String,
    pub holder_name: String,
    pub account_number: String,
    /// IFSC code.
    pub routing_code: String,
    pub account_type: AccountType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccount {
    pub id: BankAccountId,
    pub owner: AccountId,
    pub details: BankDetails,
    pub is_verified: bool,
    pub is_primary: bool,
    pub verification_method: VerificationMethod,
    /// Bumped whenever the account number or routing code changes.
    pub revision: u32,
    pub created_at: DateTime<Utc>,
}

impl BankAccount {
    /// Account number with all but the last four digits masked.
    pub fn masked_number(&self) -> String {
        let digits = &self.details.account_number;
        let visible = digits.len().saturating_sub(4);
        format!("{}{}", "X".repeat(visible), &digits[visible..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credits_complete_immediately() {
        assert_eq!(EntryKind::Deposit.initial_status(), EntryStatus::Completed);
        assert_eq!(EntryKind::Refund.initial_status(), EntryStatus::Completed);
        assert_eq!(EntryKind::Payment.initial_status(), EntryStatus::Pending);
        assert_eq!(EntryKind::Withdrawal.initial_status(), EntryStatus::Pending);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!EntryStatus::Pending.is_terminal());
        assert!(EntryStatus::Completed.is_terminal());
        assert!(EntryStatus::Failed.is_terminal());
    }

    #[test]
    fn masked_number_keeps_last_four() {
        let account = BankAccount {
            id: BankAccountId(1),
            owner: Uuid::nil(),
            details: BankDetails {
                bank_name: "HDFC Bank".into(),
                holder_name: "Asha Rao".into(),
                account_number: "123456789012".into(),
                routing_code: "HDFC0001234".into(),
                account_type: AccountType::Savings,
            },
            is_verified: false,
            is_primary: true,
            verification_method: VerificationMethod::None,
            revision: 0,
            created_at: Utc::now(),
        };
        assert_eq!(account.masked_number(), "XXXXXXXX9012");
    }

    #[test]
    fn bank_account_reads_from_metadata() {
        let entry = LedgerEntry {
            id: EntryId(7),
            account: Uuid::nil(),
            amount: Amount::from_major(-100),
            kind: EntryKind::Withdrawal,
            status: EntryStatus::Pending,
            description: "payout".into(),
            booking_id: None,
            metadata: [(meta::BANK_ACCOUNT_ID.to_string(), "42".to_string())].into(),
            idempotency_key: None,
            created_at: Utc::now(),
        };
        assert_eq!(entry.bank_account(), Some(BankAccountId(42)));
        assert!(!entry.is_earnings_withdrawal());
    }
}
