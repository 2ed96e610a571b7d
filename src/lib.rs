pub mod amount;
pub mod balance;
pub mod clock;
pub mod config;
pub mod csv;
pub mod error;
pub mod event;
pub mod gateway;
pub mod intake;
pub mod ledger;
pub mod model;
pub mod registry;
pub mod replay;
pub mod service;
pub mod settlement;
pub mod sim;
pub mod verification;
pub mod withdrawal;

pub use amount::Amount;
pub use balance::{BalanceCalculator, Balances, FundingSource};
pub use config::{PayoutMode, WalletConfig};
pub use error::WalletError;
pub use event::WalletEvent;
pub use ledger::LedgerStore;
pub use model::{AccountId, BankAccount, BankAccountId, EntryId, LedgerEntry, Role};
pub use service::{Caller, WalletService};
