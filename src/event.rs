//! Domain events for external notifiers.

use tokio::sync::broadcast;

use crate::Amount;
use crate::model::{AccountId, BankAccountId, EntryId, VerificationMethod};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    DepositRecorded {
        account: AccountId,
        entry: EntryId,
        amount: Amount,
    },
    WithdrawalCompleted {
        account: AccountId,
        entry: EntryId,
        amount: Amount,
    },
    WithdrawalFailed {
        account: AccountId,
        entry: EntryId,
        reason: String,
    },
    VerificationSucceeded {
        account: AccountId,
        bank_account: BankAccountId,
        method: VerificationMethod,
    },
}

/// Fan-out of [`WalletEvent`]s. Publishing never blocks; slow subscribers lag.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WalletEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn publish(&self, event: WalletEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
