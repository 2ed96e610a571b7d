//! Batch replay of wallet operations against a [`WalletService`].
//!
//! Clients are identified by small integers in the input; each maps to a fixed
//! account id. Failed operations are logged and skipped.

use thiserror::Error;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::Amount;
use crate::balance::Balances;
use crate::error::WalletError;
use crate::model::{AccountId, AccountType, BankDetails};
use crate::service::{Caller, WalletService};
use crate::verification::BankApiOutcome;

pub type ClientId = u64;

/// One row of replay input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Gateway-confirmed wallet top-up.
    Deposit {
        client: ClientId,
        reference: String,
        amount: Amount,
    },
    /// Designer earnings for a completed session.
    Earning {
        client: ClientId,
        booking: String,
        amount: Amount,
    },
    Payment {
        client: ClientId,
        booking: String,
        amount: Amount,
    },
    Refund {
        client: ClientId,
        booking: String,
        amount: Amount,
    },
    /// Register a bank account and verify it against the directory.
    Bank {
        client: ClientId,
        routing_code: String,
        account_number: String,
    },
    /// Withdraw to the client's primary bank account. Designers draw on earnings.
    Withdrawal {
        client: ClientId,
        designer: bool,
        amount: Amount,
    },
}

impl Operation {
    pub fn client(&self) -> ClientId {
        match self {
            Operation::Deposit { client, .. }
            | Operation::Earning { client, .. }
            | Operation::Payment { client, .. }
            | Operation::Refund { client, .. }
            | Operation::Bank { client, .. }
            | Operation::Withdrawal { client, .. } => *client,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Operation::Deposit { .. } => "deposit",
            Operation::Earning { .. } => "earning",
            Operation::Payment { .. } => "payment",
            Operation::Refund { .. } => "refund",
            Operation::Bank { .. } => "bank",
            Operation::Withdrawal { designer: false, .. } => "withdrawal",
            Operation::Withdrawal { designer: true, .. } => "payout",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("client {0} has no bank account")]
    NoBankAccount(ClientId),
    #[error("bank directory rejected account of client {client}: {reason:?}")]
    BankRejected {
        client: ClientId,
        reason: crate::gateway::MismatchReason,
    },
    #[error(transparent)]
    Wallet(#[from] WalletError),
}

pub fn account_id(client: ClientId) -> AccountId {
    Uuid::from_u128(u128::from(client))
}

pub fn client_id(account: AccountId) -> Option<ClientId> {
    ClientId::try_from(account.as_u128()).ok()
}

pub struct Replay {
    service: WalletService,
}

/// Public API
impl Replay {
    pub fn new(service: WalletService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &WalletService {
        &self.service
    }

    /// Apply every operation of `stream` in order.
    pub async fn run(&self, mut stream: impl Stream<Item = Operation> + Unpin) {
        while let Some(op) = stream.next().await {
            // a failed operation must not stop the replay
            let _ = self.apply(op).await;
        }
    }

    pub async fn apply(&self, op: Operation) -> Result<(), ReplayError> {
        let name = op.name();
        let client = op.client();
        let result = self.apply_inner(op).await;
        match &result {
            Ok(()) => info!(client, "{name} applied"),
            Err(e) => warn!(client, "{name} failed: {e}"),
        }
        result
    }

    /// Balances of every client seen, ordered by client id.
    pub async fn summary(&self) -> Vec<(ClientId, Balances)> {
        let mut rows = Vec::new();
        for account in self.service.accounts().await {
            if let Some(client) = client_id(account) {
                rows.push((client, self.service.account_balances(account).await));
            }
        }
        rows.sort_by_key(|(client, _)| *client);
        rows
    }
}

/// Private API
impl Replay {
    async fn apply_inner(&self, op: Operation) -> Result<(), ReplayError> {
        let service = &self.service;
        match op {
            Operation::Deposit {
                client,
                reference,
                amount,
            } => {
                service
                    .record_deposit(account_id(client), amount, &reference)
                    .await?;
            }
            Operation::Earning {
                client,
                booking,
                amount,
            } => {
                service
                    .credit_session_earnings(account_id(client), &booking, amount)
                    .await?;
            }
            Operation::Payment {
                client,
                booking,
                amount,
            } => {
                let caller = Caller::customer(account_id(client));
                service.pay_for_booking(&caller, &booking, amount).await?;
            }
            Operation::Refund {
                client,
                booking,
                amount,
            } => {
                service
                    .refund_booking(account_id(client), &booking, amount)
                    .await?;
            }
            Operation::Bank {
                client,
                routing_code,
                account_number,
            } => {
                let caller = Caller::customer(account_id(client));
                let details = BankDetails {
                    bank_name: bank_name(&routing_code),
                    holder_name: format!("Client {client}"),
                    account_number,
                    routing_code,
                    account_type: AccountType::Savings,
                };
                let account = service.add_bank_account(&caller, details).await?;
                if let BankApiOutcome::Rejected(reason) =
                    service.verify_with_bank_api(&caller, account.id).await?
                {
                    return Err(ReplayError::BankRejected { client, reason });
                }
            }
            Operation::Withdrawal {
                client,
                designer,
                amount,
            } => {
                let account = account_id(client);
                let caller = if designer {
                    Caller::designer(account)
                } else {
                    Caller::customer(account)
                };
                let primary = service
                    .bank_accounts(&caller)
                    .await
                    .into_iter()
                    .next()
                    .ok_or(ReplayError::NoBankAccount(client))?;
                service
                    .request_withdrawal(&caller, amount, primary.id, "")
                    .await?;
            }
        }
        Ok(())
    }
}

/// The routing code's four-letter bank prefix.
fn bank_name(routing_code: &str) -> String {
    let prefix: String = routing_code.chars().take(4).collect();
    format!("{} Bank", prefix.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::WalletConfig;
    use crate::sim;
    use std::sync::Arc;

    fn replay() -> Replay {
        let service =
            WalletService::new(WalletConfig::default(), sim::gateways(), Arc::new(SystemClock))
                .unwrap();
        Replay::new(service)
    }

    fn major(value: i64) -> Amount {
        Amount::from_major(value)
    }

    #[test]
    fn client_ids_round_trip() {
        assert_eq!(client_id(account_id(42)), Some(42));
        assert_eq!(client_id(Uuid::from_u128(u128::MAX)), None);
    }

    #[tokio::test]
    async fn customer_flow() {
        let replay = replay();
        let ops = vec![
            Operation::Deposit {
                client: 1,
                reference: "pay_1".into(),
                amount: major(1_000),
            },
            Operation::Deposit {
                client: 1,
                reference: "pay_1".into(),
                amount: major(1_000),
            },
            Operation::Payment {
                client: 1,
                booking: "bk-1".into(),
                amount: major(300),
            },
            Operation::Refund {
                client: 1,
                booking: "bk-1".into(),
                amount: major(100),
            },
            Operation::Bank {
                client: 1,
                routing_code: "HDFC0001234".into(),
                account_number: "123456789012".into(),
            },
            Operation::Withdrawal {
                client: 1,
                designer: false,
                amount: major(500),
            },
        ];
        replay.run(tokio_stream::iter(ops)).await;

        let summary = replay.summary().await;
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].0, 1);
        assert_eq!(summary[0].1.wallet, major(300));
    }

    #[tokio::test]
    async fn withdrawal_without_bank_account_is_skipped() {
        let replay = replay();
        replay
            .apply(Operation::Deposit {
                client: 7,
                reference: "pay_7".into(),
                amount: major(500),
            })
            .await
            .unwrap();

        let result = replay
            .apply(Operation::Withdrawal {
                client: 7,
                designer: false,
                amount: major(200),
            })
            .await;
        assert!(matches!(result, Err(ReplayError::NoBankAccount(7))));
    }

    #[tokio::test]
    async fn designer_payout_uses_earnings() {
        let replay = replay();
        for op in [
            Operation::Earning {
                client: 2,
                booking: "bk-9".into(),
                amount: major(800),
            },
            Operation::Bank {
                client: 2,
                routing_code: "sbin0004321".into(),
                account_number: "30012345678".into(),
            },
            Operation::Withdrawal {
                client: 2,
                designer: true,
                amount: major(600),
            },
        ] {
            replay.apply(op).await.unwrap();
        }

        let (_, balances) = replay.summary().await.remove(0);
        assert_eq!(balances.earnings, major(200));
        assert_eq!(balances.wallet, major(200));
    }
}
