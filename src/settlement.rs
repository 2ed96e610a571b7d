//! Booking settlement: customers paying for sessions from their wallet, refunds of
//! those payments, and designer earnings once a session is completed.
//!
//! Each operation is keyed by booking, so replaying it is harmless.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::Amount;
use crate::balance::FundingSource;
use crate::ledger::{Appended, LedgerError, LedgerStore};
use crate::model::{AccountId, EntryKind, EntryStatus, NewEntry, meta};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Amount),
    #[error("a booking id is required")]
    MissingBooking,
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: Amount, requested: Amount },
    #[error("no completed payment for booking {0}")]
    PaymentNotFound(String),
    #[error("refund of {requested} exceeds the {paid} paid for the booking")]
    RefundExceedsPayment { paid: Amount, requested: Amount },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub struct Settlement {
    ledger: Arc<LedgerStore>,
}

impl Settlement {
    pub fn new(ledger: Arc<LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Charge `customer`'s wallet for a booking.
    pub async fn pay_for_booking(
        &self,
        customer: AccountId,
        booking_id: &str,
        amount: Amount,
    ) -> Result<Appended, SettlementError> {
        let booking_id = checked(booking_id, amount)?;

        let entry = NewEntry::new(
            customer,
            EntryKind::Payment,
            -amount,
            format!("Payment for booking {booking_id}"),
        )
        .with_booking(booking_id)
        .with_idempotency_key(payment_key(booking_id));

        let appended = self
            .ledger
            .append_with(entry, |balances| {
                let available = balances.withdrawable(FundingSource::Wallet);
                if available < amount {
                    return Err(SettlementError::InsufficientBalance {
                        available,
                        requested: amount,
                    });
                }
                Ok(())
            })
            .await?;

        match appended {
            Appended::Created(pending) => {
                let entry = self
                    .ledger
                    .transition(pending.id, EntryStatus::Completed)
                    .await?;
                info!(account = %customer, entry = %entry.id, booking = booking_id, "booking paid");
                Ok(Appended::Created(entry))
            }
            existing => Ok(existing),
        }
    }

    /// Return up to the amount paid for a booking to `customer`'s wallet.
    ///
    /// A booking is refunded at most once; repeating the call returns the first
    /// refund.
    pub async fn refund_booking(
        &self,
        customer: AccountId,
        booking_id: &str,
        amount: Amount,
    ) -> Result<Appended, SettlementError> {
        let booking_id = checked(booking_id, amount)?;

        let payment = self
            .ledger
            .find_by_key(&payment_key(booking_id))
            .await
            .filter(|p| p.account == customer && p.status == EntryStatus::Completed)
            .ok_or_else(|| SettlementError::PaymentNotFound(booking_id.to_string()))?;
        let paid = payment.amount.abs();
        if amount > paid {
            return Err(SettlementError::RefundExceedsPayment {
                paid,
                requested: amount,
            });
        }

        let entry = NewEntry::new(
            customer,
            EntryKind::Refund,
            amount,
            format!("Refund for booking {booking_id}"),
        )
        .with_booking(booking_id)
        .with_idempotency_key(refund_key(booking_id));
        let appended = self
            .ledger
            .append_with(entry, |_| Ok::<_, SettlementError>(()))
            .await?;
        if appended.is_created() {
            info!(account = %customer, entry = %appended.entry().id, booking = booking_id, "booking refunded");
        }
        Ok(appended)
    }

    /// Credit a designer's earnings for a completed session.
    pub async fn credit_session_earnings(
        &self,
        designer: AccountId,
        booking_id: &str,
        amount: Amount,
    ) -> Result<Appended, SettlementError> {
        let booking_id = checked(booking_id, amount)?;

        let entry = NewEntry::new(
            designer,
            EntryKind::Deposit,
            amount,
            format!("Earnings for session {booking_id}"),
        )
        .with_booking(booking_id)
        .with_meta(meta::EARNINGS_TYPE, meta::SESSION_COMPLETION)
        .with_idempotency_key(earnings_key(booking_id));

        let appended = self
            .ledger
            .append_with(entry, |_| Ok::<_, SettlementError>(()))
            .await?;
        if appended.is_created() {
            info!(account = %designer, entry = %appended.entry().id, booking = booking_id, "session earnings credited");
        }
        Ok(appended)
    }
}

fn checked(booking_id: &str, amount: Amount) -> Result<&str, SettlementError> {
    if !amount.is_positive() {
        return Err(SettlementError::InvalidAmount(amount));
    }
    let booking_id = booking_id.trim();
    if booking_id.is_empty() {
        return Err(SettlementError::MissingBooking);
    }
    Ok(booking_id)
}

fn payment_key(booking_id: &str) -> String {
    format!("payment:{booking_id}")
}

fn refund_key(booking_id: &str) -> String {
    format!("refund:{booking_id}")
}

fn earnings_key(booking_id: &str) -> String {
    format!("earnings:{booking_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use uuid::Uuid;

    async fn funded(major: i64) -> (Arc<LedgerStore>, Settlement, AccountId) {
        let ledger = Arc::new(LedgerStore::in_memory(Arc::new(SystemClock)));
        let customer = Uuid::new_v4();
        ledger
            .append(NewEntry::new(
                customer,
                EntryKind::Deposit,
                Amount::from_major(major),
                "top-up",
            ))
            .await
            .unwrap();
        let settlement = Settlement::new(Arc::clone(&ledger));
        (ledger, settlement, customer)
    }

    #[tokio::test]
    async fn payment_debits_wallet_once() {
        let (ledger, settlement, customer) = funded(1_000).await;

        let first = settlement
            .pay_for_booking(customer, "bk-17", Amount::from_major(400))
            .await
            .unwrap();
        let again = settlement
            .pay_for_booking(customer, "bk-17", Amount::from_major(400))
            .await
            .unwrap();

        assert_eq!(first.entry().status, EntryStatus::Completed);
        assert_eq!(first.entry().booking_id.as_deref(), Some("bk-17"));
        assert!(!again.is_created());
        assert_eq!(ledger.balances(customer).await.wallet, Amount::from_major(600));
    }

    #[tokio::test]
    async fn payment_needs_funds() {
        let (ledger, settlement, customer) = funded(100).await;

        let result = settlement
            .pay_for_booking(customer, "bk-1", Amount::from_major(150))
            .await;
        assert!(matches!(result, Err(SettlementError::InsufficientBalance { .. })));
        assert_eq!(ledger.balances(customer).await.wallet, Amount::from_major(100));
    }

    #[tokio::test]
    async fn refund_is_capped_and_single() {
        let (ledger, settlement, customer) = funded(1_000).await;
        settlement
            .pay_for_booking(customer, "bk-9", Amount::from_major(400))
            .await
            .unwrap();

        assert!(matches!(
            settlement
                .refund_booking(customer, "bk-9", Amount::from_major(401))
                .await,
            Err(SettlementError::RefundExceedsPayment { .. })
        ));
        let first = settlement
            .refund_booking(customer, "bk-9", Amount::from_major(250))
            .await
            .unwrap();
        let again = settlement
            .refund_booking(customer, "bk-9", Amount::from_major(250))
            .await
            .unwrap();
        assert!(first.is_created());
        assert!(!again.is_created());

        assert_eq!(ledger.balances(customer).await.wallet, Amount::from_major(850));
    }

    #[tokio::test]
    async fn refund_requires_own_payment() {
        let (_, settlement, customer) = funded(1_000).await;
        settlement
            .pay_for_booking(customer, "bk-3", Amount::from_major(200))
            .await
            .unwrap();

        assert!(matches!(
            settlement
                .refund_booking(Uuid::new_v4(), "bk-3", Amount::from_major(50))
                .await,
            Err(SettlementError::PaymentNotFound(_))
        ));
        assert!(matches!(
            settlement
                .refund_booking(customer, "bk-404", Amount::from_major(50))
                .await,
            Err(SettlementError::PaymentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn earnings_are_tagged_and_idempotent() {
        let ledger = Arc::new(LedgerStore::in_memory(Arc::new(SystemClock)));
        let settlement = Settlement::new(Arc::clone(&ledger));
        let designer = Uuid::new_v4();

        for _ in 0..2 {
            settlement
                .credit_session_earnings(designer, "bk-5", Amount::from_major(800))
                .await
                .unwrap();
        }

        let balances = ledger.balances(designer).await;
        assert_eq!(balances.earnings, Amount::from_major(800));
        assert_eq!(balances.wallet, Amount::from_major(800));
    }
}
