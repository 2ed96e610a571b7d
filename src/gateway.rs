//! External collaborators: payout gateway, OTP channel, bank directory.
//!
//! Every call made through these traits is bounded by [`with_timeout`]. A timeout is
//! reported separately from an explicit decline because the remote side may still
//! have acted on the request; callers rely on idempotency keys to retry safely.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Amount;
use crate::model::BankDetails;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway did not answer within {0:?}")]
    Timeout(Duration),
    #[error("gateway declined: {reason}")]
    Declined { reason: String },
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Whether the remote side definitely did not act on the request.
    pub fn is_definitive(&self) -> bool {
        !matches!(self, GatewayError::Timeout(_))
    }
}

/// Money leaving the platform towards a bank account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRequest {
    /// Stable across retries of the same logical transfer.
    pub idempotency_key: String,
    pub amount: Amount,
    pub beneficiary: BankDetails,
    pub narration: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub reference: String,
}

#[async_trait]
pub trait PayoutGateway: Send + Sync {
    async fn transfer(&self, request: TransferRequest) -> Result<PayoutReceipt, GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpChannel {
    Sms,
    Email,
}

/// Delivers one-time codes out of band.
#[async_trait]
pub trait OtpDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        channel: OtpChannel,
        destination: &str,
        code: &str,
    ) -> Result<(), GatewayError>;
}

/// Why a bank registry lookup did not confirm an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchReason {
    NameMismatch,
    AccountNotFound,
    RoutingInvalid,
    AccountClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryMatch {
    Matched,
    Mismatch(MismatchReason),
}

/// Name/account/routing lookup against the banking network.
#[async_trait]
pub trait BankDirectory: Send + Sync {
    async fn lookup(&self, details: &BankDetails) -> Result<DirectoryMatch, GatewayError>;
}

/// The external collaborators a service is wired to.
#[derive(Clone)]
pub struct Gateways {
    pub payouts: Arc<dyn PayoutGateway>,
    pub otp: Arc<dyn OtpDispatcher>,
    pub directory: Arc<dyn BankDirectory>,
}

/// Await `call`, turning an elapsed deadline into [`GatewayError::Timeout`].
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(limit)),
    }
}
