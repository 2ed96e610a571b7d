//! In-process stand-ins for the external gateways, used by the replay binary.
//!
//! Payouts settle instantly, codes are only logged as sent, and every bank account
//! is found in the directory.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::gateway::{
    BankDirectory, DirectoryMatch, Gateways, GatewayError, OtpChannel, OtpDispatcher,
    PayoutGateway, PayoutReceipt, TransferRequest,
};
use crate::model::BankDetails;

#[derive(Debug, Default)]
pub struct InstantPayouts;

#[async_trait]
impl PayoutGateway for InstantPayouts {
    async fn transfer(&self, request: TransferRequest) -> Result<PayoutReceipt, GatewayError> {
        debug!(key = %request.idempotency_key, amount = %request.amount, "simulated payout");
        Ok(PayoutReceipt {
            reference: format!("sim-{}", request.idempotency_key),
        })
    }
}

#[derive(Debug, Default)]
pub struct SilentOtp;

#[async_trait]
impl OtpDispatcher for SilentOtp {
    async fn dispatch(&self, channel: OtpChannel, destination: &str, _code: &str) -> Result<(), GatewayError> {
        debug!(?channel, destination, "simulated otp dispatch");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct OpenDirectory;

#[async_trait]
impl BankDirectory for OpenDirectory {
    async fn lookup(&self, _details: &BankDetails) -> Result<DirectoryMatch, GatewayError> {
        Ok(DirectoryMatch::Matched)
    }
}

pub fn gateways() -> Gateways {
    Gateways {
        payouts: Arc::new(InstantPayouts),
        otp: Arc::new(SilentOtp),
        directory: Arc::new(OpenDirectory),
    }
}
