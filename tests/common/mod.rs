#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use wallet_ledger::clock::ManualClock;
use wallet_ledger::gateway::{
    BankDirectory, DirectoryMatch, GatewayError, Gateways, OtpChannel, OtpDispatcher,
    PayoutGateway, PayoutReceipt, TransferRequest,
};
use wallet_ledger::model::{AccountType, BankDetails};
use wallet_ledger::{Amount, WalletConfig, WalletService};

/// Records every code it is asked to send.
#[derive(Default)]
pub struct Inbox {
    codes: Mutex<Vec<String>>,
}

impl Inbox {
    pub fn last_code(&self) -> String {
        self.codes.lock().unwrap().last().cloned().expect("no code sent")
    }
}

#[async_trait]
impl OtpDispatcher for Inbox {
    async fn dispatch(&self, _: OtpChannel, _: &str, code: &str) -> Result<(), GatewayError> {
        self.codes.lock().unwrap().push(code.to_string());
        Ok(())
    }
}

/// Payout gateway that pays, or declines once `decline` is set.
#[derive(Default)]
pub struct Bank {
    pub decline: Mutex<Option<String>>,
    transfers: Mutex<Vec<TransferRequest>>,
}

impl Bank {
    pub fn transfers(&self) -> Vec<TransferRequest> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn last_amount(&self) -> Amount {
        self.transfers().last().expect("no transfer").amount
    }

    pub fn decline_with(&self, reason: &str) {
        *self.decline.lock().unwrap() = Some(reason.to_string());
    }
}

#[async_trait]
impl PayoutGateway for Bank {
    async fn transfer(&self, request: TransferRequest) -> Result<PayoutReceipt, GatewayError> {
        let reference = format!("utr-{}", request.idempotency_key);
        self.transfers.lock().unwrap().push(request);
        match self.decline.lock().unwrap().clone() {
            Some(reason) => Err(GatewayError::Declined { reason }),
            None => Ok(PayoutReceipt { reference }),
        }
    }
}

pub struct Directory(pub DirectoryMatch);

#[async_trait]
impl BankDirectory for Directory {
    async fn lookup(&self, _: &BankDetails) -> Result<DirectoryMatch, GatewayError> {
        Ok(self.0)
    }
}

pub struct Harness {
    pub service: WalletService,
    pub inbox: Arc<Inbox>,
    pub bank: Arc<Bank>,
    pub clock: Arc<ManualClock>,
}

pub fn harness() -> Harness {
    harness_with(WalletConfig::default())
}

pub fn harness_with(config: WalletConfig) -> Harness {
    let inbox = Arc::new(Inbox::default());
    let bank = Arc::new(Bank::default());
    let clock = Arc::new(ManualClock::default());
    let gateways = Gateways {
        payouts: bank.clone(),
        otp: inbox.clone(),
        directory: Arc::new(Directory(DirectoryMatch::Matched)),
    };
    let service = WalletService::new(config, gateways, clock.clone()).expect("valid config");
    Harness {
        service,
        inbox,
        bank,
        clock,
    }
}

pub fn details(number: &str) -> BankDetails {
    BankDetails {
        bank_name: "Axis Bank".into(),
        holder_name: "Kavya Nair".into(),
        account_number: number.into(),
        routing_code: "UTIB0000456".into(),
        account_type: AccountType::Savings,
    }
}

pub fn rupees(value: i64) -> Amount {
    Amount::from_major(value)
}
