//! Platform configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Amount;

/// Longest verification window accepted for OTPs and micro-deposits.
pub const MAX_EXPIRY_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How approved withdrawals reach the bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMode {
    /// Instant payout through the payout gateway.
    #[default]
    Gateway,
    /// Left pending for back-office NEFT/IMPS processing.
    Manual,
}

impl PayoutMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PayoutMode::Gateway => "gateway",
            PayoutMode::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub minimum_withdrawal_amount: Amount,
    pub maximum_withdrawal_amount: Amount,
    pub otp_expiry_secs: u64,
    pub otp_max_attempts: u32,
    pub otp_code_length: u32,
    pub micro_deposit_expiry_secs: u64,
    pub micro_deposit_max_attempts: u32,
    pub gateway_timeout_secs: u64,
    pub payout_mode: PayoutMode,
    pub journal_path: Option<PathBuf>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            minimum_withdrawal_amount: Amount::from_major(100),
            maximum_withdrawal_amount: Amount::from_major(50_000),
            otp_expiry_secs: 600,
            otp_max_attempts: 3,
            otp_code_length: 6,
            micro_deposit_expiry_secs: 6 * 60 * 60,
            micro_deposit_max_attempts: 3,
            gateway_timeout_secs: 15,
            payout_mode: PayoutMode::Gateway,
            journal_path: None,
        }
    }
}

impl WalletConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: WalletConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.minimum_withdrawal_amount.is_positive() {
            return Err(ConfigError::Invalid(
                "minimum_withdrawal_amount must be positive".into(),
            ));
        }
        if self.minimum_withdrawal_amount > self.maximum_withdrawal_amount {
            return Err(ConfigError::Invalid(format!(
                "minimum_withdrawal_amount {} exceeds maximum_withdrawal_amount {}",
                self.minimum_withdrawal_amount, self.maximum_withdrawal_amount
            )));
        }
        if self.otp_max_attempts == 0 || self.micro_deposit_max_attempts == 0 {
            return Err(ConfigError::Invalid("attempt limits must be at least 1".into()));
        }
        if !(4..=9).contains(&self.otp_code_length) {
            return Err(ConfigError::Invalid(format!(
                "otp_code_length {} must be between 4 and 9",
                self.otp_code_length
            )));
        }
        for (name, secs) in [
            ("otp_expiry_secs", self.otp_expiry_secs),
            ("micro_deposit_expiry_secs", self.micro_deposit_expiry_secs),
        ] {
            if secs == 0 || secs > MAX_EXPIRY_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{name} {secs} must be between 1 and {MAX_EXPIRY_SECS}"
                )));
            }
        }
        if self.gateway_timeout_secs == 0 {
            return Err(ConfigError::Invalid("gateway_timeout_secs must be non-zero".into()));
        }
        Ok(())
    }

    pub fn otp_expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.otp_expiry_secs as i64)
    }

    pub fn micro_deposit_expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.micro_deposit_expiry_secs as i64)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}
