use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::Amount;
use crate::model::{BankAccountId, VerificationMethod};

/// Smallest and largest micro-deposit, in paise (₹1.00 to ₹10.00).
const MICRO_DEPOSIT_RANGE: std::ops::RangeInclusive<i64> = 100..=1_000;

/// What the account holder must echo back.
#[derive(Debug, Clone)]
pub enum Challenge {
    Otp { salt: String, code_hash: String },
    MicroDeposit { expected: Amount, reference: String },
}

/// A live verification flow for one bank account.
#[derive(Debug, Clone)]
pub struct VerificationAttempt {
    pub bank_account: BankAccountId,
    pub method: VerificationMethod,
    pub challenge: Challenge,
    pub expires_at: DateTime<Utc>,
    pub attempts_remaining: u32,
    /// Bank account revision the challenge was issued against.
    pub revision: u32,
}

impl VerificationAttempt {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn matches_code(&self, code: &str) -> bool {
        match &self.challenge {
            Challenge::Otp { salt, code_hash } => {
                hash_code(salt, self.bank_account, code.trim()) == *code_hash
            }
            Challenge::MicroDeposit { .. } => false,
        }
    }

    pub fn matches_amount(&self, amount: Amount) -> bool {
        match &self.challenge {
            Challenge::MicroDeposit { expected, .. } => *expected == amount,
            Challenge::Otp { .. } => false,
        }
    }

    pub fn is_otp(&self) -> bool {
        matches!(self.challenge, Challenge::Otp { .. })
    }
}

/// Hex SHA-256 of salt, bank account and code; the plaintext code is never kept.
pub fn hash_code(salt: &str, bank_account: BankAccountId, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(bank_account.0.to_be_bytes());
    hasher.update(b":");
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn generate_salt() -> String {
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    hex::encode(bytes)
}

/// Uniform zero-padded numeric code of `length` digits.
pub fn generate_code(length: u32) -> String {
    let upper = 10u64.pow(length);
    let code = rand::thread_rng().gen_range(0..upper);
    format!("{code:0width$}", width = length as usize)
}

pub fn random_micro_deposit() -> Amount {
    Amount::from_minor(rand::thread_rng().gen_range(MICRO_DEPOSIT_RANGE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn otp_attempt(code: &str) -> VerificationAttempt {
        let salt = generate_salt();
        VerificationAttempt {
            bank_account: BankAccountId(1),
            method: VerificationMethod::Sms,
            challenge: Challenge::Otp {
                code_hash: hash_code(&salt, BankAccountId(1), code),
                salt,
            },
            expires_at: Utc::now(),
            attempts_remaining: 3,
            revision: 0,
        }
    }

    #[test]
    fn codes_have_requested_length() {
        for _ in 0..100 {
            let code = generate_code(6);
            assert_eq!(code.len(), 6);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn hash_depends_on_salt_and_account() {
        let a = hash_code("salt-a", BankAccountId(1), "123456");
        assert_ne!(a, hash_code("salt-b", BankAccountId(1), "123456"));
        assert_ne!(a, hash_code("salt-a", BankAccountId(2), "123456"));
        assert_eq!(a, hash_code("salt-a", BankAccountId(1), "123456"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn otp_matches_only_its_code() {
        let attempt = otp_attempt("654321");
        assert!(attempt.matches_code("654321"));
        assert!(attempt.matches_code(" 654321 "));
        assert!(!attempt.matches_code("123456"));
        assert!(!attempt.matches_amount(Amount::from_minor(347)));
    }

    #[test]
    fn micro_deposit_matches_exact_amount() {
        let attempt = VerificationAttempt {
            bank_account: BankAccountId(1),
            method: VerificationMethod::MicroDeposit,
            challenge: Challenge::MicroDeposit {
                expected: Amount::from_minor(347),
                reference: "po_1".into(),
            },
            expires_at: Utc::now(),
            attempts_remaining: 3,
            revision: 0,
        };
        assert!(attempt.matches_amount("3.47".parse().unwrap()));
        assert!(!attempt.matches_amount("3.4".parse().unwrap()));
        assert!(!attempt.matches_code("347"));
    }

    #[test]
    fn micro_deposits_stay_in_range() {
        for _ in 0..200 {
            let amount = random_micro_deposit();
            assert!(amount >= Amount::from_major(1) && amount <= Amount::from_major(10));
        }
    }
}
