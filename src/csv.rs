use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Amount;
use crate::amount::AmountError;
use crate::balance::Balances;
use crate::replay::{ClientId, Operation};

/// Errors that can occur when reading operations or writing balances
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized operation type '{op}'")]
    UnrecognizedType { line: usize, op: String },

    #[error("line {line}: {op} missing amount")]
    MissingAmount { line: usize, op: String },

    #[error("line {line}: {op} missing reference")]
    MissingReference { line: usize, op: String },

    #[error("line {line}: invalid amount: {source}")]
    InvalidAmount { line: usize, source: AmountError },

    #[error("line {line}: bank reference must be ROUTING/ACCOUNT_NUMBER, got '{reference}'")]
    BankReference { line: usize, reference: String },

    #[error("failed to write balances: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush balances: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    client: ClientId,
    reference: Option<String>,
    amount: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    client: ClientId,
    wallet: String,
    earnings: String,
    pending: String,
}

/// Read wallet operations from a csv file
pub fn read_operations(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Operation, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

fn parse_row(line: usize, row: InputRow) -> Result<Operation, CsvError> {
    let op = row.r#type.to_ascii_lowercase();
    let client = row.client;

    let amount = || -> Result<Amount, CsvError> {
        let raw = row
            .amount
            .as_deref()
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| CsvError::MissingAmount {
                line,
                op: op.clone(),
            })?;
        raw.parse()
            .map_err(|source| CsvError::InvalidAmount { line, source })
    };
    let reference = || -> Result<String, CsvError> {
        row.reference
            .clone()
            .filter(|reference| !reference.is_empty())
            .ok_or_else(|| CsvError::MissingReference {
                line,
                op: op.clone(),
            })
    };

    match op.as_str() {
        "deposit" => Ok(Operation::Deposit {
            client,
            reference: reference()?,
            amount: amount()?,
        }),
        "earning" => Ok(Operation::Earning {
            client,
            booking: reference()?,
            amount: amount()?,
        }),
        "payment" => Ok(Operation::Payment {
            client,
            booking: reference()?,
            amount: amount()?,
        }),
        "refund" => Ok(Operation::Refund {
            client,
            booking: reference()?,
            amount: amount()?,
        }),
        "bank" => {
            let reference = reference()?;
            let Some((routing_code, account_number)) = reference.split_once('/') else {
                return Err(CsvError::BankReference { line, reference });
            };
            Ok(Operation::Bank {
                client,
                routing_code: routing_code.to_string(),
                account_number: account_number.to_string(),
            })
        }
        "withdrawal" | "payout" => Ok(Operation::Withdrawal {
            client,
            designer: op == "payout",
            amount: amount()?,
        }),
        _ => Err(CsvError::UnrecognizedType {
            line,
            op: op.clone(),
        }),
    }
}

/// Write client balances to `out` in csv format
pub fn write_balances(
    out: impl io::Write,
    balances: impl IntoIterator<Item = (ClientId, Balances)>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(out);

    for (client, balances) in balances {
        writer.serialize(OutputRow {
            client,
            wallet: balances.wallet.to_string(),
            earnings: balances.earnings.to_string(),
            pending: balances.reserved_wallet.to_string(),
        })?;
    }

    writer.flush()?;
    Ok(())
}
