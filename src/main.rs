use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use wallet_ledger::clock::SystemClock;
use wallet_ledger::csv::{read_operations, write_balances};
use wallet_ledger::replay::Replay;
use wallet_ledger::{WalletConfig, WalletService, sim};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::WARN.into()))
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        error!("usage: wallet-ledger <operations.csv> [config.toml]");
        return ExitCode::FAILURE;
    };

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let config = match args.next() {
        Some(config) => match WalletConfig::load(Path::new(&config)) {
            Ok(config) => config,
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => WalletConfig::default(),
    };

    let service = match WalletService::new(config, sim::gateways(), Arc::new(SystemClock)) {
        Ok(service) => service,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let operations = match read_operations(path) {
        Ok(operations) => operations,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let replay = Replay::new(service);
    let (op_sender, op_receiver) = tokio::sync::mpsc::channel(16);

    tokio::task::spawn_blocking(move || {
        for result in operations {
            match result {
                Ok(op) => {
                    if op_sender.blocking_send(op).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    replay.run(ReceiverStream::new(op_receiver)).await;

    let balances = replay.summary().await;
    if let Err(e) = write_balances(std::io::stdout().lock(), balances) {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
