use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;
use wallet_ledger::clock::SystemClock;
use wallet_ledger::model::{AccountType, BankDetails};
use wallet_ledger::replay::{ClientId, Operation, Replay, account_id};
use wallet_ledger::{Amount, Caller, WalletConfig, WalletService, sim};

/// Generates valid operation sequences for benchmarking.
///
/// Pattern per client (repeating):
/// 1. Deposit 100
/// 2. Deposit 50
/// 3. Payment 30
///
/// This ensures payments never exceed the wallet balance.
pub struct OpGenerator {
    next_ref: u64,
    num_clients: ClientId,
    ops_per_client: u32,
    current_client: ClientId,
    current_step: u32,
}

impl OpGenerator {
    pub fn new(num_clients: ClientId, ops_per_client: u32) -> Self {
        Self {
            next_ref: 1,
            num_clients,
            ops_per_client,
            current_client: 1,
            current_step: 0,
        }
    }
}

impl Iterator for OpGenerator {
    type Item = Operation;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_client > self.num_clients {
            return None;
        }

        let reference = format!("ref-{}", self.next_ref);
        self.next_ref += 1;

        let op = match self.current_step % 3 {
            0 => Operation::Deposit {
                client: self.current_client,
                reference,
                amount: Amount::from_major(100),
            },
            1 => Operation::Deposit {
                client: self.current_client,
                reference,
                amount: Amount::from_major(50),
            },
            _ => Operation::Payment {
                client: self.current_client,
                booking: reference,
                amount: Amount::from_major(30),
            },
        };

        self.current_step += 1;

        // Move to next client after ops_per_client operations
        if self.current_step >= self.ops_per_client {
            self.current_step = 0;
            self.current_client += 1;
        }

        Some(op)
    }
}

fn service() -> WalletService {
    WalletService::new(WalletConfig::default(), sim::gateways(), Arc::new(SystemClock))
        .expect("default config is valid")
}

fn bench_replay(c: &mut Criterion) {
    let runtime = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("replay");

    for (clients, ops_per) in [(1, 10_000), (100, 100), (1_000, 10)] {
        let label = format!("{clients}c_{ops_per}op");
        group.bench_with_input(
            BenchmarkId::from_parameter(&label),
            &(clients, ops_per),
            |b, &(clients, ops_per)| {
                b.to_async(&runtime).iter(|| async move {
                    let replay = Replay::new(service());
                    for op in OpGenerator::new(clients, ops_per) {
                        let _ = black_box(replay.apply(op).await);
                    }
                    replay
                });
            },
        );
    }

    group.finish();
}

fn bench_concurrent_withdrawals(c: &mut Criterion) {
    let runtime = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("concurrent_withdrawals");
    group.sample_size(10);

    for clients in [8u64, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, &clients| {
            b.to_async(&runtime).iter(|| async move {
                let service = Arc::new(service());
                let tasks: Vec<_> = (1..=clients)
                    .map(|client| {
                        let service = Arc::clone(&service);
                        tokio::spawn(async move {
                            let caller = Caller::customer(account_id(client));
                            let bank = service
                                .add_bank_account(
                                    &caller,
                                    BankDetails {
                                        bank_name: "Bench Bank".into(),
                                        holder_name: format!("Client {client}"),
                                        account_number: format!("{:012}", client),
                                        routing_code: "BNCH0000001".into(),
                                        account_type: AccountType::Current,
                                    },
                                )
                                .await
                                .expect("valid bank details");
                            let _ = service.verify_with_bank_api(&caller, bank.id).await;
                            for n in 0..100 {
                                let reference = format!("dep-{client}-{n}");
                                let _ = service
                                    .record_deposit(caller.account, Amount::from_major(150), &reference)
                                    .await;
                                let _ = black_box(
                                    service
                                        .request_withdrawal(&caller, Amount::from_major(100), bank.id, "")
                                        .await,
                                );
                            }
                        })
                    })
                    .collect();
                for task in tasks {
                    let _ = task.await;
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_replay, bench_concurrent_withdrawals);
criterion_main!(benches);
