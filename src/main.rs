use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand};
use commission_settlement::application::SettlementContext;
use commission_settlement::application::dispatcher::{CleanupPolicy, PayoutDispatcher};
use commission_settlement::application::reconciler::{
    ReconcileReport, ReconcilerConfig, SettlementReconciler,
};
use commission_settlement::application::scheduler::{Scheduler, SchedulerConfig};
use commission_settlement::application::sweeper::ExpirySweeper;
use commission_settlement::domain::events::CheckoutCompleted;
use commission_settlement::domain::ports::{
    CommissionStoreRef, LedgerStoreRef, PayeeDirectoryRef, WatermarkStoreRef,
};
use commission_settlement::infrastructure::clock::SystemClock;
use commission_settlement::infrastructure::in_memory::{
    InMemoryCommissionStore, InMemoryLedgerStore, InMemoryPayeeDirectory, InMemoryWatermarkStore,
};
use commission_settlement::infrastructure::notifier::LogNotifier;
use commission_settlement::infrastructure::sandbox_processor::SandboxProcessor;
use commission_settlement::interfaces::csv::report_writer::ReportWriter;
use commission_settlement::interfaces::seed::Seed;
use miette::{IntoDiagnostic, Result, miette};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "SETTLEMENT_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    /// JSON file with payees, commissions, ledger entries and processor state to load first.
    #[arg(long, global = true)]
    seed: Option<PathBuf>,

    #[arg(long, default_value_t = 45, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    reconcile_interval_mins: u64,

    #[arg(long, default_value_t = 60, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    dispatch_interval_mins: u64,

    #[arg(long, default_value_t = 60, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    sweep_interval_mins: u64,

    /// Minimum spacing between ledger cleanup passes.
    #[arg(long, default_value_t = 24, global = true, value_parser = clap::value_parser!(i64).range(1..))]
    cleanup_interval_hours: i64,

    /// Ledger entries older than this are flagged for review.
    #[arg(long, default_value_t = 30, global = true, value_parser = clap::value_parser!(i64).range(1..))]
    retention_days: i64,

    /// How far back the reconciliation sweep looks when it has never run.
    #[arg(long, default_value_t = 24, global = true, value_parser = clap::value_parser!(i64).range(1..))]
    lookback_hours: i64,
}

#[derive(Subcommand)]
enum Command {
    /// Replay recently completed checkouts from the processor.
    Reconcile,
    /// Apply one completed-checkout event read from a JSON file.
    Webhook { event: PathBuf },
    /// Drain payee ledgers into transfers.
    Dispatch,
    /// Cancel and refund commissions past their delivery window.
    Sweep,
    /// Remove invalid and duplicate ledger entries, flag stale ones.
    Cleanup,
    /// Run every job on its schedule until interrupted.
    Serve,
}

struct Stores {
    commissions: CommissionStoreRef,
    ledger: LedgerStoreRef,
    payees: PayeeDirectoryRef,
    watermarks: WatermarkStoreRef,
}

fn in_memory_stores() -> Stores {
    Stores {
        commissions: Arc::new(InMemoryCommissionStore::new()),
        ledger: Arc::new(InMemoryLedgerStore::new()),
        payees: Arc::new(InMemoryPayeeDirectory::new()),
        watermarks: Arc::new(InMemoryWatermarkStore::new()),
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    use commission_settlement::infrastructure::rocksdb::RocksDBStore;

    match db_path {
        Some(path) => {
            let store = RocksDBStore::open(path).into_diagnostic()?;
            Ok(Stores {
                commissions: Arc::new(store.clone()),
                ledger: Arc::new(store.clone()),
                payees: Arc::new(store.clone()),
                watermarks: Arc::new(store),
            })
        }
        None => Ok(in_memory_stores()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(in_memory_stores())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,commission_settlement=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn hours(n: i64) -> Result<ChronoDuration> {
    ChronoDuration::try_hours(n).ok_or_else(|| miette!("{n} hours is out of range"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let stores = open_stores(cli.db_path)?;
    let processor = SandboxProcessor::new();
    let ctx = SettlementContext {
        commissions: stores.commissions,
        ledger: stores.ledger,
        payees: stores.payees,
        watermarks: stores.watermarks,
        processor: Arc::new(processor.clone()),
        notifier: Arc::new(LogNotifier),
        clock: Arc::new(SystemClock),
    };

    if let Some(path) = cli.seed {
        Seed::from_path(path)
            .into_diagnostic()?
            .apply(&ctx, &processor)
            .await
            .into_diagnostic()?;
    }

    let reconciler_config = ReconcilerConfig {
        lookback: hours(cli.lookback_hours)?,
        ..Default::default()
    };
    let cleanup_policy = CleanupPolicy {
        retention: ChronoDuration::try_days(cli.retention_days)
            .ok_or_else(|| miette!("{} days is out of range", cli.retention_days))?,
        interval: hours(cli.cleanup_interval_hours)?,
    };

    let stdout = io::stdout();
    let mut report = ReportWriter::new(stdout.lock());

    match cli.command {
        Command::Reconcile => {
            let reconciler = SettlementReconciler::new(ctx, reconciler_config);
            let result = reconciler.sweep_recent().await.into_diagnostic()?;
            report.write_reconcile(&result).into_diagnostic()?;
        }
        Command::Webhook { event } => {
            let file = File::open(event).into_diagnostic()?;
            let event: CheckoutCompleted = serde_json::from_reader(file).into_diagnostic()?;
            let session_id = event.session_id.clone();
            let reconciler = SettlementReconciler::new(ctx, reconciler_config);
            let outcome = reconciler.handle_checkout_completed(event).await;
            let result = ReconcileReport {
                scanned: 1,
                items: vec![(session_id, outcome)],
            };
            report.write_reconcile(&result).into_diagnostic()?;
        }
        Command::Dispatch => {
            let result = PayoutDispatcher::new(ctx, cleanup_policy).run().await;
            if let Some(reason) = &result.aborted {
                tracing::warn!(%reason, "dispatch run aborted");
            }
            report.write_dispatch(&result).into_diagnostic()?;
        }
        Command::Sweep => {
            let result = ExpirySweeper::new(ctx).run().await.into_diagnostic()?;
            report.write_sweep(&result).into_diagnostic()?;
        }
        Command::Cleanup => {
            let result = PayoutDispatcher::new(ctx, cleanup_policy)
                .cleanup()
                .await
                .into_diagnostic()?;
            report.write_cleanup(&result).into_diagnostic()?;
        }
        Command::Serve => {
            let config = SchedulerConfig {
                reconcile_every: Duration::from_secs(cli.reconcile_interval_mins * 60),
                dispatch_every: Duration::from_secs(cli.dispatch_interval_mins * 60),
                sweep_every: Duration::from_secs(cli.sweep_interval_mins * 60),
                ..Default::default()
            };
            let handles = Scheduler::new(ctx, config, reconciler_config, cleanup_policy).start();
            tokio::signal::ctrl_c().await.into_diagnostic()?;
            tracing::info!("shutting down scheduler");
            for handle in handles {
                handle.abort();
            }
        }
    }

    Ok(())
}
