//! txbulk CLI: drive a synthetic bulk load against the in-memory backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use txbulk::backend::{MemoryDomain, MemoryTx};
use txbulk::config::Settings;
use txbulk::telemetry::{TelemetryConfig, init_telemetry};
use txbulk::{
    Budget, Bulk, BulkConfig, BulkReport, Credit, Localities, Op, RuntimeLocalities,
    ThreadLocalities, WorkSource, WorkerId,
};

#[derive(Parser)]
#[command(name = "txbulk", about = "Bulk transaction executor")]
struct Cli {
    /// TOML settings file (environment variables are used otherwise)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a synthetic bulk load
    Run(RunArgs),
    /// Print the effective settings
    Config,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Number of work items to produce
    #[arg(long, default_value_t = 10_000)]
    items: u64,
    /// Maximum items per transaction (overrides settings)
    #[arg(long)]
    max_work_per_tx: Option<u32>,
    /// Number of localities (overrides settings)
    #[arg(long)]
    localities: Option<usize>,
    /// Give each locality its own OS thread
    #[arg(long)]
    threads: bool,
    /// Regions captured per item
    #[arg(long, default_value_t = 1)]
    item_nr: u64,
    /// Bytes captured per item
    #[arg(long, default_value_t = 64)]
    item_size: u64,
    /// Payload bytes per item
    #[arg(long, default_value_t = 16)]
    item_payload: u64,
    /// Per-transaction region ceiling
    #[arg(long, default_value_t = 256)]
    limit_nr: u64,
    /// Per-transaction byte ceiling
    #[arg(long, default_value_t = 64 * 1024)]
    limit_size: u64,
    /// Per-transaction payload ceiling
    #[arg(long, default_value_t = 4096)]
    limit_payload: u64,
    /// Simulated latency of transaction open and close, in milliseconds
    #[arg(long, default_value_t = 0)]
    tx_latency_ms: u64,
    /// Simulated work per item, in microseconds
    #[arg(long, default_value_t = 0)]
    work_us: u64,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

/// Produces `total` identical items.
struct SyntheticSource {
    total: u64,
    remaining: AtomicU64,
    share: Budget,
    work: Duration,
}

impl WorkSource<MemoryDomain> for SyntheticSource {
    type Item = u64;

    async fn next(&self, _worker: WorkerId) -> txbulk::Result<Option<u64>> {
        let taken = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        Ok(taken.ok().map(|left| self.total - left))
    }

    fn credit(&self, _item: &u64, accum: &mut Budget) {
        *accum += self.share;
    }

    async fn execute(&self, _worker: WorkerId, tx: &mut MemoryTx, _item: u64) {
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        tx.capture(self.share);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match cli.settings {
        Some(ref path) => Settings::from_toml_file(path)?,
        None => Settings::from_env()?,
    };

    match cli.command {
        Command::Config => {
            print!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Run(args) => cmd_run(settings, args).await,
    }
}

async fn cmd_run(mut settings: Settings, args: RunArgs) -> anyhow::Result<()> {
    if let Some(n) = args.max_work_per_tx {
        settings.max_work_per_tx = n;
    }
    if let Some(n) = args.localities {
        settings.localities = Some(n);
    }
    settings.validate()?;

    let _guard = init_telemetry(TelemetryConfig::from_settings(&settings, "txbulk"))?;

    let latency = Duration::from_millis(args.tx_latency_ms);
    let domain = Arc::new(
        MemoryDomain::new(Budget::new(
            Credit::new(args.limit_nr, args.limit_size),
            args.limit_payload,
        ))
        .with_open_latency(latency)
        .with_close_latency(latency),
    );
    let source = Arc::new(SyntheticSource {
        total: args.items,
        remaining: AtomicU64::new(args.items),
        share: Budget::new(Credit::new(args.item_nr, args.item_size), args.item_payload),
        work: Duration::from_micros(args.work_us),
    });

    let localities: Arc<dyn Localities> = match (args.threads, settings.localities) {
        (true, Some(n)) => Arc::new(ThreadLocalities::new(n)?),
        (true, None) => Arc::new(ThreadLocalities::with_default_nr()?),
        (false, Some(n)) => Arc::new(RuntimeLocalities::current_with(n)?),
        (false, None) => Arc::new(RuntimeLocalities::current()?),
    };

    let bulk = Bulk::init(
        BulkConfig::new(Arc::clone(&domain), source, settings.max_work_per_tx),
        localities,
    )?;
    let op = Op::new();
    bulk.run(&op)?;
    op.wait().await;

    let status = bulk.status();
    let report = bulk.fini()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, domain.max_concurrent());
    }

    status?;
    Ok(())
}

fn print_report(report: &BulkReport, max_concurrent: usize) {
    println!("Bulk:        {}", report.id);
    println!("Workers:     {}", report.worker_nr);
    println!("Items:       {}", report.item_nr);
    println!("Txs:         {}", report.tx_nr);
    if report.tx_nr > 0 {
        println!(
            "Items/tx:    {:.2}",
            report.item_nr as f64 / report.tx_nr as f64
        );
    }
    println!("Max open:    {max_concurrent}");
    println!("Duration:    {}ms", report.duration_ms());
    println!(
        "Status:      {}",
        report.error.as_deref().unwrap_or("ok")
    );
    println!("---");
    println!(
        "{:<6}  {:>8}  {:>8}  {:>8}  DRAINED",
        "WORKER", "NEXT", "TXS", "ITEMS"
    );
    for w in &report.workers {
        println!(
            "{:<6}  {:>8}  {:>8}  {:>8}  {}",
            w.worker.to_string(),
            w.next_nr,
            w.tx_nr,
            w.item_nr,
            if w.drained { "yes" } else { "no" }
        );
    }
}
