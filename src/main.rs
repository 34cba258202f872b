// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/krw_exec_bot

 # konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_(market|dry_run)'

# aktivitas per market (signal & order)
curl -s localhost:9898/metrics | grep '^signals_total_by'
curl -s localhost:9898/metrics | grep '^orders_total'

*/
/*
=============================================================================
Project : krw_exec_bot: polling order-execution engine for KRW spot markets
Module  : main.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Turns BUY/SELL/HOLD signals into exchange orders, tracks a bounded
          portfolio of open positions, enforces daily risk limits, escapes
          sub-minimum positions, reconciles the ledger against balances,
          exposes Prometheus metrics, and records JSONL trade history.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use krw_exec_bot::config::{self, validate_market};
use krw_exec_bot::executor::OrderExecutor;
use krw_exec_bot::feed;
use krw_exec_bot::gateway::{BrokerClient, PaperBroker};
use krw_exec_bot::metrics;
use krw_exec_bot::notifier::Notifier;
use krw_exec_bot::recorder::{JsonlTradeStore, TradeHistoryStore};
use krw_exec_bot::risk::PositionSizer;
use krw_exec_bot::runner::ExecutionLoop;
use krw_exec_bot::strategy::{self, StrategyKind};

/// Paper feed: satu candle baru per market tiap interval ini
const PAPER_FEED_INTERVAL: Duration = Duration::from_secs(5);
const PAPER_SEED_PRICE: f64 = 50_000_000.0;
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "krw_exec_bot", version, about = "Polling order-execution engine for KRW spot markets")]
struct Cli {
    /// Place real orders (overrides DRY_RUN)
    #[arg(long)]
    live: bool,
    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
    /// Sell every holding and exit
    #[arg(long, conflicts_with = "once")]
    force_exit: bool,
    /// Override MARKET
    #[arg(long)]
    market: Option<String>,
    /// Override STRATEGY
    #[arg(long)]
    strategy: Option<String>,
    /// Override POLL_INTERVAL_SECS
    #[arg(long)]
    poll_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    // ---- Load config & limits ----
    let (mut args, risk_cfg) = config::load()?;
    if cli.live {
        args.engine.dry_run = false;
    }
    if let Some(m) = cli.market {
        let m = m.to_ascii_uppercase();
        validate_market("--market", &m)?;
        args.engine.market = m;
    }
    if let Some(name) = cli.strategy.as_deref() {
        args.strategy.kind = StrategyKind::parse(name)?;
    }
    if let Some(secs) = cli.poll_interval {
        args.engine.poll_interval = Duration::from_secs(secs.max(1));
    }

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    let watched: Vec<String> = if args.markets.is_empty() { vec![args.engine.market.clone()] } else { args.markets.clone() };
    info!(
        market = %args.engine.market,
        markets = ?watched,
        strategy = args.strategy.kind.as_str(),
        dry_run = args.engine.dry_run,
        poll_secs = args.engine.poll_interval.as_secs(),
        max_positions = args.engine.max_positions,
        risk = ?risk_cfg,
        history = %args.trade_history_file,
        "startup config"
    );
    for m in &watched {
        metrics::CONFIG_MARKET.with_label_values(&[m]).set(1);
    }
    metrics::CONFIG_DRY_RUN.set(args.engine.dry_run as i64);
    if !args.engine.dry_run {
        warn!("LIVE mode: orders go to the broker");
    }

    // ---- Paper venue + feed ----
    let paper = Arc::new(PaperBroker::new(args.paper_krw_balance));
    for m in &watched {
        feed::seed_history(&paper, m, PAPER_SEED_PRICE, args.engine.candle_count, PAPER_FEED_INTERVAL);
    }
    tokio::spawn(feed::run_paper(paper.clone(), watched.clone(), PAPER_FEED_INTERVAL));
    let broker: Arc<dyn BrokerClient> = paper;

    // ---- Trade history ----
    let store: Arc<dyn TradeHistoryStore> = Arc::new(JsonlTradeStore::open(&args.trade_history_file).await?);

    // ---- Engine ----
    let source = strategy::build(&args)?;
    let executor = OrderExecutor::new(
        broker,
        store.clone(),
        risk_cfg.clone(),
        Notifier::from_args(&args),
        args.engine.clone(),
        source.name(),
    )
    .await?
    .with_sizer(PositionSizer::new(&risk_cfg));
    let mut engine = ExecutionLoop::new(executor, source);

    if cli.force_exit {
        let report = engine.force_exit_all().await?;
        info!(sold = report.sold(), skipped = report.skipped(), failed = report.failed(), "force exit done");
        for entry in &report.entries {
            info!(market = %entry.market, outcome = ?entry.outcome, "force exit result");
        }
        return Ok(());
    }

    if cli.once {
        let report = engine.run_once().await?;
        info!(?report, "single cycle done");
        let snapshot = engine.get_portfolio_status().await?;
        info!(open = snapshot.total_open, max = snapshot.max_positions, "portfolio");
        return Ok(());
    }

    engine.start_async();
    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, stopping after current cycle");
    engine.stop(true, Some(STOP_TIMEOUT)).await;

    let status = engine.status();
    info!(
        open = status.open_positions.len(),
        daily_pnl_pct = status.daily_realized_pnl_pct,
        last_error = ?status.last_error,
        "final status"
    );
    match store.statistics(None, true).await {
        Ok(stats) => info!(?stats, "today's trading statistics"),
        Err(e) => warn!(?e, "statistics unavailable"),
    }
    Ok(())
}
