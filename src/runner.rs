// ===============================
// src/runner.rs (execution loop)
// ===============================
//
// Periodic driver: fetch candles -> ask the signal source -> hand the signal
// to the executor. One cycle at a time; the worker and on-demand callers
// (run_once, force_exit_all, portfolio status) share the engine behind one
// async mutex, so they never interleave mid-cycle. Readers that only need
// the last published status or portfolio go through the watch channel.
//
// Stop is cooperative. A cycle in flight always finishes; the flag is only
// looked at between cycles (and wakes the inter-cycle sleep early).
//
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::domain::{ExecReport, Position, Signal};
use crate::executor::{ExecError, OrderExecutor};
use crate::metrics::{CYCLES, CYCLE_ERRORS, SIGNALS_BY};
use crate::positions::{ForceExitReport, PortfolioSnapshot};
use crate::strategy::SignalSource;

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub market: String,
    pub strategy: String,
    pub dry_run: bool,
    pub last_signal: Option<Signal>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<ExecReport>,
    pub open_positions: Vec<Position>,
    pub daily_realized_pnl_pct: f64,
    /// Marked at the end of the last cycle (or status/force-exit call).
    pub portfolio: PortfolioSnapshot,
}

struct Core {
    executor: OrderExecutor,
    source: Box<dyn SignalSource>,
    market: String,
    status: EngineStatus,
    status_tx: watch::Sender<EngineStatus>,
}

impl Core {
    async fn cycle(&mut self) -> Result<Option<ExecReport>, ExecError> {
        if let Some(next) = self.source.select_market().await {
            if next != self.market {
                info!(from = %self.market, to = %next, "target market switched");
                self.market = next;
            }
        }
        let market = self.market.clone();
        CYCLES.inc();

        let result = self.evaluate_and_execute(&market).await;
        self.status.market = market;
        self.status.last_run_at = Some(Utc::now());
        match &result {
            Ok(report) => {
                self.status.last_error = None;
                if report.is_some() {
                    self.status.last_report = report.clone();
                }
            }
            Err(e) => {
                CYCLE_ERRORS.inc();
                self.status.last_error = Some(e.to_string());
            }
        }
        self.refresh_portfolio().await;
        self.publish();
        result
    }

    async fn refresh_portfolio(&mut self) {
        self.status.portfolio = self.executor.ledger().snapshot(self.executor.broker().as_ref()).await;
    }

    async fn evaluate_and_execute(&mut self, market: &str) -> Result<Option<ExecReport>, ExecError> {
        let cfg = self.executor.config();
        let candles = self.executor.broker().get_candles(market, cfg.candle_unit, cfg.candle_count).await?;
        let signal = self.source.evaluate(market, &candles).await;
        SIGNALS_BY.with_label_values(&[signal.as_str(), market]).inc();
        info!(strategy = self.source.name(), market, %signal, candles = candles.len(), "signal evaluated");
        self.status.last_signal = Some(signal);
        self.executor.execute(market, signal, &candles).await
    }

    fn publish(&mut self) {
        self.status.open_positions = self.executor.ledger().open_positions();
        self.status.daily_realized_pnl_pct = self.executor.risk().state().realized_pnl_pct;
        self.status_tx.send_replace(self.status.clone());
    }
}

pub struct ExecutionLoop {
    core: Arc<Mutex<Core>>,
    status_rx: watch::Receiver<EngineStatus>,
    stop_tx: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
    poll_interval: Duration,
}

impl ExecutionLoop {
    pub fn new(executor: OrderExecutor, source: Box<dyn SignalSource>) -> Self {
        let cfg = executor.config().clone();
        let status = EngineStatus {
            running: false,
            market: cfg.market.clone(),
            strategy: source.name().to_string(),
            dry_run: cfg.dry_run,
            open_positions: executor.ledger().open_positions(),
            ..EngineStatus::default()
        };
        let (status_tx, status_rx) = watch::channel(status.clone());
        let (stop_tx, _) = watch::channel(false);
        let core = Core { executor, source, market: cfg.market.clone(), status, status_tx };
        Self { core: Arc::new(Mutex::new(core)), status_rx, stop_tx, worker: None, poll_interval: cfg.poll_interval }
    }

    /// One cycle, waiting for any in-flight cycle first.
    pub async fn run_once(&self) -> Result<Option<ExecReport>, ExecError> {
        self.core.lock().await.cycle().await
    }

    /// Runs cycles in the calling task until `stop` is requested.
    pub async fn run_forever(&self) {
        self.stop_tx.send_replace(false);
        drive(self.core.clone(), self.stop_tx.subscribe(), self.poll_interval).await;
    }

    /// Spawns the worker. Returns false (and does nothing) if one is already running.
    pub fn start_async(&mut self) -> bool {
        if self.worker.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("execution loop already running");
            return false;
        }
        self.stop_tx.send_replace(false);
        let handle = tokio::spawn(drive(self.core.clone(), self.stop_tx.subscribe(), self.poll_interval));
        self.worker = Some(handle);
        true
    }

    /// Requests a stop. With `join`, waits for the worker (bounded by
    /// `timeout` when given); a worker still busy at the deadline keeps
    /// running and will exit after its current cycle.
    pub async fn stop(&mut self, join: bool, timeout: Option<Duration>) {
        self.stop_tx.send_replace(true);
        if !join {
            return;
        }
        let Some(mut handle) = self.worker.take() else { return };
        let joined = match timeout {
            Some(t) => tokio::time::timeout(t, &mut handle).await.map_err(|_| ()),
            None => Ok((&mut handle).await),
        };
        match joined {
            Ok(Ok(())) => info!("execution loop stopped"),
            Ok(Err(e)) => error!(?e, "execution loop task failed"),
            Err(()) => {
                warn!("execution loop did not stop within timeout");
                self.worker = Some(handle);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        let alive = self.worker.as_ref().is_some_and(|h| !h.is_finished());
        alive && !*self.stop_tx.borrow()
    }

    pub fn status(&self) -> EngineStatus {
        let mut s = self.status_rx.borrow().clone();
        s.running = self.is_running();
        s
    }

    /// Last published portfolio, without waiting for an in-flight cycle.
    pub fn portfolio_snapshot(&self) -> PortfolioSnapshot {
        self.status_rx.borrow().portfolio.clone()
    }

    /// Receiver for status updates published after every cycle.
    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status_rx.clone()
    }

    pub async fn force_exit_all(&self) -> Result<ForceExitReport, ExecError> {
        let mut core = self.core.lock().await;
        let report = core.executor.force_exit_all().await;
        core.refresh_portfolio().await;
        core.publish();
        report
    }

    /// Fresh marks (reconciling first in live mode); waits for an in-flight cycle.
    pub async fn get_portfolio_status(&self) -> Result<PortfolioSnapshot, ExecError> {
        let mut core = self.core.lock().await;
        let snapshot = core.executor.get_portfolio_status().await;
        if let Ok(s) = &snapshot {
            core.status.portfolio = s.clone();
        }
        core.publish();
        snapshot
    }
}

async fn drive(core: Arc<Mutex<Core>>, mut stop_rx: watch::Receiver<bool>, poll_interval: Duration) {
    info!(interval_secs = poll_interval.as_secs_f64(), "execution loop started");
    loop {
        if *stop_rx.borrow_and_update() {
            break;
        }
        if let Err(e) = core.lock().await.cycle().await {
            error!(error = %e, "cycle failed");
        }
        tokio::select! {
            _ = sleep(poll_interval) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!("execution loop exiting");
}
