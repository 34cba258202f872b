// ===============================
// src/positions.rs (portfolio ledger)
// ===============================
//
// In-memory view of open positions, one per market, backed by the trade
// history store. The ledger owns the "what do we hold" question; sizing and
// the daily risk budget live in `risk.rs`.
//
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::domain::{
    base_currency, market_for, AccountBalance, Fill, OrderRequest, Position, Side, Signal, TradeRecord, QUOTE_CURRENCY,
};
use crate::gateway::{coin_balance, place_and_settle, BrokerClient, BrokerError, FillPolicy};
use crate::metrics::{FORCE_EXITS, LIQUIDATIONS, OPEN_POSITIONS, RECONCILED};
use crate::recorder::{StoreError, TradeHistoryStore};

/// Hard cap on simultaneously open positions.
pub const MAX_POSITIONS: usize = 5;

/// Holdings at or below this are treated as gone (dust after a full sell).
const DUST_VOLUME: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no open position to liquidate")]
    NothingToLiquidate,
    #[error("{market}: sell notional {notional:.0} KRW below minimum {min:.0} KRW")]
    BelowMinimum { market: String, notional: f64, min: f64 },
    #[error("{0}: no balance to sell")]
    NoBalance(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    pub position: Position,
    pub current_price: f64,
    pub pnl_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PortfolioSnapshot {
    pub total_open: usize,
    pub max_positions: usize,
    /// Ascending by unrealized pnl%.
    pub positions: Vec<PositionView>,
    pub worst: Option<PositionView>,
}

/// Snapshot plus whatever reconcile force-closed on the way.
#[derive(Debug, Clone, Default)]
pub struct PortfolioStatus {
    pub snapshot: PortfolioSnapshot,
    pub reconciled: Vec<Position>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExitOutcome {
    Sold { price: f64, volume: f64, amount: f64, order_id: Option<String>, pnl_pct: Option<f64> },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ForceExitEntry {
    pub market: String,
    pub outcome: ExitOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ForceExitReport {
    pub entries: Vec<ForceExitEntry>,
}

impl ForceExitReport {
    pub fn sold(&self) -> usize {
        self.entries.iter().filter(|e| matches!(e.outcome, ExitOutcome::Sold { .. })).count()
    }

    pub fn skipped(&self) -> usize {
        self.entries.iter().filter(|e| matches!(e.outcome, ExitOutcome::Skipped { .. })).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| matches!(e.outcome, ExitOutcome::Failed { .. })).count()
    }

    /// (market, realized pnl%) of every position closed by the sweep.
    pub fn realized(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().filter_map(|e| match &e.outcome {
            ExitOutcome::Sold { pnl_pct: Some(p), .. } => Some((e.market.as_str(), *p)),
            _ => None,
        })
    }
}

pub struct PortfolioLedger {
    store: Arc<dyn TradeHistoryStore>,
    open: HashMap<String, Position>,
    max_positions: usize,
    strategy: String,
}

impl PortfolioLedger {
    pub fn new(store: Arc<dyn TradeHistoryStore>, max_positions: usize, strategy: &str) -> Self {
        Self { store, open: HashMap::new(), max_positions, strategy: strategy.to_string() }
    }

    /// Rebuild from persisted OPEN positions. Duplicates for one market keep
    /// the newest; older rows are closed in the store at their entry price
    /// (pnl 0) so they stop coming back on every restart.
    pub async fn load(
        store: Arc<dyn TradeHistoryStore>,
        max_positions: usize,
        strategy: &str,
    ) -> Result<Self, StoreError> {
        let mut ledger = Self::new(store, max_positions, strategy);
        for p in ledger.store.get_open_positions(None).await? {
            if ledger.open.contains_key(&p.market) {
                warn!(market = %p.market, id = ?p.id, "duplicate open position in history, closing older row");
                if let Some(id) = p.id {
                    ledger.store.close_position(id, p.entry_price, p.entry_volume, p.entry_amount).await?;
                }
                continue;
            }
            ledger.open.insert(p.market.clone(), p);
        }
        if !ledger.open.is_empty() {
            info!(recovered = ledger.open.len(), "open positions recovered from history");
        }
        OPEN_POSITIONS.set(ledger.open.len() as i64);
        Ok(ledger)
    }

    pub fn strategy(&self) -> &str { &self.strategy }

    pub fn max_positions(&self) -> usize { self.max_positions }

    pub fn total_open(&self) -> usize { self.open.len() }

    pub fn is_open(&self, market: &str) -> bool { self.open.contains_key(market) }

    pub fn get(&self, market: &str) -> Option<&Position> { self.open.get(market) }

    /// Oldest entry first.
    pub fn open_positions(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self.open.values().cloned().collect();
        out.sort_by_key(|p| p.entry_time);
        out
    }

    pub fn can_open_new_position(&self) -> bool {
        self.open.len() < self.max_positions
    }

    /// Record a new entry. A second open for the same market returns the
    /// existing position untouched.
    pub async fn open_position(&mut self, market: &str, fill: Fill) -> Position {
        if let Some(existing) = self.open.get(market) {
            warn!(market, "position already open, entry ignored");
            return existing.clone();
        }
        let mut position = Position::open(market, &self.strategy, fill, Utc::now());
        match self.store.save_position(&position).await {
            Ok(id) => position.id = Some(id),
            Err(e) => warn!(?e, market, "failed to persist position, tracking in memory only"),
        }
        self.open.insert(market.to_string(), position.clone());
        OPEN_POSITIONS.set(self.open.len() as i64);
        position
    }

    pub async fn blend_entry(&mut self, market: &str, extra: Fill) -> Option<Position> {
        let position = self.open.get_mut(market)?;
        position.blend_entry(extra);
        if let Some(id) = position.id {
            if let Err(e) = self
                .store
                .update_position_entry(id, position.entry_price, position.entry_volume, position.entry_amount)
                .await
            {
                warn!(?e, market, id, "failed to persist blended entry");
            }
        }
        Some(position.clone())
    }

    pub async fn close_position(&mut self, market: &str, exit: Fill) -> Option<Position> {
        let mut position = self.open.remove(market)?;
        position.close(exit.price, exit.volume, exit.amount, Utc::now());
        if let Some(id) = position.id {
            if let Err(e) = self.store.close_position(id, exit.price, exit.volume, exit.amount).await {
                warn!(?e, market, id, "failed to persist position close");
            }
        }
        OPEN_POSITIONS.set(self.open.len() as i64);
        Some(position)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_trade(
        &self,
        market: &str,
        signal: Signal,
        side: Side,
        fill: Fill,
        order_id: Option<String>,
        dry_run: bool,
        reason: Option<&str>,
    ) {
        let trade = TradeRecord {
            id: 0,
            timestamp: Utc::now(),
            market: market.to_string(),
            strategy: self.strategy.clone(),
            signal: signal.as_str().to_string(),
            side,
            price: fill.price,
            volume: fill.volume,
            amount: fill.amount,
            order_id,
            dry_run,
            reason: reason.map(str::to_string),
        };
        if let Err(e) = self.store.save_trade(trade).await {
            warn!(?e, market, side = side.as_str(), "failed to record trade");
        }
    }

    /// Force-close every open position whose coin no longer shows up in
    /// `accounts` (sold outside the engine). Closed at exit price 0.
    pub async fn reconcile(&mut self, accounts: &[AccountBalance]) -> Vec<Position> {
        let held: HashMap<&str, f64> = accounts.iter().map(|a| (a.currency.as_str(), a.total())).collect();
        let orphaned: Vec<String> = self
            .open
            .keys()
            .filter(|market| {
                let coin = base_currency(market);
                held.get(coin).map_or(true, |v| *v <= DUST_VOLUME)
            })
            .cloned()
            .collect();

        let mut closed = Vec::with_capacity(orphaned.len());
        for market in orphaned {
            warn!(%market, "position has no balance on the exchange, force-closing");
            if let Some(p) = self.close_position(&market, Fill { price: 0.0, volume: 0.0, amount: 0.0 }).await {
                RECONCILED.inc();
                closed.push(p);
            }
        }
        closed
    }

    /// Marks every open position at the current ticker price. A failed ticker
    /// falls back to the entry price (pnl 0) for that position.
    pub async fn snapshot(&self, broker: &dyn BrokerClient) -> PortfolioSnapshot {
        let mut positions = Vec::with_capacity(self.open.len());
        for p in self.open.values() {
            let current_price = match broker.get_ticker(&p.market).await {
                Ok(t) => t.trade_price,
                Err(e) => {
                    warn!(?e, market = %p.market, "ticker unavailable, valuing at entry");
                    p.entry_price
                }
            };
            positions.push(PositionView { position: p.clone(), current_price, pnl_pct: p.pnl_pct_at(current_price) });
        }
        positions.sort_by(|a, b| a.pnl_pct.total_cmp(&b.pnl_pct));
        PortfolioSnapshot {
            total_open: positions.len(),
            max_positions: self.max_positions,
            worst: positions.first().cloned(),
            positions,
        }
    }

    /// Optionally reconcile against exchange balances, then snapshot.
    pub async fn get_portfolio_status(
        &mut self,
        broker: &dyn BrokerClient,
        reconcile: bool,
    ) -> Result<PortfolioStatus, BrokerError> {
        let reconciled = if reconcile {
            let accounts = broker.get_accounts().await?;
            self.reconcile(&accounts).await
        } else {
            Vec::new()
        };
        Ok(PortfolioStatus { snapshot: self.snapshot(broker).await, reconciled })
    }

    /// Sell the open position with the lowest pnl% to make room for a new
    /// entry. Live mode sells min(recorded, held) volume; dry-run only
    /// simulates at the ticker price.
    pub async fn liquidate_worst_position(
        &mut self,
        broker: &dyn BrokerClient,
        cfg: &EngineConfig,
    ) -> Result<Position, LedgerError> {
        let snapshot = self.snapshot(broker).await;
        let worst = snapshot.worst.ok_or(LedgerError::NothingToLiquidate)?;
        let market = worst.position.market.clone();
        let price = worst.current_price;

        let volume = if cfg.dry_run {
            worst.position.entry_volume
        } else {
            let held = coin_balance(broker, &market).await?;
            if held <= DUST_VOLUME {
                LIQUIDATIONS.with_label_values(&["refused"]).inc();
                return Err(LedgerError::NoBalance(market));
            }
            worst.position.entry_volume.min(held)
        };

        let notional = volume * price;
        if notional < cfg.min_sell_amount {
            LIQUIDATIONS.with_label_values(&["refused"]).inc();
            warn!(%market, notional, min = cfg.min_sell_amount, "worst position too small to liquidate");
            return Err(LedgerError::BelowMinimum { market, notional, min: cfg.min_sell_amount });
        }

        info!(%market, pnl_pct = worst.pnl_pct, volume, "liquidating worst position");
        let estimate = Fill::for_volume(price, volume);
        let (fill, order_id) = if cfg.dry_run {
            (estimate, None)
        } else {
            let settled =
                place_and_settle(broker, &OrderRequest::market_sell(&market, volume), estimate, FillPolicy::from(cfg))
                    .await?;
            (settled.fill, Some(settled.order_id))
        };

        let closed = self.close_position(&market, fill).await.ok_or(LedgerError::NothingToLiquidate)?;
        self.record_trade(&market, Signal::Sell, Side::Sell, fill, order_id, cfg.dry_run, Some("liquidation"))
            .await;
        LIQUIDATIONS.with_label_values(&["sold"]).inc();
        Ok(closed)
    }

    /// Sell everything. Live mode sweeps every non-KRW balance on the
    /// exchange; dry-run sweeps the ledger's own positions. One market
    /// failing never stops the rest.
    pub async fn force_exit_all(
        &mut self,
        broker: &dyn BrokerClient,
        cfg: &EngineConfig,
    ) -> Result<ForceExitReport, BrokerError> {
        let targets: Vec<(String, f64)> = if cfg.dry_run {
            self.open_positions().into_iter().map(|p| (p.market, p.entry_volume)).collect()
        } else {
            broker
                .get_accounts()
                .await?
                .into_iter()
                .filter(|a| a.currency != QUOTE_CURRENCY && a.balance > DUST_VOLUME)
                .map(|a| (market_for(&a.currency), a.balance))
                .collect()
        };

        let mut report = ForceExitReport::default();
        for (market, volume) in targets {
            let outcome = match self.exit_one(broker, cfg, &market, volume).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(?e, %market, "force exit failed");
                    ExitOutcome::Failed { error: e.to_string() }
                }
            };
            let label = match &outcome {
                ExitOutcome::Sold { .. } => "sold",
                ExitOutcome::Skipped { .. } => "skipped",
                ExitOutcome::Failed { .. } => "failed",
            };
            FORCE_EXITS.with_label_values(&[label]).inc();
            report.entries.push(ForceExitEntry { market, outcome });
        }
        info!(sold = report.sold(), skipped = report.skipped(), failed = report.failed(), "force exit finished");
        Ok(report)
    }

    async fn exit_one(
        &mut self,
        broker: &dyn BrokerClient,
        cfg: &EngineConfig,
        market: &str,
        volume: f64,
    ) -> Result<ExitOutcome, BrokerError> {
        let price = broker.get_ticker(market).await?.trade_price;
        let notional = volume * price;
        if notional < cfg.min_sell_amount {
            debug!(market, notional, "below minimum sell amount, skipping");
            return Ok(ExitOutcome::Skipped {
                reason: format!("notional {notional:.0} KRW below minimum {:.0} KRW", cfg.min_sell_amount),
            });
        }

        let estimate = Fill::for_volume(price, volume);
        let (fill, order_id) = if cfg.dry_run {
            (estimate, None)
        } else {
            let settled =
                place_and_settle(broker, &OrderRequest::market_sell(market, volume), estimate, FillPolicy::from(cfg))
                    .await?;
            (settled.fill, Some(settled.order_id))
        };

        let pnl_pct = self.close_position(market, fill).await.and_then(|p| p.realized_pnl_pct);
        self.record_trade(market, Signal::Sell, Side::Sell, fill, order_id.clone(), cfg.dry_run, Some("force_exit"))
            .await;
        Ok(ExitOutcome::Sold { price: fill.price, volume: fill.volume, amount: fill.amount, order_id, pnl_pct })
    }
}
