// ===============================
// src/executor.rs (signal -> orders)
// ===============================
//
// Turns one strategy signal into at most one round of broker orders and the
// matching bookkeeping (ledger, daily risk, trade log, notifications).
//
// Failure rules:
//   * order placement errors propagate; nothing after the failed call is applied
//   * store and notification failures are logged and swallowed
//   * a refused escape or liquidation is a normal outcome (Ok(None)), not an error
//
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, RiskConfig};
use crate::domain::{Candle, ExecMode, ExecReport, Fill, OrderRequest, Position, Side, Signal};
use crate::gateway::{krw_balance, place_and_settle, BrokerClient, BrokerError, FillPolicy};
use crate::metrics::{ESCAPES, LIQUIDATIONS, ORDERS};
use crate::notifier::Notifier;
use crate::positions::{ForceExitReport, LedgerError, PortfolioLedger, PortfolioSnapshot};
use crate::recorder::{StoreError, TradeHistoryStore};
use crate::risk::{PositionSizer, RiskManager};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("cannot size order: {0}")]
    Sizing(String),
    #[error("no candles for {0}")]
    NoCandles(String),
}

/// Result of the escape step for a position too small to sell.
#[derive(Debug, Clone)]
pub enum EscapeOutcome {
    Blended { fill: Fill, position: Position },
    Refused { free_krw: f64, required: f64 },
    NoPosition,
}

pub struct OrderExecutor {
    broker: Arc<dyn BrokerClient>,
    ledger: PortfolioLedger,
    risk: RiskManager,
    sizer: Option<PositionSizer>,
    notifier: Notifier,
    cfg: EngineConfig,
}

impl OrderExecutor {
    /// Loads open positions from `store` and seeds the risk budget with them,
    /// so a restart does not forget exposure.
    pub async fn new(
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn TradeHistoryStore>,
        risk_cfg: RiskConfig,
        notifier: Notifier,
        cfg: EngineConfig,
        strategy: &str,
    ) -> Result<Self, StoreError> {
        let ledger = PortfolioLedger::load(store, cfg.max_positions, strategy).await?;
        let mut risk = RiskManager::new(broker.clone(), risk_cfg);
        for p in ledger.open_positions() {
            // stake% saat entry tidak disimpan; exposure cukup dihitung per market
            risk.register_entry(&p.market, 0.0);
        }
        Ok(Self { broker, ledger, risk, sizer: None, notifier, cfg })
    }

    pub fn with_sizer(mut self, sizer: PositionSizer) -> Self {
        self.sizer = Some(sizer);
        self
    }

    pub fn broker(&self) -> &Arc<dyn BrokerClient> { &self.broker }

    pub fn config(&self) -> &EngineConfig { &self.cfg }

    pub fn ledger(&self) -> &PortfolioLedger { &self.ledger }

    pub fn risk(&self) -> &RiskManager { &self.risk }

    fn mode(&self) -> ExecMode {
        if self.cfg.dry_run { ExecMode::DryRun } else { ExecMode::Live }
    }

    fn mode_label(&self) -> &'static str {
        if self.cfg.dry_run { "Dry-run" } else { "Live" }
    }

    pub async fn execute(
        &mut self,
        market: &str,
        signal: Signal,
        candles: &[Candle],
    ) -> Result<Option<ExecReport>, ExecError> {
        if signal == Signal::Hold {
            debug!(market, "hold, nothing to do");
            return Ok(None);
        }
        let last_close = candles.last().map(|c| c.close).ok_or_else(|| ExecError::NoCandles(market.to_string()))?;
        match signal {
            Signal::Buy => self.buy(market, last_close).await,
            Signal::Sell => self.sell(market, last_close).await,
            Signal::Hold => Ok(None),
        }
    }

    /// KRW to commit to a new entry, plus the balance it was sized from (if known).
    pub async fn determine_order_amount(&self) -> Result<(f64, Option<f64>), ExecError> {
        let (stake, balance) = match (krw_balance(self.broker.as_ref()).await, self.sizer) {
            (Ok(balance), Some(sizer)) => (sizer.krw_stake(balance), Some(balance)),
            (Ok(balance), None) => (balance * self.cfg.order_amount_pct / 100.0, Some(balance)),
            (Err(e), _) => match self.cfg.order_amount {
                Some(fixed) => {
                    warn!(?e, fixed, "balance unavailable, using fixed order amount");
                    (fixed, None)
                }
                None => return Err(ExecError::Sizing(e.to_string())),
            },
        };
        Ok((stake.max(self.cfg.min_order_amount), balance))
    }

    async fn buy(&mut self, market: &str, last_close: f64) -> Result<Option<ExecReport>, ExecError> {
        if self.ledger.is_open(market) {
            debug!(market, "position already open, BUY skipped");
            return Ok(None);
        }

        if !self.ledger.can_open_new_position() {
            self.reconcile().await?;
        }
        if !self.ledger.can_open_new_position() {
            // jangan jual apa pun kalau entry baru toh akan ditolak risk
            let worst_pnl_pct = self.ledger.snapshot(self.broker.as_ref()).await.worst.map_or(0.0, |w| w.pnl_pct);
            if !self.risk.can_open_position_after_exit(market, worst_pnl_pct).await {
                info!(market, "risk manager blocked entry, portfolio left untouched");
                return Ok(None);
            }
            info!(market, open = self.ledger.total_open(), "portfolio full, liquidating worst position");
            if self.liquidate_worst_position().await?.is_none() {
                warn!(market, "no room for a new position, BUY aborted");
                return Ok(None);
            }
        }

        if !self.risk.can_open_position(market).await {
            info!(market, "risk manager blocked entry");
            return Ok(None);
        }

        let (amount, balance) = self.determine_order_amount().await?;
        let estimate = Fill::for_notional(last_close, amount);
        let (fill, order_id) = if self.cfg.dry_run {
            (estimate, None)
        } else {
            let settled = place_and_settle(
                self.broker.as_ref(),
                &OrderRequest::market_buy(market, amount),
                estimate,
                FillPolicy::from(&self.cfg),
            )
            .await?;
            (settled.fill, Some(settled.order_id))
        };

        self.ledger.open_position(market, fill).await;
        let stake_pct = match balance {
            Some(b) if b > 0.0 => amount / b * 100.0,
            _ => 100.0,
        };
        self.risk.register_entry(market, stake_pct);
        self.ledger
            .record_trade(market, Signal::Buy, Side::Buy, fill, order_id.clone(), self.cfg.dry_run, None)
            .await;
        ORDERS.with_label_values(&["buy", self.mode().as_str()]).inc();
        info!(market, amount, price = fill.price, volume = fill.volume, mode = self.mode_label(), "BUY executed");
        self.notifier
            .notify(
                &format!("{} BUY executed", self.mode_label()),
                json!({
                    "market": market,
                    "stake": amount,
                    "price": fill.price,
                    "volume": fill.volume,
                    "order_id": order_id,
                }),
            )
            .await;

        Ok(Some(ExecReport {
            market: market.to_string(),
            side: Side::Buy,
            mode: self.mode(),
            order_id,
            price: fill.price,
            volume: fill.volume,
            amount: fill.amount,
            pnl_pct: None,
            escape: None,
        }))
    }

    async fn sell(&mut self, market: &str, last_close: f64) -> Result<Option<ExecReport>, ExecError> {
        let Some(position) = self.ledger.get(market) else {
            debug!(market, "no open position, SELL skipped");
            return Ok(None);
        };

        let notional = position.entry_volume * last_close;
        let mut escape = None;
        if notional <= self.cfg.min_sell_amount {
            info!(market, notional, min = self.cfg.min_sell_amount, "position below minimum sell, trying escape");
            match self.escape(market, last_close).await? {
                EscapeOutcome::Blended { fill, .. } => escape = Some(fill),
                EscapeOutcome::Refused { .. } | EscapeOutcome::NoPosition => return Ok(None),
            }
        }

        let volume = match self.ledger.get(market) {
            Some(p) => p.entry_volume,
            None => return Ok(None),
        };
        let estimate = Fill::for_volume(last_close, volume);
        let (fill, order_id) = if self.cfg.dry_run {
            (estimate, None)
        } else {
            let settled = place_and_settle(
                self.broker.as_ref(),
                &OrderRequest::market_sell(market, volume),
                estimate,
                FillPolicy::from(&self.cfg),
            )
            .await?;
            (settled.fill, Some(settled.order_id))
        };

        let pnl_pct = self.ledger.close_position(market, fill).await.and_then(|p| p.realized_pnl_pct).unwrap_or(0.0);
        self.risk.register_exit(market, pnl_pct);
        self.ledger
            .record_trade(market, Signal::Sell, Side::Sell, fill, order_id.clone(), self.cfg.dry_run, None)
            .await;
        ORDERS.with_label_values(&["sell", self.mode().as_str()]).inc();
        info!(market, price = fill.price, volume = fill.volume, pnl_pct, mode = self.mode_label(), "SELL executed");
        self.notifier
            .notify(
                &format!("{} SELL executed", self.mode_label()),
                json!({
                    "market": market,
                    "price": fill.price,
                    "volume": fill.volume,
                    "amount": fill.amount,
                    "pnl_pct": pnl_pct,
                    "order_id": order_id,
                    "escaped": escape.is_some(),
                }),
            )
            .await;

        Ok(Some(ExecReport {
            market: market.to_string(),
            side: Side::Sell,
            mode: self.mode(),
            order_id,
            price: fill.price,
            volume: fill.volume,
            amount: fill.amount,
            pnl_pct: Some(pnl_pct),
            escape,
        }))
    }

    /// Buy `min_sell_amount` more of an undersized position so the follow-up
    /// sell clears the exchange minimum. Refuses (no order at all) when free
    /// KRW cannot cover the extra buy.
    pub async fn escape(&mut self, market: &str, last_close: f64) -> Result<EscapeOutcome, ExecError> {
        if !self.ledger.is_open(market) {
            return Ok(EscapeOutcome::NoPosition);
        }
        let required = self.cfg.min_sell_amount;
        let free_krw = krw_balance(self.broker.as_ref()).await?;
        if free_krw < required {
            ESCAPES.with_label_values(&["refused"]).inc();
            warn!(market, free_krw, required, "escape refused, not enough KRW; position left open");
            self.notifier
                .notify(
                    "Escape refused: insufficient KRW",
                    json!({ "market": market, "free_krw": free_krw, "required": required }),
                )
                .await;
            return Ok(EscapeOutcome::Refused { free_krw, required });
        }

        let estimate = Fill::for_notional(last_close, required);
        let (fill, order_id) = if self.cfg.dry_run {
            (estimate, None)
        } else {
            let settled = place_and_settle(
                self.broker.as_ref(),
                &OrderRequest::market_buy(market, required),
                estimate,
                FillPolicy::from(&self.cfg),
            )
            .await?;
            (settled.fill, Some(settled.order_id))
        };

        let Some(position) = self.ledger.blend_entry(market, fill).await else {
            return Ok(EscapeOutcome::NoPosition);
        };
        self.ledger
            .record_trade(market, Signal::Buy, Side::Buy, fill, order_id, self.cfg.dry_run, Some("escape"))
            .await;
        ESCAPES.with_label_values(&["blended"]).inc();
        info!(
            market,
            avg_price = position.entry_price,
            volume = position.entry_volume,
            "escape buy blended into position"
        );
        Ok(EscapeOutcome::Blended { fill, position })
    }

    /// Live mode only: close positions the exchange no longer holds.
    /// Their exposure is released without touching the daily pnl.
    pub async fn reconcile(&mut self) -> Result<Vec<Position>, ExecError> {
        if self.cfg.dry_run {
            return Ok(Vec::new());
        }
        let accounts = self.broker.get_accounts().await?;
        let closed = self.ledger.reconcile(&accounts).await;
        self.release_reconciled(&closed).await;
        Ok(closed)
    }

    async fn release_reconciled(&mut self, closed: &[Position]) {
        for p in closed {
            self.risk.release(&p.market);
            self.notifier
                .notify("Position force-closed: no exchange balance", json!({ "market": p.market, "id": p.id }))
                .await;
        }
    }

    /// Returns `None` when the ledger refused (nothing open, dust, no balance).
    pub async fn liquidate_worst_position(&mut self) -> Result<Option<Position>, ExecError> {
        match self.ledger.liquidate_worst_position(self.broker.as_ref(), &self.cfg).await {
            Ok(closed) => {
                let pnl_pct = closed.realized_pnl_pct.unwrap_or(0.0);
                self.risk.register_exit(&closed.market, pnl_pct);
                self.notifier
                    .notify(
                        "Worst position liquidated",
                        json!({ "market": closed.market, "pnl_pct": pnl_pct, "exit_price": closed.exit_price }),
                    )
                    .await;
                Ok(Some(closed))
            }
            Err(LedgerError::Broker(e)) => {
                LIQUIDATIONS.with_label_values(&["failed"]).inc();
                Err(e.into())
            }
            Err(refusal) => {
                warn!(reason = %refusal, "liquidation refused");
                self.notifier.notify("Liquidation refused", json!({ "reason": refusal.to_string() })).await;
                Ok(None)
            }
        }
    }

    pub async fn force_exit_all(&mut self) -> Result<ForceExitReport, ExecError> {
        let report = self.ledger.force_exit_all(self.broker.as_ref(), &self.cfg).await?;
        for (market, pnl_pct) in report.realized() {
            self.risk.register_exit(market, pnl_pct);
        }
        self.notifier
            .notify(
                "Force exit completed",
                json!({ "sold": report.sold(), "skipped": report.skipped(), "failed": report.failed() }),
            )
            .await;
        Ok(report)
    }

    pub async fn get_portfolio_status(&mut self) -> Result<PortfolioSnapshot, ExecError> {
        let status = self.ledger.get_portfolio_status(self.broker.as_ref(), !self.cfg.dry_run).await?;
        self.release_reconciled(&status.reconciled).await;
        Ok(status.snapshot)
    }
}
