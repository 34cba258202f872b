// ===============================
// src/risk.rs
// ===============================
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::{Local, NaiveDate};
use tracing::{debug, warn};

use crate::config::RiskConfig;
use crate::gateway::{krw_balance, BrokerClient};
use crate::metrics::{DAILY_PNL_PCT, RISK_REJECTS};

/// Daily budget: realized pnl% and markets with open exposure (stake%).
#[derive(Debug, Clone)]
pub struct DailyRiskState {
    pub date: NaiveDate,
    pub realized_pnl_pct: f64,
    pub open_positions: HashMap<String, f64>,
}

impl DailyRiskState {
    pub fn new(date: NaiveDate) -> Self {
        Self { date, realized_pnl_pct: 0.0, open_positions: HashMap::new() }
    }

    /// Hari berganti -> reset budget.
    pub fn reset_if_needed(&mut self, today: NaiveDate) {
        if self.date != today {
            debug!(from = %self.date, to = %today, "daily risk state reset");
            self.date = today;
            self.realized_pnl_pct = 0.0;
            self.open_positions.clear();
        }
    }
}

pub struct RiskManager {
    broker: Arc<dyn BrokerClient>,
    config: RiskConfig,
    state: DailyRiskState,
}

impl RiskManager {
    pub fn new(broker: Arc<dyn BrokerClient>, config: RiskConfig) -> Self {
        Self { broker, config, state: DailyRiskState::new(Local::now().date_naive()) }
    }

    pub fn config(&self) -> &RiskConfig { &self.config }

    pub fn state(&self) -> &DailyRiskState { &self.state }

    pub async fn can_open_position(&mut self, market: &str) -> bool {
        self.can_open_position_on(market, Local::now().date_naive()).await
    }

    /// Never errors: a failed balance fetch counts as insufficient balance.
    pub async fn can_open_position_on(&mut self, market: &str, today: NaiveDate) -> bool {
        self.check_on(market, today, None).await
    }

    /// Same gate, as if one tracked exposure had already been exited at
    /// `exit_pnl_pct`. Lets a full portfolio ask before liquidating whether
    /// the entry would still pass. State is not touched.
    pub async fn can_open_position_after_exit(&mut self, market: &str, exit_pnl_pct: f64) -> bool {
        self.check_on(market, Local::now().date_naive(), Some(exit_pnl_pct)).await
    }

    async fn check_on(&mut self, market: &str, today: NaiveDate, exit_pnl_pct: Option<f64>) -> bool {
        self.state.reset_if_needed(today);

        let realized_pnl_pct = self.state.realized_pnl_pct + exit_pnl_pct.unwrap_or(0.0);
        if realized_pnl_pct <= -self.config.max_daily_loss_pct {
            warn!(
                market,
                realized_pnl_pct,
                "daily loss limit reached, blocking new trades"
            );
            RISK_REJECTS.inc();
            return false;
        }

        let freed = usize::from(exit_pnl_pct.is_some());
        let open = self.state.open_positions.len().saturating_sub(freed);
        if open >= self.config.max_open_positions {
            warn!(market, open, "maximum open positions reached");
            RISK_REJECTS.inc();
            return false;
        }

        let balance = match krw_balance(self.broker.as_ref()).await {
            Ok(b) => b,
            Err(e) => {
                warn!(?e, market, "balance fetch failed, treating as insufficient");
                0.0
            }
        };
        if balance < self.config.min_balance_krw {
            warn!(market, balance, min = self.config.min_balance_krw, "insufficient KRW balance");
            RISK_REJECTS.inc();
            return false;
        }
        true
    }

    pub fn register_entry(&mut self, market: &str, stake_pct: f64) {
        self.register_entry_on(market, stake_pct, Local::now().date_naive());
    }

    pub fn register_entry_on(&mut self, market: &str, stake_pct: f64, today: NaiveDate) {
        self.state.reset_if_needed(today);
        self.state.open_positions.insert(market.to_string(), stake_pct);
        debug!(market, stake_pct, "registered entry");
    }

    pub fn register_exit(&mut self, market: &str, pnl_pct: f64) {
        self.register_exit_on(market, pnl_pct, Local::now().date_naive());
    }

    pub fn register_exit_on(&mut self, market: &str, pnl_pct: f64, today: NaiveDate) {
        self.state.reset_if_needed(today);
        self.state.open_positions.remove(market);
        self.state.realized_pnl_pct += pnl_pct;
        DAILY_PNL_PCT.set(self.state.realized_pnl_pct);
        debug!(market, pnl_pct, cumulative = self.state.realized_pnl_pct, "registered exit");
    }

    /// Drop exposure without booking pnl (ledger repairs).
    pub fn release(&mut self, market: &str) {
        self.state.open_positions.remove(market);
    }
}

/// Stake = balance x max_position_pct / 100, never negative.
#[derive(Debug, Clone, Copy)]
pub struct PositionSizer {
    pub max_position_pct: f64,
}

impl PositionSizer {
    pub fn new(config: &RiskConfig) -> Self {
        Self { max_position_pct: config.max_position_pct }
    }

    pub fn krw_stake(&self, balance: f64) -> f64 {
        (balance * (self.max_position_pct / 100.0)).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaperBroker;

    fn manager(balance: f64, config: RiskConfig) -> RiskManager {
        RiskManager::new(Arc::new(PaperBroker::new(balance)), config)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[tokio::test]
    async fn daily_loss_blocks_until_rollover() {
        let cfg = RiskConfig { max_daily_loss_pct: 1.0, ..RiskConfig::default() };
        let mut risk = manager(100_000.0, cfg);
        assert!(risk.can_open_position_on("KRW-BTC", day(1)).await);

        risk.register_entry_on("KRW-BTC", 5.0, day(1));
        risk.register_exit_on("KRW-BTC", -2.0, day(1));
        assert!(!risk.can_open_position_on("KRW-BTC", day(1)).await);
        assert!(!risk.can_open_position_on("KRW-ETH", day(1)).await);

        assert!(risk.can_open_position_on("KRW-ETH", day(2)).await);
        assert_eq!(risk.state().realized_pnl_pct, 0.0);
    }

    #[tokio::test]
    async fn exposure_cap_and_min_balance() {
        let cfg = RiskConfig { max_open_positions: 1, ..RiskConfig::default() };
        let mut risk = manager(100_000.0, cfg.clone());
        risk.register_entry_on("KRW-BTC", 5.0, day(1));
        assert!(!risk.can_open_position_on("KRW-ETH", day(1)).await);
        risk.release("KRW-BTC");
        assert!(risk.can_open_position_on("KRW-ETH", day(1)).await);

        let mut poor = manager(9_999.0, cfg);
        assert!(!poor.can_open_position_on("KRW-ETH", day(1)).await);
    }

    #[tokio::test]
    async fn projected_exit_frees_a_slot_and_counts_its_loss() {
        let cfg = RiskConfig { max_open_positions: 2, max_daily_loss_pct: 3.0, ..RiskConfig::default() };
        let mut risk = manager(100_000.0, cfg.clone());
        risk.register_entry("KRW-BTC", 5.0);
        risk.register_entry("KRW-ETH", 5.0);
        assert!(!risk.can_open_position("KRW-XRP").await);
        assert!(risk.can_open_position_after_exit("KRW-XRP", -1.0).await);
        assert!(!risk.can_open_position_after_exit("KRW-XRP", -3.0).await);
        // tidak mengubah state
        assert_eq!(risk.state().open_positions.len(), 2);
        assert_eq!(risk.state().realized_pnl_pct, 0.0);

        let mut poor = manager(5_000.0, cfg);
        assert!(!poor.can_open_position_after_exit("KRW-XRP", 0.0).await);
    }

    #[test]
    fn sizer_is_pure_and_floored() {
        let sizer = PositionSizer { max_position_pct: 5.0 };
        assert_eq!(sizer.krw_stake(200_000.0), 10_000.0);
        assert_eq!(sizer.krw_stake(-10.0), 0.0);
    }
}
