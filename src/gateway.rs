// ===============================
// src/gateway.rs (broker seam + paper venue)
// ===============================
use std::sync::Mutex;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::domain::{
    base_currency, AccountBalance, Candle, Fill, OrdType, OrderRequest, OrderSnapshot, OrderState, Side,
    Ticker, QUOTE_CURRENCY,
};
use crate::metrics::EXECS;

#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("unknown market {0}")]
    UnknownMarket(String),
    #[error("unknown order {0}")]
    UnknownOrder(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderSnapshot, BrokerError>;
    async fn get_order(&self, uuid: &str) -> Result<OrderSnapshot, BrokerError>;
    async fn cancel_order(&self, uuid: &str) -> Result<OrderSnapshot, BrokerError>;
    async fn get_accounts(&self) -> Result<Vec<AccountBalance>, BrokerError>;
    async fn get_ticker(&self, market: &str) -> Result<Ticker, BrokerError>;
    /// Oldest first.
    async fn get_candles(&self, market: &str, unit: u32, count: usize) -> Result<Vec<Candle>, BrokerError>;
}

/// Free KRW balance (0 if the account has no KRW row).
pub async fn krw_balance(broker: &dyn BrokerClient) -> Result<f64, BrokerError> {
    let accounts = broker.get_accounts().await?;
    Ok(accounts
        .iter()
        .find(|a| a.currency == QUOTE_CURRENCY)
        .map(|a| a.balance)
        .unwrap_or(0.0))
}

/// Free balance of the coin traded on `market`.
pub async fn coin_balance(broker: &dyn BrokerClient, market: &str) -> Result<f64, BrokerError> {
    let currency = base_currency(market);
    let accounts = broker.get_accounts().await?;
    Ok(accounts.iter().find(|a| a.currency == currency).map(|a| a.balance).unwrap_or(0.0))
}

#[derive(Debug, Clone, Copy)]
pub struct FillPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl From<&EngineConfig> for FillPolicy {
    fn from(cfg: &EngineConfig) -> Self {
        Self { attempts: cfg.fill_poll_attempts, interval: cfg.fill_poll_interval }
    }
}

#[derive(Debug, Clone)]
pub struct Settled {
    pub order_id: String,
    pub fill: Fill,
    /// false = broker never reported fill data, `fill` is the estimate
    pub confirmed: bool,
}

/// Place a market order and wait (bounded) for actual fill data. Falls back
/// to `estimate` when the broker stays silent; that is degraded accuracy,
/// not an error.
pub async fn place_and_settle(
    broker: &dyn BrokerClient,
    req: &OrderRequest,
    estimate: Fill,
    policy: FillPolicy,
) -> Result<Settled, BrokerError> {
    let ack = broker.place_order(req).await?;
    debug!(uuid = %ack.uuid, market = %req.market, side = req.side.as_str(), "order placed");
    if let Some(fill) = ack.fill() {
        return Ok(Settled { order_id: ack.uuid, fill, confirmed: true });
    }

    for attempt in 1..=policy.attempts {
        sleep(policy.interval).await;
        match broker.get_order(&ack.uuid).await {
            Ok(snap) => {
                if let Some(fill) = snap.fill() {
                    debug!(uuid = %ack.uuid, attempt, price = fill.price, volume = fill.volume, "fill confirmed");
                    return Ok(Settled { order_id: ack.uuid, fill, confirmed: true });
                }
            }
            Err(e) => warn!(?e, uuid = %ack.uuid, attempt, "get_order failed while polling fill"),
        }
    }

    warn!(
        uuid = %ack.uuid,
        market = %req.market,
        attempts = policy.attempts,
        "fill data not available, using estimate"
    );
    Ok(Settled { order_id: ack.uuid, fill: estimate, confirmed: false })
}

// -----------------------------------------------------------------------------
// Paper venue: in-process exchange. Fills market orders at the last price,
// optionally holding fill data back for a few get_order polls.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
struct PaperOrder {
    snapshot: OrderSnapshot,
    fill: Option<Fill>,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct PaperState {
    balances: HashMap<String, f64>,
    prices: HashMap<String, f64>,
    candles: HashMap<String, Vec<Candle>>,
    orders: HashMap<String, PaperOrder>,
    placed: Vec<OrderRequest>,
    fail_orders: Option<String>,
}

#[derive(Debug, Default)]
pub struct PaperBroker {
    state: Mutex<PaperState>,
    fill_delay_polls: u32,
}

const MAX_PAPER_CANDLES: usize = 1_000;

impl PaperBroker {
    pub fn new(krw_balance: f64) -> Self {
        let broker = Self::default();
        broker.set_balance(QUOTE_CURRENCY, krw_balance);
        broker
    }

    /// Fill data is only visible after `polls` calls to `get_order`.
    pub fn with_fill_delay(mut self, polls: u32) -> Self {
        self.fill_delay_polls = polls;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        // state tetap konsisten walau ada panic di thread lain
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_balance(&self, currency: &str, amount: f64) {
        self.lock().balances.insert(currency.to_string(), amount);
    }

    pub fn balance(&self, currency: &str) -> f64 {
        self.lock().balances.get(currency).copied().unwrap_or(0.0)
    }

    pub fn set_price(&self, market: &str, price: f64) {
        self.lock().prices.insert(market.to_string(), price);
    }

    pub fn last_price(&self, market: &str) -> Option<f64> {
        self.lock().prices.get(market).copied()
    }

    pub fn set_candles(&self, market: &str, candles: Vec<Candle>) {
        let mut st = self.lock();
        if let Some(last) = candles.last() {
            st.prices.insert(market.to_string(), last.close);
        }
        st.candles.insert(market.to_string(), candles);
    }

    pub fn push_candle(&self, market: &str, candle: Candle) {
        let mut st = self.lock();
        st.prices.insert(market.to_string(), candle.close);
        let series = st.candles.entry(market.to_string()).or_default();
        series.push(candle);
        if series.len() > MAX_PAPER_CANDLES {
            let excess = series.len() - MAX_PAPER_CANDLES;
            series.drain(..excess);
        }
    }

    /// Every subsequent `place_order` fails with `Unavailable(reason)`; `None` clears.
    pub fn fail_orders(&self, reason: Option<&str>) {
        self.lock().fail_orders = reason.map(str::to_string);
    }

    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.lock().placed.clone()
    }
}

fn new_uuid() -> String {
    format!("PAPER-{}-{:08x}", Utc::now().timestamp_millis(), rand::thread_rng().gen::<u32>())
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderSnapshot, BrokerError> {
        let mut st = self.lock();
        if let Some(reason) = st.fail_orders.clone() {
            return Err(BrokerError::Unavailable(reason));
        }
        let price = *st
            .prices
            .get(&req.market)
            .ok_or_else(|| BrokerError::UnknownMarket(req.market.clone()))?;
        let coin = base_currency(&req.market).to_string();

        let fill = match (req.side, req.ord_type) {
            (Side::Buy, OrdType::Price) => {
                let amount = req.price.unwrap_or(0.0);
                let krw = st.balances.get(QUOTE_CURRENCY).copied().unwrap_or(0.0);
                if amount <= 0.0 || amount > krw {
                    return Err(BrokerError::Rejected(format!("insufficient KRW: need {amount:.0}, have {krw:.0}")));
                }
                let fill = Fill::for_notional(price, amount);
                *st.balances.entry(QUOTE_CURRENCY.to_string()).or_default() -= amount;
                *st.balances.entry(coin).or_default() += fill.volume;
                fill
            }
            (Side::Sell, OrdType::Market) => {
                let volume = req.volume.unwrap_or(0.0);
                let held = st.balances.get(&coin).copied().unwrap_or(0.0);
                // toleransi floating point kecil
                if volume <= 0.0 || volume > held * (1.0 + 1e-9) {
                    return Err(BrokerError::Rejected(format!("insufficient {coin}: need {volume}, have {held}")));
                }
                let fill = Fill::for_volume(price, volume);
                *st.balances.entry(coin).or_default() = (held - volume).max(0.0);
                *st.balances.entry(QUOTE_CURRENCY.to_string()).or_default() += fill.amount;
                fill
            }
            _ => return Err(BrokerError::Rejected("unsupported order type".to_string())),
        };

        let uuid = new_uuid();
        let hidden = self.fill_delay_polls > 0;
        let snapshot = OrderSnapshot {
            uuid: uuid.clone(),
            market: req.market.clone(),
            side: req.side,
            state: if hidden { OrderState::Wait } else { OrderState::Done },
            executed_volume: if hidden { 0.0 } else { fill.volume },
            avg_price: if hidden { None } else { Some(fill.price) },
            executed_funds: if hidden { None } else { Some(fill.amount) },
        };
        st.orders.insert(
            uuid,
            PaperOrder { snapshot: snapshot.clone(), fill: Some(fill), polls_left: self.fill_delay_polls },
        );
        st.placed.push(req.clone());
        EXECS.with_label_values(&[req.side.as_str(), "paper"]).inc();
        Ok(snapshot)
    }

    async fn get_order(&self, uuid: &str) -> Result<OrderSnapshot, BrokerError> {
        let mut st = self.lock();
        let order = st.orders.get_mut(uuid).ok_or_else(|| BrokerError::UnknownOrder(uuid.to_string()))?;
        if order.polls_left > 0 {
            order.polls_left -= 1;
        }
        if order.polls_left == 0 && order.snapshot.state == OrderState::Wait {
            if let Some(fill) = order.fill {
                order.snapshot.state = OrderState::Done;
                order.snapshot.executed_volume = fill.volume;
                order.snapshot.avg_price = Some(fill.price);
                order.snapshot.executed_funds = Some(fill.amount);
            }
        }
        Ok(order.snapshot.clone())
    }

    async fn cancel_order(&self, uuid: &str) -> Result<OrderSnapshot, BrokerError> {
        let mut st = self.lock();
        let order = st.orders.get_mut(uuid).ok_or_else(|| BrokerError::UnknownOrder(uuid.to_string()))?;
        if order.snapshot.state == OrderState::Wait {
            order.snapshot.state = OrderState::Cancel;
        }
        Ok(order.snapshot.clone())
    }

    async fn get_accounts(&self) -> Result<Vec<AccountBalance>, BrokerError> {
        let st = self.lock();
        let mut out: Vec<AccountBalance> = st
            .balances
            .iter()
            .map(|(c, b)| AccountBalance { currency: c.clone(), balance: *b, locked: 0.0 })
            .collect();
        out.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(out)
    }

    async fn get_ticker(&self, market: &str) -> Result<Ticker, BrokerError> {
        let st = self.lock();
        st.prices
            .get(market)
            .map(|p| Ticker { market: market.to_string(), trade_price: *p })
            .ok_or_else(|| BrokerError::UnknownMarket(market.to_string()))
    }

    async fn get_candles(&self, market: &str, _unit: u32, count: usize) -> Result<Vec<Candle>, BrokerError> {
        let st = self.lock();
        let series = st.candles.get(market).ok_or_else(|| BrokerError::UnknownMarket(market.to_string()))?;
        let start = series.len().saturating_sub(count);
        Ok(series[start..].to_vec())
    }
}
