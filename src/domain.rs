// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quote currency untuk semua market (KRW-XXX)
pub const QUOTE_CURRENCY: &str = "KRW";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal { Hold, Buy, Sell }

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self { Signal::Hold => "hold", Signal::Buy => "buy", Signal::Sell => "sell" }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self { Side::Buy => "buy", Side::Sell => "sell" }
    }
}

/// `Price` = market buy by notional, `Market` = market sell by volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrdType { Price, Market }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle { pub timestamp: i64, pub open: f64, pub high: f64, pub low: f64, pub close: f64, pub volume: f64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker { pub market: String, pub trade_price: f64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance { pub currency: String, pub balance: f64, pub locked: f64 }

impl AccountBalance {
    pub fn total(&self) -> f64 { self.balance + self.locked }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub market: String,
    pub side: Side,
    pub ord_type: OrdType,
    /// KRW notional (only for `OrdType::Price`)
    pub price: Option<f64>,
    /// coin quantity (only for `OrdType::Market`)
    pub volume: Option<f64>,
}

impl OrderRequest {
    pub fn market_buy(market: &str, krw_amount: f64) -> Self {
        Self { market: market.to_string(), side: Side::Buy, ord_type: OrdType::Price, price: Some(krw_amount), volume: None }
    }
    pub fn market_sell(market: &str, volume: f64) -> Self {
        Self { market: market.to_string(), side: Side::Sell, ord_type: OrdType::Market, price: None, volume: Some(volume) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState { Wait, Done, Cancel }

/// Order view returned by `place_order` and `get_order`. Fill fields may be
/// empty right after placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub uuid: String,
    pub market: String,
    pub side: Side,
    pub state: OrderState,
    pub executed_volume: f64,
    pub avg_price: Option<f64>,
    pub executed_funds: Option<f64>,
}

impl OrderSnapshot {
    pub fn fill(&self) -> Option<Fill> {
        if self.executed_volume <= 0.0 {
            return None;
        }
        let price = match (self.avg_price, self.executed_funds) {
            (Some(p), _) if p > 0.0 => p,
            (_, Some(funds)) if funds > 0.0 => funds / self.executed_volume,
            _ => return None,
        };
        let amount = self.executed_funds.unwrap_or(price * self.executed_volume);
        Some(Fill { price, volume: self.executed_volume, amount })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill { pub price: f64, pub volume: f64, pub amount: f64 }

impl Fill {
    /// Estimated fill at `price` for a KRW notional.
    pub fn for_notional(price: f64, amount: f64) -> Self {
        let volume = if price > 0.0 { amount / price } else { 0.0 };
        Self { price, volume, amount }
    }
    /// Estimated fill at `price` for a coin quantity.
    pub fn for_volume(price: f64, volume: f64) -> Self {
        Self { price, volume, amount: price * volume }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus { Open, Closed }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Option<u64>,
    pub market: String,
    pub strategy: String,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub entry_volume: f64,
    pub entry_amount: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub exit_volume: Option<f64>,
    pub exit_amount: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>,
    pub realized_pnl_pct: Option<f64>,
}

impl Position {
    pub fn open(market: &str, strategy: &str, fill: Fill, at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            market: market.to_string(),
            strategy: strategy.to_string(),
            status: PositionStatus::Open,
            entry_price: fill.price,
            entry_volume: fill.volume,
            entry_amount: fill.amount,
            entry_time: at,
            exit_price: None,
            exit_volume: None,
            exit_amount: None,
            exit_time: None,
            realized_pnl: None,
            realized_pnl_pct: None,
        }
    }

    pub fn is_open(&self) -> bool { self.status == PositionStatus::Open }

    /// Live PnL% at `price`.
    pub fn pnl_pct_at(&self, price: f64) -> f64 { pnl_pct(self.entry_price, price) }

    /// Quantity-weighted blend of an extra buy into the entry (no fee accounting).
    pub fn blend_entry(&mut self, extra: Fill) {
        let volume = self.entry_volume + extra.volume;
        if volume > 0.0 {
            self.entry_price = (self.entry_price * self.entry_volume + extra.price * extra.volume) / volume;
        }
        self.entry_volume = volume;
        self.entry_amount += extra.amount;
    }

    pub fn close(&mut self, exit_price: f64, exit_volume: f64, exit_amount: f64, at: DateTime<Utc>) {
        self.status = PositionStatus::Closed;
        self.exit_price = Some(exit_price);
        self.exit_volume = Some(exit_volume);
        self.exit_amount = Some(exit_amount);
        self.exit_time = Some(at);
        self.realized_pnl = Some(exit_amount - self.entry_amount);
        self.realized_pnl_pct = Some(pnl_pct(self.entry_price, exit_price));
    }
}

pub fn pnl_pct(entry_price: f64, exit_price: f64) -> f64 {
    if entry_price > 0.0 { (exit_price - entry_price) / entry_price * 100.0 } else { 0.0 }
}

/// "KRW-BTC" -> "BTC"
pub fn base_currency(market: &str) -> &str {
    market.split_once('-').map(|(_, base)| base).unwrap_or(market)
}

pub fn market_for(currency: &str) -> String {
    format!("{QUOTE_CURRENCY}-{currency}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode { DryRun, Live }

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::DryRun => "dry_run",
            ExecMode::Live => "live",
        }
    }
}

/// Result of one executed signal (the engine's "broker response").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecReport {
    pub market: String,
    pub side: Side,
    pub mode: ExecMode,
    pub order_id: Option<String>,
    pub price: f64,
    pub volume: f64,
    pub amount: f64,
    pub pnl_pct: Option<f64>,
    pub escape: Option<Fill>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub market: String,
    pub strategy: String,
    pub signal: String,
    pub side: Side,
    pub price: f64,
    pub volume: f64,
    pub amount: f64,
    pub order_id: Option<String>,
    pub dry_run: bool,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_is_quantity_weighted() {
        let mut p = Position::open("KRW-BTC", "t", Fill::for_volume(10_000.0, 0.5), Utc::now());
        p.blend_entry(Fill::for_volume(8_000.0, 0.625));
        assert!((p.entry_volume - 1.125).abs() < 1e-12);
        assert!((p.entry_price - 10_000.0 / 1.125).abs() < 1e-6);
        assert!((p.entry_amount - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn close_books_pnl() {
        let mut p = Position::open("KRW-ETH", "t", Fill::for_volume(10_000.0, 1.0), Utc::now());
        p.close(11_000.0, 1.0, 11_000.0, Utc::now());
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.realized_pnl, Some(1_000.0));
        assert_eq!(p.realized_pnl_pct, Some(pnl_pct(10_000.0, 11_000.0)));
    }

    #[test]
    fn snapshot_fill_from_funds() {
        let snap = OrderSnapshot {
            uuid: "x".into(),
            market: "KRW-BTC".into(),
            side: Side::Buy,
            state: OrderState::Done,
            executed_volume: 2.0,
            avg_price: None,
            executed_funds: Some(10_000.0),
        };
        let fill = snap.fill().unwrap();
        assert_eq!(fill.price, 5_000.0);
        assert_eq!(fill.amount, 10_000.0);
        assert_eq!(base_currency("KRW-XRP"), "XRP");
        assert_eq!(market_for("XRP"), "KRW-XRP");
    }
}
