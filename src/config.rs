// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : krw_exec_bot: polling order-execution engine for KRW spot markets
Module  : config.rs
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
use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use thiserror::Error;

use crate::strategy::StrategyKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid { key: &'static str, value: String, reason: &'static str },
    #[error("unknown strategy '{name}'. available: {available}")]
    UnknownStrategy { name: String, available: String },
    #[error("strategy window invalid: short={short} must be smaller than long={long}")]
    Window { short: usize, long: usize },
}

/// Risk limits (harian)
#[derive(Clone, Debug)]
pub struct RiskConfig {
    pub max_daily_loss_pct: f64,
    pub max_position_pct: f64,
    pub max_open_positions: usize,
    pub min_balance_krw: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self { max_daily_loss_pct: 3.0, max_position_pct: 5.0, max_open_positions: 5, min_balance_krw: 10_000.0 }
    }
}

/// Immutable engine settings, passed by value into each component.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub market: String,
    pub candle_unit: u32,
    pub candle_count: usize,
    pub poll_interval: Duration,
    pub dry_run: bool,
    /// Fallback stake when the balance cannot be fetched.
    pub order_amount: Option<f64>,
    pub order_amount_pct: f64,
    /// Floor for every entry. Keeps positions above the exchange minimum so they can be exited.
    pub min_order_amount: f64,
    /// Exchange minimum tradable notional.
    pub min_sell_amount: f64,
    pub max_positions: usize,
    pub fill_poll_attempts: u32,
    pub fill_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            market: "KRW-BTC".to_string(),
            candle_unit: 1,
            candle_count: 200,
            poll_interval: Duration::from_secs(30),
            dry_run: true,
            order_amount: None,
            order_amount_pct: 3.0,
            min_order_amount: 6_000.0,
            min_sell_amount: 5_000.0,
            max_positions: 5,
            fill_poll_attempts: 4,
            fill_poll_interval: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_market("MARKET", &self.market)?;
        if self.poll_interval.is_zero() {
            return Err(invalid("POLL_INTERVAL_SECS", "0", "must be > 0"));
        }
        if self.candle_count == 0 {
            return Err(invalid("CANDLE_COUNT", "0", "must be > 0"));
        }
        if self.max_positions == 0 {
            return Err(invalid("MAX_POSITIONS", "0", "must be > 0"));
        }
        if self.min_order_amount < 0.0 {
            return Err(invalid("MIN_ORDER_AMOUNT", &self.min_order_amount.to_string(), "must be >= 0"));
        }
        if self.min_sell_amount < 0.0 {
            return Err(invalid("MIN_SELL_AMOUNT", &self.min_sell_amount.to_string(), "must be >= 0"));
        }
        Ok(())
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.max_position_pct) {
            return Err(invalid("RISK_MAX_POSITION_PCT", &self.max_position_pct.to_string(), "must be within 0..=100"));
        }
        if self.max_daily_loss_pct < 0.0 {
            return Err(invalid("RISK_MAX_DAILY_LOSS_PCT", &self.max_daily_loss_pct.to_string(), "must be >= 0"));
        }
        Ok(())
    }

    /// Exposure cap below the ledger cap would reject every BUY that needs a
    /// liquidation, so the full-portfolio path could never run.
    pub fn validate_for(&self, engine: &EngineConfig) -> Result<(), ConfigError> {
        self.validate()?;
        if self.max_open_positions < engine.max_positions {
            return Err(invalid(
                "RISK_MAX_OPEN_POSITIONS",
                &self.max_open_positions.to_string(),
                "must be >= MAX_POSITIONS",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct StrategyParams {
    pub kind: StrategyKind,
    pub ma_short: usize,
    pub ma_long: usize,
    pub mr_window: usize,
    pub mr_edge_pct: f64,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub engine: EngineConfig,
    /// rotasi multi-market (kosong = single market)
    pub markets: Vec<String>,
    pub strategy: StrategyParams,

    // files/metrics
    pub trade_history_file: String,
    pub metrics_port: u16,
    pub paper_krw_balance: f64,

    // notifications
    pub slack_webhook_url: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

fn invalid(key: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { key, value: value.to_string(), reason }
}

pub fn validate_market(key: &'static str, market: &str) -> Result<(), ConfigError> {
    match market.split_once('-') {
        Some((quote, base)) if !quote.is_empty() && !base.is_empty() => Ok(()),
        _ => Err(invalid(key, market, "must be QUOTE-BASE, e.g. KRW-BTC")),
    }
}

/// Missing key -> default; present but unparsable -> error.
fn parse_env<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|_| invalid(key, &raw, "unparsable"))
        }
        _ => Ok(default),
    }
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            "" => Ok(default),
            _ => Err(invalid(key, &raw, "expected true/false")),
        },
        Err(_) => Ok(default),
    }
}

fn opt_string(key: &str) -> Option<String> {
    env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

pub fn load() -> Result<(Args, RiskConfig), ConfigError> {
    // Pastikan .env dibaca
    let _ = dotenv();

    let defaults = EngineConfig::default();
    let market = env::var("MARKET").unwrap_or_else(|_| defaults.market.clone()).to_ascii_uppercase();

    // Multi-market: MARKETS=KRW-BTC,KRW-ETH,KRW-XRP
    let markets: Vec<String> = env::var("MARKETS")
        .ok()
        .map(|s| {
            s.split(',')
                .map(|x| x.trim())
                .filter(|x| !x.is_empty())
                .map(|x| x.to_ascii_uppercase())
                .collect()
        })
        .unwrap_or_default();
    for m in &markets {
        validate_market("MARKETS", m)?;
    }

    let order_amount = match opt_string("ORDER_AMOUNT") {
        Some(raw) => Some(raw.parse::<f64>().map_err(|_| invalid("ORDER_AMOUNT", &raw, "unparsable"))?),
        None => None,
    };

    let engine = EngineConfig {
        market,
        candle_unit: parse_env("CANDLE_UNIT", defaults.candle_unit)?,
        candle_count: parse_env("CANDLE_COUNT", defaults.candle_count)?,
        poll_interval: Duration::from_secs(parse_env("POLL_INTERVAL_SECS", 30u64)?),
        dry_run: parse_bool("DRY_RUN", true)?,
        order_amount,
        order_amount_pct: parse_env("ORDER_AMOUNT_PCT", defaults.order_amount_pct)?.clamp(0.1, 100.0),
        min_order_amount: parse_env("MIN_ORDER_AMOUNT", defaults.min_order_amount)?,
        min_sell_amount: parse_env("MIN_SELL_AMOUNT", defaults.min_sell_amount)?,
        max_positions: parse_env("MAX_POSITIONS", defaults.max_positions)?,
        fill_poll_attempts: parse_env("FILL_POLL_ATTEMPTS", defaults.fill_poll_attempts)?,
        fill_poll_interval: Duration::from_millis(parse_env("FILL_POLL_INTERVAL_MS", 500u64)?),
    };
    engine.validate()?;

    // ===== Strategy selection =====
    //   STRATEGY=ma_crossover | mean_reversion
    let strategy_name = env::var("STRATEGY").unwrap_or_else(|_| "ma_crossover".to_string());
    let strategy = StrategyParams {
        kind: StrategyKind::parse(&strategy_name)?,
        ma_short: parse_env("MA_SHORT", 14usize)?,
        ma_long: parse_env("MA_LONG", 37usize)?,
        mr_window: parse_env("MR_WINDOW", 20usize)?,
        mr_edge_pct: parse_env("MR_EDGE_PCT", 1.0f64)?,
    };
    strategy.validate()?;

    let args = Args {
        engine,
        markets,
        strategy,
        trade_history_file: env::var("TRADE_HISTORY_FILE")
            .unwrap_or_else(|_| "data/trade_history.jsonl".to_string()),
        metrics_port: parse_env("METRICS_PORT", 9898u16)?,
        paper_krw_balance: parse_env("PAPER_KRW_BALANCE", 1_000_000.0f64)?,
        slack_webhook_url: opt_string("SLACK_WEBHOOK_URL"),
        telegram_bot_token: opt_string("TELEGRAM_BOT_TOKEN"),
        telegram_chat_id: opt_string("TELEGRAM_CHAT_ID"),
    };

    // ===== Risk =====
    let rd = RiskConfig::default();
    let risk = RiskConfig {
        max_daily_loss_pct: parse_env("RISK_MAX_DAILY_LOSS_PCT", rd.max_daily_loss_pct)?,
        max_position_pct: parse_env("RISK_MAX_POSITION_PCT", rd.max_position_pct)?,
        max_open_positions: parse_env("RISK_MAX_OPEN_POSITIONS", rd.max_open_positions)?,
        min_balance_krw: parse_env("RISK_MIN_BALANCE_KRW", rd.min_balance_krw)?,
    };
    risk.validate_for(&args.engine)?;

    Ok((args, risk))
}

impl StrategyParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.kind {
            StrategyKind::MaCrossover if self.ma_short == 0 || self.ma_short >= self.ma_long => {
                Err(ConfigError::Window { short: self.ma_short, long: self.ma_long })
            }
            StrategyKind::MeanReversion if self.mr_window < 2 => {
                Err(invalid("MR_WINDOW", &self.mr_window.to_string(), "must be >= 2"))
            }
            StrategyKind::MeanReversion if self.mr_edge_pct <= 0.0 => {
                Err(invalid("MR_EDGE_PCT", &self.mr_edge_pct.to_string(), "must be > 0"))
            }
            _ => Ok(()),
        }
    }
}
