// ===============================
// src/strategy.rs
// ===============================
//
// Signal sources. The engine only sees `SignalSource`; concrete strategies are
// selected by name at startup (see `StrategyKind::parse`) so a typo fails fast
// instead of on the first cycle.
//
use async_trait::async_trait;

use crate::config::{Args, ConfigError, StrategyParams};
use crate::domain::{Candle, Signal};

#[async_trait]
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&mut self, market: &str, candles: &[Candle]) -> Signal;

    /// Redirect the engine to another market for this cycle. `None` = keep current.
    async fn select_market(&mut self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    MaCrossover,
    MeanReversion,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 2] = [StrategyKind::MaCrossover, StrategyKind::MeanReversion];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::MaCrossover => "ma_crossover",
            StrategyKind::MeanReversion => "mean_reversion",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ma_crossover" | "macrossover" | "ma" => Ok(StrategyKind::MaCrossover),
            "mean_reversion" | "meanreversion" | "mr" => Ok(StrategyKind::MeanReversion),
            _ => Err(ConfigError::UnknownStrategy {
                name: s.to_string(),
                available: Self::ALL.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", "),
            }),
        }
    }
}

fn sma(closes: &[f64]) -> f64 {
    closes.iter().sum::<f64>() / closes.len() as f64
}

// -----------------------------------------------------------------------------
// 1) MOVING AVERAGE CROSSOVER (Trend-Following)
//    SMA pendek menembus ke atas SMA panjang antara candle sebelumnya dan
//    sekarang -> Buy (golden cross); menembus ke bawah -> Sell (dead cross).
//    Butuh minimal long + 1 candle.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct MaCrossover {
    short: usize,
    long: usize,
}

impl MaCrossover {
    pub fn new(short: usize, long: usize) -> Result<Self, ConfigError> {
        if short == 0 || short >= long {
            return Err(ConfigError::Window { short, long });
        }
        Ok(Self { short, long })
    }

    pub fn signal(&self, candles: &[Candle]) -> Signal {
        if candles.len() < self.long + 1 {
            return Signal::Hold;
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let n = closes.len();
        let short_ma = sma(&closes[n - self.short..]);
        let long_ma = sma(&closes[n - self.long..]);
        let prior_short = sma(&closes[n - self.short - 1..n - 1]);
        let prior_long = sma(&closes[n - self.long - 1..n - 1]);

        if prior_short <= prior_long && short_ma > long_ma {
            Signal::Buy
        } else if prior_short >= prior_long && short_ma < long_ma {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }
}

#[async_trait]
impl SignalSource for MaCrossover {
    fn name(&self) -> &str { StrategyKind::MaCrossover.as_str() }

    async fn evaluate(&mut self, _market: &str, candles: &[Candle]) -> Signal {
        self.signal(candles)
    }
}

// -----------------------------------------------------------------------------
// 2) MEAN-REVERSION
//    close < SMA(window) x (1 - edge) -> Buy
//    close > SMA(window) x (1 + edge) -> Sell
//    Cocok untuk pasar sideways; saat trending kuat bisa melawan arus.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct MeanReversion {
    window: usize,
    edge_pct: f64,
}

impl MeanReversion {
    pub fn new(window: usize, edge_pct: f64) -> Self {
        Self { window, edge_pct }
    }

    pub fn signal(&self, candles: &[Candle]) -> Signal {
        if self.window == 0 || candles.len() < self.window {
            return Signal::Hold;
        }
        let closes: Vec<f64> = candles[candles.len() - self.window..].iter().map(|c| c.close).collect();
        let fair = sma(&closes);
        let last = closes[closes.len() - 1];
        let edge = self.edge_pct / 100.0;
        if last < fair * (1.0 - edge) {
            Signal::Buy
        } else if last > fair * (1.0 + edge) {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }
}

#[async_trait]
impl SignalSource for MeanReversion {
    fn name(&self) -> &str { StrategyKind::MeanReversion.as_str() }

    async fn evaluate(&mut self, _market: &str, candles: &[Candle]) -> Signal {
        self.signal(candles)
    }
}

// -----------------------------------------------------------------------------
// 3) ROTATION: round-robin target market over a watchlist
// -----------------------------------------------------------------------------
pub struct Rotation {
    inner: Box<dyn SignalSource>,
    markets: Vec<String>,
    cursor: usize,
}

impl Rotation {
    pub fn new(inner: Box<dyn SignalSource>, markets: Vec<String>) -> Self {
        Self { inner, markets, cursor: 0 }
    }
}

#[async_trait]
impl SignalSource for Rotation {
    fn name(&self) -> &str { self.inner.name() }

    async fn evaluate(&mut self, market: &str, candles: &[Candle]) -> Signal {
        self.inner.evaluate(market, candles).await
    }

    async fn select_market(&mut self) -> Option<String> {
        if self.markets.is_empty() {
            return self.inner.select_market().await;
        }
        let m = self.markets[self.cursor % self.markets.len()].clone();
        self.cursor = (self.cursor + 1) % self.markets.len();
        Some(m)
    }
}

pub fn from_params(p: &StrategyParams) -> Result<Box<dyn SignalSource>, ConfigError> {
    p.validate()?;
    Ok(match p.kind {
        StrategyKind::MaCrossover => Box::new(MaCrossover::new(p.ma_short, p.ma_long)?),
        StrategyKind::MeanReversion => Box::new(MeanReversion::new(p.mr_window, p.mr_edge_pct)),
    })
}

/// Strategy from config, wrapped in a rotation when MARKETS is set.
pub fn build(args: &Args) -> Result<Box<dyn SignalSource>, ConfigError> {
    let base = from_params(&args.strategy)?;
    if args.markets.len() > 1 {
        Ok(Box::new(Rotation::new(base, args.markets.clone())))
    } else {
        Ok(base)
    }
}
