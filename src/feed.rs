// ===============================
// src/feed.rs
// ===============================
//
// Paper market data: random-walk candles pushed into the PaperBroker so the
// engine has something to trade against without an exchange connection.
//
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::domain::Candle;
use crate::gateway::PaperBroker;

/// Langkah random walk maksimum per candle (persen)
const MAX_STEP_PCT: f64 = 0.6;

fn next_candle(prev_close: f64, timestamp: i64) -> Candle {
    // jangan simpan ThreadRng melewati .await
    let mut rng = rand::thread_rng();
    let step = rng.gen_range(-MAX_STEP_PCT..=MAX_STEP_PCT) / 100.0;
    let close = (prev_close * (1.0 + step)).max(1.0);
    let wick = prev_close.max(close) * rng.gen_range(0.0..0.002);
    Candle {
        timestamp,
        open: prev_close,
        high: prev_close.max(close) + wick,
        low: (prev_close.min(close) - wick).max(0.0),
        close,
        volume: rng.gen_range(0.1..5.0),
    }
}

/// Backfill `count` candles ending now so strategies can warm up immediately.
pub fn seed_history(broker: &PaperBroker, market: &str, start_price: f64, count: usize, step: Duration) {
    let now = Utc::now().timestamp_millis();
    let step_ms = step.as_millis() as i64;
    let mut close = start_price;
    let mut candles = Vec::with_capacity(count);
    for i in 0..count {
        let ts = now - step_ms * (count - i) as i64;
        let c = next_candle(close, ts);
        close = c.close;
        candles.push(c);
    }
    broker.set_candles(market, candles);
    debug!(market, count, last = close, "paper history seeded");
}

/// One new candle per market every `interval`, forever.
pub async fn run_paper(broker: Arc<PaperBroker>, markets: Vec<String>, interval: Duration) {
    info!(?markets, interval_ms = interval.as_millis() as u64, "paper feed started");
    loop {
        let now = Utc::now().timestamp_millis();
        for market in &markets {
            let prev = broker.last_price(market).unwrap_or(100_000.0);
            broker.push_candle(market, next_candle(prev, now));
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_stays_positive_and_consistent() {
        let mut prev = 10.0;
        for i in 0..1_000 {
            let c = next_candle(prev, i);
            assert!(c.close >= 1.0);
            assert!(c.high >= c.open.max(c.close));
            assert!(c.low <= c.open.min(c.close));
            prev = c.close;
        }
    }

    #[test]
    fn seeded_history_sets_last_price() {
        let broker = PaperBroker::new(0.0);
        seed_history(&broker, "KRW-BTC", 50_000.0, 40, Duration::from_secs(60));
        let last = broker.last_price("KRW-BTC").unwrap();
        assert!(last > 0.0);
    }
}
