// ===============================
// src/recorder.rs (trade history, JSONL)
// ===============================
//
// Append-only trade/position history. Every mutation is one JSON line;
// opening the file replays the lines to rebuild state, so positions are
// never deleted, only closed.
//
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tracing::{info, warn};

use crate::domain::{Position, PositionStatus, TradeRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown position id {0}")]
    UnknownPosition(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStatistics {
    pub total_trades: usize,
    pub closed_positions: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl_pct: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub max_profit: f64,
    pub max_loss: f64,
}

#[async_trait]
pub trait TradeHistoryStore: Send + Sync {
    /// Persist a new OPEN position, returns its id.
    async fn save_position(&self, position: &Position) -> Result<u64, StoreError>;
    /// Close: sets exit fields, pnl = exit_amount - entry_amount, pnl_pct from prices.
    async fn close_position(&self, id: u64, exit_price: f64, exit_volume: f64, exit_amount: f64) -> Result<Position, StoreError>;
    /// Rewrite entry fields after an escape buy was blended in.
    async fn update_position_entry(&self, id: u64, entry_price: f64, entry_volume: f64, entry_amount: f64) -> Result<(), StoreError>;
    /// Newest first.
    async fn get_open_positions(&self, market: Option<&str>) -> Result<Vec<Position>, StoreError>;
    async fn save_trade(&self, trade: TradeRecord) -> Result<u64, StoreError>;
    /// Newest first.
    async fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError>;
    async fn statistics(&self, market: Option<&str>, today_only: bool) -> Result<TradeStatistics, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HistoryEvent {
    PositionOpened { position: Position },
    EntryUpdated { id: u64, entry_price: f64, entry_volume: f64, entry_amount: f64 },
    PositionClosed { id: u64, exit_price: f64, exit_volume: f64, exit_amount: f64, at: DateTime<Utc> },
    Trade { trade: TradeRecord },
}

#[derive(Debug, Default)]
struct History {
    positions: Vec<Position>,
    trades: Vec<TradeRecord>,
    next_position_id: u64,
    next_trade_id: u64,
}

impl History {
    fn apply(&mut self, ev: &HistoryEvent) -> Result<(), StoreError> {
        match ev {
            HistoryEvent::PositionOpened { position } => {
                let id = position.id.unwrap_or(self.next_position_id + 1);
                self.next_position_id = self.next_position_id.max(id);
                self.positions.push(Position { id: Some(id), ..position.clone() });
            }
            HistoryEvent::EntryUpdated { id, entry_price, entry_volume, entry_amount } => {
                let p = self.position_mut(*id)?;
                p.entry_price = *entry_price;
                p.entry_volume = *entry_volume;
                p.entry_amount = *entry_amount;
            }
            HistoryEvent::PositionClosed { id, exit_price, exit_volume, exit_amount, at } => {
                self.position_mut(*id)?.close(*exit_price, *exit_volume, *exit_amount, *at);
            }
            HistoryEvent::Trade { trade } => {
                self.next_trade_id = self.next_trade_id.max(trade.id);
                self.trades.push(trade.clone());
            }
        }
        Ok(())
    }

    fn position_mut(&mut self, id: u64) -> Result<&mut Position, StoreError> {
        self.positions
            .iter_mut()
            .find(|p| p.id == Some(id))
            .ok_or(StoreError::UnknownPosition(id))
    }

    fn open_positions(&self, market: Option<&str>) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .filter(|p| market.map_or(true, |m| p.market == m))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.entry_time.cmp(&a.entry_time));
        out
    }

    fn statistics(&self, market: Option<&str>, today_only: bool) -> TradeStatistics {
        let today = Local::now().date_naive();
        let is_today = |t: &DateTime<Utc>| t.with_timezone(&Local).date_naive() == today;
        // manual trades tidak dihitung
        let counted = |strategy: &str, m: &str| strategy != "manual" && market.map_or(true, |x| x == m);

        let total_trades = self
            .trades
            .iter()
            .filter(|t| counted(&t.strategy, &t.market))
            .filter(|t| !today_only || is_today(&t.timestamp))
            .count();

        let closed: Vec<&Position> = self
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::Closed && counted(&p.strategy, &p.market))
            .filter(|p| !today_only || p.exit_time.as_ref().map_or(false, is_today))
            .collect();

        let pnls: Vec<f64> = closed.iter().map(|p| p.realized_pnl.unwrap_or(0.0)).collect();
        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
        let mean = |xs: &[f64]| if xs.is_empty() { 0.0 } else { xs.iter().sum::<f64>() / xs.len() as f64 };
        let pnl_pcts: Vec<f64> = closed.iter().map(|p| p.realized_pnl_pct.unwrap_or(0.0)).collect();

        let avg_win = mean(&wins);
        let avg_loss = mean(&losses);
        TradeStatistics {
            total_trades,
            closed_positions: closed.len(),
            winning_trades: wins.len(),
            losing_trades: closed.len() - wins.len(),
            win_rate: if closed.is_empty() { 0.0 } else { wins.len() as f64 / closed.len() as f64 * 100.0 },
            total_pnl: pnls.iter().sum(),
            avg_pnl_pct: mean(&pnl_pcts),
            avg_win,
            avg_loss,
            profit_factor: if avg_loss != 0.0 { (avg_win / avg_loss).abs() } else { 0.0 },
            max_profit: pnls.iter().copied().fold(None, |m: Option<f64>, x| Some(m.map_or(x, |m| m.max(x)))).unwrap_or(0.0),
            max_loss: pnls.iter().copied().fold(None, |m: Option<f64>, x| Some(m.map_or(x, |m| m.min(x)))).unwrap_or(0.0),
        }
    }

    fn next_position_event(&self, position: &Position) -> (u64, HistoryEvent) {
        let id = self.next_position_id + 1;
        (id, HistoryEvent::PositionOpened { position: Position { id: Some(id), ..position.clone() } })
    }

    fn next_trade_event(&self, trade: TradeRecord) -> (u64, HistoryEvent) {
        let id = self.next_trade_id + 1;
        (id, HistoryEvent::Trade { trade: TradeRecord { id, ..trade } })
    }

    fn close_event(&self, id: u64, exit_price: f64, exit_volume: f64, exit_amount: f64) -> Result<HistoryEvent, StoreError> {
        if !self.positions.iter().any(|p| p.id == Some(id)) {
            return Err(StoreError::UnknownPosition(id));
        }
        Ok(HistoryEvent::PositionClosed { id, exit_price, exit_volume, exit_amount, at: Utc::now() })
    }

    fn closed(&self, id: u64) -> Result<Position, StoreError> {
        self.positions.iter().find(|p| p.id == Some(id)).cloned().ok_or(StoreError::UnknownPosition(id))
    }
}

// -----------------------------------------------------------------------------
// In-memory store (tests, ephemeral paper sessions)
// -----------------------------------------------------------------------------
#[derive(Debug, Default)]
pub struct MemoryTradeStore {
    history: Mutex<History>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeHistoryStore for MemoryTradeStore {
    async fn save_position(&self, position: &Position) -> Result<u64, StoreError> {
        let mut h = self.history.lock().await;
        let (id, ev) = h.next_position_event(position);
        h.apply(&ev)?;
        Ok(id)
    }

    async fn close_position(&self, id: u64, exit_price: f64, exit_volume: f64, exit_amount: f64) -> Result<Position, StoreError> {
        let mut h = self.history.lock().await;
        let ev = h.close_event(id, exit_price, exit_volume, exit_amount)?;
        h.apply(&ev)?;
        h.closed(id)
    }

    async fn update_position_entry(&self, id: u64, entry_price: f64, entry_volume: f64, entry_amount: f64) -> Result<(), StoreError> {
        self.history
            .lock()
            .await
            .apply(&HistoryEvent::EntryUpdated { id, entry_price, entry_volume, entry_amount })
    }

    async fn get_open_positions(&self, market: Option<&str>) -> Result<Vec<Position>, StoreError> {
        Ok(self.history.lock().await.open_positions(market))
    }

    async fn save_trade(&self, trade: TradeRecord) -> Result<u64, StoreError> {
        let mut h = self.history.lock().await;
        let (id, ev) = h.next_trade_event(trade);
        h.apply(&ev)?;
        Ok(id)
    }

    async fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let h = self.history.lock().await;
        Ok(h.trades.iter().rev().take(limit).cloned().collect())
    }

    async fn statistics(&self, market: Option<&str>, today_only: bool) -> Result<TradeStatistics, StoreError> {
        Ok(self.history.lock().await.statistics(market, today_only))
    }
}

// -----------------------------------------------------------------------------
// JSONL store
// -----------------------------------------------------------------------------
#[derive(Debug)]
pub struct JsonlTradeStore {
    path: PathBuf,
    history: Mutex<History>,
}

impl JsonlTradeStore {
    /// Open (or create) the history file and replay it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        // Pastikan parent directory ada (kalau ada)
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut history = History::default();
        if fs::try_exists(&path).await? {
            let file = fs::File::open(&path).await?;
            let mut lines = BufReader::new(file).lines();
            let mut lineno = 0usize;
            while let Some(line) = lines.next_line().await? {
                lineno += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<HistoryEvent>(&line) {
                    Ok(ev) => {
                        if let Err(e) = history.apply(&ev) {
                            warn!(?e, lineno, "recorder: skip inconsistent event");
                        }
                    }
                    Err(e) => warn!(?e, lineno, "recorder: skip malformed line"),
                }
            }
        }

        info!(
            path = %path.display(),
            positions = history.positions.len(),
            trades = history.trades.len(),
            "recorder: history loaded"
        );
        Ok(Self { path, history: Mutex::new(history) })
    }

    async fn append(&self, ev: &HistoryEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(ev)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Write first, then apply: memory never runs ahead of the file.
    async fn commit(&self, history: &mut History, ev: HistoryEvent) -> Result<(), StoreError> {
        self.append(&ev).await?;
        history.apply(&ev)
    }
}

#[async_trait]
impl TradeHistoryStore for JsonlTradeStore {
    async fn save_position(&self, position: &Position) -> Result<u64, StoreError> {
        let mut h = self.history.lock().await;
        let (id, ev) = h.next_position_event(position);
        self.commit(&mut h, ev).await?;
        Ok(id)
    }

    async fn close_position(&self, id: u64, exit_price: f64, exit_volume: f64, exit_amount: f64) -> Result<Position, StoreError> {
        let mut h = self.history.lock().await;
        let ev = h.close_event(id, exit_price, exit_volume, exit_amount)?;
        self.commit(&mut h, ev).await?;
        h.closed(id)
    }

    async fn update_position_entry(&self, id: u64, entry_price: f64, entry_volume: f64, entry_amount: f64) -> Result<(), StoreError> {
        let mut h = self.history.lock().await;
        h.position_mut(id)?;
        self.commit(&mut h, HistoryEvent::EntryUpdated { id, entry_price, entry_volume, entry_amount }).await
    }

    async fn get_open_positions(&self, market: Option<&str>) -> Result<Vec<Position>, StoreError> {
        Ok(self.history.lock().await.open_positions(market))
    }

    async fn save_trade(&self, trade: TradeRecord) -> Result<u64, StoreError> {
        let mut h = self.history.lock().await;
        let (id, ev) = h.next_trade_event(trade);
        self.commit(&mut h, ev).await?;
        Ok(id)
    }

    async fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let h = self.history.lock().await;
        Ok(h.trades.iter().rev().take(limit).cloned().collect())
    }

    async fn statistics(&self, market: Option<&str>, today_only: bool) -> Result<TradeStatistics, StoreError> {
        Ok(self.history.lock().await.statistics(market, today_only))
    }
}
