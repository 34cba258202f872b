// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Loop --------
pub static CYCLES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("cycles_total", "execution cycles run").unwrap());

pub static CYCLE_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("cycle_errors_total", "execution cycles that failed").unwrap());

pub static SIGNALS_BY: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("signals_total_by", "signals by kind & market (labels: signal, market)"),
        &["signal", "market"],
    )
    .unwrap()
});

// -------- Orders --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_total", "orders executed by the engine"), &["side", "mode"]).unwrap()
});

pub static EXECS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("exec_reports_total", "orders accepted by the venue"), &["side", "venue"]).unwrap()
});

pub static RISK_REJECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("risk_rejections_total", "entries blocked by risk").unwrap());

pub static ESCAPES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("escapes_total", "escape buys (label: outcome)"), &["outcome"]).unwrap()
});

pub static LIQUIDATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("liquidations_total", "worst-position liquidations (label: outcome)"), &["outcome"])
        .unwrap()
});

pub static RECONCILED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("reconciled_positions_total", "orphaned positions force-closed").unwrap());

pub static FORCE_EXITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("force_exit_total", "force-exit results (label: outcome)"), &["outcome"]).unwrap()
});

pub static NOTIFY_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("notify_failures_total", "failed notification deliveries").unwrap());

// -------- Portfolio --------
pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_positions", "open positions in the ledger").unwrap());

pub static DAILY_PNL_PCT: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("daily_realized_pnl_pct", "realized PnL% today").unwrap());

// ---- Config visibility ----
pub static CONFIG_MARKET: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_market", "configured markets (label: market)"), &["market"]).unwrap()
});

pub static CONFIG_DRY_RUN: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_dry_run", "1 if running in dry-run").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(CYCLES.clone())),
        REGISTRY.register(Box::new(CYCLE_ERRORS.clone())),
        REGISTRY.register(Box::new(SIGNALS_BY.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(EXECS.clone())),
        REGISTRY.register(Box::new(RISK_REJECTS.clone())),
        REGISTRY.register(Box::new(ESCAPES.clone())),
        REGISTRY.register(Box::new(LIQUIDATIONS.clone())),
        REGISTRY.register(Box::new(RECONCILED.clone())),
        REGISTRY.register(Box::new(FORCE_EXITS.clone())),
        REGISTRY.register(Box::new(NOTIFY_FAILURES.clone())),
        REGISTRY.register(Box::new(OPEN_POSITIONS.clone())),
        REGISTRY.register(Box::new(DAILY_PNL_PCT.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_MARKET.clone())),
        REGISTRY.register(Box::new(CONFIG_DRY_RUN.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, ?e, "metrics bind failed, exporter disabled");
                return;
            }
        };
        tracing::info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}
