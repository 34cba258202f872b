// ===============================
// src/notifier.rs (post-trade notifications)
// ===============================
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Args;
use crate::metrics::NOTIFY_FAILURES;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{sink}: unexpected status {status}")]
    Status { sink: &'static str, status: u16 },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, message: &str, context: &Value) -> Result<(), NotifyError>;
}

/// Logs through tracing.
#[derive(Debug, Default)]
pub struct ConsoleSink;

#[async_trait]
impl NotificationSink for ConsoleSink {
    fn name(&self) -> &'static str { "console" }

    async fn send(&self, message: &str, context: &Value) -> Result<(), NotifyError> {
        info!(%context, "NOTIFY: {message}");
        Ok(())
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder().timeout(HTTP_TIMEOUT).build().unwrap_or_default()
}

pub struct SlackSink {
    http: reqwest::Client,
    webhook_url: String,
}

impl SlackSink {
    pub fn new(webhook_url: String) -> Self {
        Self { http: http_client(), webhook_url }
    }
}

#[async_trait]
impl NotificationSink for SlackSink {
    fn name(&self) -> &'static str { "slack" }

    async fn send(&self, message: &str, context: &Value) -> Result<(), NotifyError> {
        let mut payload = json!({ "text": message });
        if let (Some(obj), Some(extra)) = (payload.as_object_mut(), context.as_object()) {
            obj.extend(extra.clone());
        }
        let rsp = self.http.post(&self.webhook_url).json(&payload).send().await?;
        if !rsp.status().is_success() {
            return Err(NotifyError::Status { sink: "slack", status: rsp.status().as_u16() });
        }
        Ok(())
    }
}

pub struct TelegramSink {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self { http: http_client(), bot_token, chat_id }
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn name(&self) -> &'static str { "telegram" }

    async fn send(&self, message: &str, context: &Value) -> Result<(), NotifyError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let text = if context.is_null() { message.to_string() } else { format!("{message}\n{context}") };
        let payload = json!({ "chat_id": self.chat_id, "text": text });
        let rsp = self.http.post(url).json(&payload).send().await?;
        if !rsp.status().is_success() {
            return Err(NotifyError::Status { sink: "telegram", status: rsp.status().as_u16() });
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: Vec<(String, String)>,
}

/// Fan-out to every sink. Failures are collected and logged, never returned as errors.
#[derive(Clone, Default)]
pub struct Notifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    pub fn from_args(args: &Args) -> Self {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(ConsoleSink)];
        if let Some(url) = &args.slack_webhook_url {
            sinks.push(Arc::new(SlackSink::new(url.clone())));
        }
        if let (Some(token), Some(chat)) = (&args.telegram_bot_token, &args.telegram_chat_id) {
            sinks.push(Arc::new(TelegramSink::new(token.clone(), chat.clone())));
        }
        Self { sinks }
    }

    pub fn len(&self) -> usize { self.sinks.len() }

    pub fn is_empty(&self) -> bool { self.sinks.is_empty() }

    pub async fn notify(&self, message: &str, context: Value) -> DeliveryReport {
        let results = join_all(self.sinks.iter().map(|s| {
            let ctx = &context;
            async move { (s.name(), s.send(message, ctx).await) }
        }))
        .await;

        let mut report = DeliveryReport::default();
        for (sink, res) in results {
            match res {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    NOTIFY_FAILURES.inc();
                    warn!(sink, error = %e, "notification delivery failed");
                    report.failed.push((sink.to_string(), e.to_string()));
                }
            }
        }
        report
    }
}
