use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::LineConfig;
use crate::models::{MergedStock, PipelineError};

/// LINE caps a text message at 2000 characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

const LINE_PUSH_URL: &str = "https://api.line.me/v2/bot/message/push";

/// Delivery seam. One call, one payload; chunking is the caller's job via
/// `send_chunked`.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn push_text(&self, text: &str) -> Result<(), PipelineError>;
}

pub struct LineNotifier {
    config: LineConfig,
    client: Client,
}

impl LineNotifier {
    pub fn new(config: LineConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for LineNotifier {
    async fn push_text(&self, text: &str) -> Result<(), PipelineError> {
        let payload = json!({
            "to": self.config.user_id,
            "messages": [{ "type": "text", "text": text }]
        });
        let response = self
            .client
            .post(LINE_PUSH_URL)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.channel_access_token),
            )
            .json(&payload)
            .send()
            .await
            .map_err(|e| PipelineError::Notification(format!("push failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(PipelineError::Notification(format!(
                "LINE API error: {}",
                response.status()
            )));
        }
        log::info!("pushed message to {}", self.config.user_id);
        Ok(())
    }
}

/// Split an oversized message into ≤2000-char chunks and send them in order.
/// The first failed chunk aborts the rest and fails the whole send.
pub async fn send_chunked(notifier: &dyn Notifier, message: &str) -> Result<(), PipelineError> {
    let chars: Vec<char> = message.chars().collect();
    for chunk in chars.chunks(MAX_MESSAGE_CHARS) {
        let part: String = chunk.iter().collect();
        notifier.push_text(&part).await?;
    }
    Ok(())
}

/// Digest of the market screen, one block per selected stock.
pub fn build_screen_summary(selected: &[MergedStock], date: &str) -> String {
    if selected.is_empty() {
        return "⚠️ 今日沒有符合條件的股票".to_string();
    }
    let mut message = format!("📈 {} 符合條件的股票:\n\n", date);
    for stock in selected {
        message.push_str(&format!(
            "🔢 代號: {}\n📊 名稱: {}\n💰 成交: {}\n📈 漲跌幅: {}%\n💼 成交量: {} 張\n🏛️ 法人買超: {} 張\n\n",
            stock.code,
            stock.name,
            stock.close,
            stock.change_pct.map_or("N/A".to_string(), |v| v.to_string()),
            stock.volume_lots.map_or("N/A".to_string(), |v| v.to_string()),
            stock.total_net_buy.map_or("N/A".to_string(), |v| v.to_string()),
        ));
    }
    message
}

pub async fn send_screen_summary(
    notifier: &dyn Notifier,
    selected: &[MergedStock],
    date: &str,
) -> Result<(), PipelineError> {
    send_chunked(notifier, &build_screen_summary(selected, date)).await
}

pub async fn send_stock_analysis(
    notifier: &dyn Notifier,
    stock_id: &str,
    analysis: &str,
) -> Result<(), PipelineError> {
    let message = format!("📊 股票 {} 詳細分析\n\n{}", stock_id, analysis);
    send_chunked(notifier, &message).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records payload lengths; fails the n-th call when told to.
    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<usize>>,
        fail_on_call: Option<usize>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn push_text(&self, text: &str) -> Result<(), PipelineError> {
            let mut sent = self.sent.lock().unwrap();
            let call = sent.len() + 1;
            sent.push(text.chars().count());
            if self.fail_on_call == Some(call) {
                return Err(PipelineError::Notification("boom".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_chunking_splits_in_order() {
        let notifier = RecordingNotifier::default();
        let message = "股".repeat(5000);
        send_chunked(&notifier, &message).await.unwrap();
        assert_eq!(*notifier.sent.lock().unwrap(), vec![2000, 2000, 1000]);
    }

    #[tokio::test]
    async fn test_chunking_aborts_after_first_failure() {
        let notifier = RecordingNotifier {
            fail_on_call: Some(2),
            ..RecordingNotifier::default()
        };
        let message = "a".repeat(5000);
        let result = send_chunked(&notifier, &message).await;
        assert!(result.is_err());
        assert_eq!(*notifier.sent.lock().unwrap(), vec![2000, 2000]);
    }

    #[tokio::test]
    async fn test_short_message_sends_once() {
        let notifier = RecordingNotifier::default();
        send_chunked(&notifier, "短訊").await.unwrap();
        assert_eq!(*notifier.sent.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_empty_screen_summary_notice() {
        assert_eq!(build_screen_summary(&[], "06/03"), "⚠️ 今日沒有符合條件的股票");
    }

    #[test]
    fn test_screen_summary_lists_each_stock() {
        let stock = MergedStock {
            code: "2330".into(),
            name: "台積電".into(),
            close: "812".into(),
            change_pct: Some(1.5),
            volume_lots: Some(30000.0),
            total_net_buy: Some(5000.0),
            ..MergedStock::default()
        };
        let message = build_screen_summary(&[stock], "06/03");
        assert!(message.contains("📈 06/03 符合條件的股票"));
        assert!(message.contains("代號: 2330"));
        assert!(message.contains("法人買超: 5000 張"));
    }
}
