use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::OpenAiConfig;
use crate::models::PipelineError;

/// Fixed reply when the narrative service fails for any reason.
pub const NARRATIVE_FALLBACK: &str = "分析服務暫時無法使用";

const SYSTEM_PROMPT: &str = "使用繁體中文回答：你是個一位專業股票分析師，\
請幫我解讀以下技術面訊息和月盈利狀況，\
並幫我針對長期(約半年)及短期(約一個月)提供交易策略";

/// Narrative seam: hand in the rendered dataset, get commentary back. Always
/// returns a string; failures collapse to `NARRATIVE_FALLBACK`.
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn generate_analysis(&self, dataset: &str) -> String;
}

pub struct AiService {
    config: OpenAiConfig,
    client: Client,
}

impl AiService {
    pub fn new(config: OpenAiConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    async fn request_completion(&self, dataset: &str) -> Result<String, PipelineError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let payload = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": dataset }
            ],
            "temperature": 1,
            "max_tokens": 4096,
            "top_p": 1,
            "frequency_penalty": 0,
            "presence_penalty": 0
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| PipelineError::Narrative(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(PipelineError::Narrative(format!(
                "API error: {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Narrative(format!("bad response body: {}", e)))?;

        body.get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| PipelineError::Narrative("no completion content".to_string()))
    }
}

#[async_trait]
impl Narrator for AiService {
    async fn generate_analysis(&self, dataset: &str) -> String {
        match self.request_completion(dataset).await {
            Ok(content) => {
                log::info!("narrative analysis completed");
                content
            }
            Err(e) => {
                log::error!("{}", e);
                NARRATIVE_FALLBACK.to_string()
            }
        }
    }
}
