use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Prompt for turning a raw scan report into an operator-facing summary.
/// The report JSON is substituted for `{input_report}`.
const REPORT_PROMPT: &str = "\
You are a cybersecurity expert analyzing an OWASP security report.

Summarize the report below for a security operator:
- List the vulnerabilities found, ordered by risk level.
- For each, give a one-sentence description and the recommended mitigation.
- Close with an overall risk assessment in two sentences.
- Keep the summary concise and professional.

---
Security Report:
{input_report}
";

#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("summarizer disabled")]
    Disabled,
    #[error("model request failed: {0}")]
    Request(String),
    #[error("malformed model response: {0}")]
    Response(String),
}

/// Opaque report-to-text capability. Failures here are never allowed to
/// fail the scan that produced the report.
#[async_trait]
pub trait Summarizer: Send + Sync + 'static {
    async fn summarize(&self, report_json: &str) -> Result<String, SummarizeError>;
}

/// Stand-in used when no model backend is configured; post-processing
/// treats `Disabled` as "skip quietly".
pub struct NoopSummarizer;

#[async_trait]
impl Summarizer for NoopSummarizer {
    async fn summarize(&self, _report_json: &str) -> Result<String, SummarizeError> {
        Err(SummarizeError::Disabled)
    }
}

pub fn render_prompt(report_json: &str) -> String {
    REPORT_PROMPT.replace("{input_report}", report_json)
}

#[cfg(feature = "bedrock")]
pub struct BedrockSummarizer {
    client: aws_sdk_bedrockruntime::Client,
    model_id: String,
}

#[cfg(feature = "bedrock")]
impl BedrockSummarizer {
    pub async fn from_env(model_id: &str) -> Self {
        use aws_config::BehaviorVersion;
        let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let client = aws_sdk_bedrockruntime::Client::new(&shared);
        info!(model_id, "summarizer: bedrock backend");
        Self { client, model_id: model_id.to_string() }
    }
}

#[cfg(feature = "bedrock")]
#[async_trait]
impl Summarizer for BedrockSummarizer {
    async fn summarize(&self, report_json: &str) -> Result<String, SummarizeError> {
        let body = serde_json::json!({
            "prompt": render_prompt(report_json),
            "temperature": 0.7,
            "top_p": 0.9,
            "max_gen_len": 1500,
        });
        let response = self
            .client
            .invoke_model()
            .model_id(&self.model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(aws_sdk_bedrockruntime::primitives::Blob::new(body.to_string()))
            .send()
            .await
            .map_err(|e| SummarizeError::Request(e.into_service_error().to_string()))?;
        let parsed: serde_json::Value = serde_json::from_slice(&response.body.into_inner())
            .map_err(|e| SummarizeError::Response(e.to_string()))?;
        match parsed.get("generation").and_then(|g| g.as_str()) {
            Some(text) => Ok(text.to_string()),
            None => Err(SummarizeError::Response("missing 'generation' field".into())),
        }
    }
}

/// Select a summarizer backend from the environment:
/// `ARGUS_SUMMARIZER=bedrock` for the model-backed one (requires the
/// `bedrock` feature), anything else disables summarization.
pub async fn summarizer_from_env(model_id: &str) -> std::sync::Arc<dyn Summarizer> {
    let mode = std::env::var("ARGUS_SUMMARIZER").unwrap_or_default();
    if mode.eq_ignore_ascii_case("bedrock") {
        #[cfg(feature = "bedrock")]
        {
            return std::sync::Arc::new(BedrockSummarizer::from_env(model_id).await);
        }
        #[cfg(not(feature = "bedrock"))]
        tracing::warn!("bedrock feature not enabled, summarization disabled");
    }
    info!("summarizer: disabled");
    let _ = model_id;
    std::sync::Arc::new(NoopSummarizer)
}
