//! Generative-analysis collaborator implementations.
//!
//! - **[`DisabledAnalyzer`]**: every call fails; the pipeline falls back to
//!   placeholders and leaves photos pending.
//! - **[`OpenAiAnalyzer`]**: any OpenAI-compatible `chat/completions`
//!   endpoint (OpenAI, DashScope compatible mode, vLLM, ...). Images are sent
//!   inline as base64 data URLs.
//!
//! Remote calls go through the shared [`RetryPolicy`], so rate limits and
//! server errors are retried with backoff and client errors fail at once.
//!
//! Prompt texts and fallbacks used by the rest of the crate live here too.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::config::{resolve_secret, AnalysisConfig};
use crate::models::SiteSummary;
use crate::retry::{get_json, RetryPolicy};
use crate::traits::Analyzer;

/// Instruction sent with every site photo.
pub const PHOTO_INSTRUCTION: &str = "Analyze this construction site photo briefly (max 2-3 sentences). Focus on safety, progress, and main hazards.";

/// Stored in place of an analysis when the collaborator failed for a photo.
pub const ANALYSIS_FAILED_MARKER: &str = "Analysis failed during report generation.";

/// Fallback fragment when manpower/machinery could not be summarized.
pub const NO_MANPOWER_PLACEHOLDER: &str = "<ul><li>لا تتوفر بيانات</li></ul>";
/// Fallback fragment when activities could not be summarized.
pub const NO_ACTIVITIES_PLACEHOLDER: &str = "<ul><li>لم يتم تسجيل أنشطة</li></ul>";
/// Fallback when the overall site analysis failed.
pub const ANALYSIS_UNAVAILABLE: &str = "عذراً، حدث خطأ أثناء تحليل البيانات.";
/// Transcript handed to the collaborator for a period without messages.
pub const EMPTY_TRANSCRIPT: &str = "No logs recorded today.";

/// Sent when no safety tip could be generated.
pub const FALLBACK_SAFETY_TIP: &str =
    "⚠️ **تذكير بالسلامة:** تأكد من ارتداء الخوذة وحذاء السلامة في جميع الأوقات.";

const SUPERVISOR_ROLE: &str = "بصفتك المنسق الذكي والمشرف العام لمشروع البناء، دورك جوهري في ضمان سير العمل بكفاءة وأمان.\n\
مسؤولياتك تشمل:\n\
1. تحليل بيانات الموقع اليومية ومطابقتها مع المعايير الهندسية.\n\
2. تحديد المخاطر المحتملة (Safety Hazards) واقتراح إجراءات الوقاية.\n\
3. تتبع تقدم العمل وربط الأنشطة الحالية بالجدول الزمني للمشروع.\n\
4. صياغة تقارير يومية احترافية بلغة عربية هندسية دقيقة.\n\
5. تقديم توصيات لتجاوز المعوقات وتحسين الإنتاجية.\n\
قم بتحليل البيانات التالية بناءً على هذا الدور:";

const SUMMARY_PROMPT: &str = "أنت المنسق الذكي لموقع العمل. قم بتحليل سجلات المحادثة واستخرج قسمين محددين بدقة:\n\
1. 'site_manpower_machinery': قائمة غير مرتبة بتنسيق HTML (<ul><li>...</li></ul>) تتضمن القوى العاملة، المهندسين، والمعدات والآليات المذكورة.\n\
2. 'site_activities': قائمة غير مرتبة بتنسيق HTML (<ul><li>...</li></ul>) تتضمن أنشطة الموقع العامة، تقدم العمل، وأي مشكلات تم الإبلاغ عنها.\n\
يجب أن تكون المخرجات كائن JSON صالح يحتوي على هذين المفتاحين فقط. استخدم لغة عربية مهنية وهندسية.";

const SAFETY_TIP_PROMPT: &str = "You are a Site Safety Manager for a high-rise construction project. \
Provide a single, short, impactful safety advice tip in Arabic for the site workers. \
Focus on either: PPE, working at heights, electrical safety, or crane operations. \
Start with an emoji. Keep it under 30 words.";

/// The photo instruction, extended with the uploader's caption when present.
pub fn photo_instruction(caption: Option<&str>) -> String {
    match caption.map(str::trim).filter(|c| !c.is_empty()) {
        Some(caption) => format!("{} User caption: {}", PHOTO_INSTRUCTION, caption),
        None => PHOTO_INSTRUCTION.to_string(),
    }
}

/// Remove a surrounding Markdown code fence (```` ``` ```` or ```` ```json ````).
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse the summarizer's JSON reply into a [`SiteSummary`].
pub fn parse_site_summary(reply: &str) -> Result<SiteSummary> {
    let summary: SiteSummary = serde_json::from_str(strip_code_fences(reply))
        .with_context(|| "summarizer reply is not the expected JSON object")?;
    Ok(summary)
}

/// Create an analyzer for the configured provider.
///
/// # Errors
///
/// Returns an error for unknown provider names or incomplete provider config.
pub fn create_analyzer(config: &AnalysisConfig, retry: RetryPolicy) -> Result<Box<dyn Analyzer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledAnalyzer)),
        "openai" => Ok(Box::new(OpenAiAnalyzer::new(config, retry)?)),
        other => bail!("Unknown analysis provider: {}", other),
    }
}

// ============ Disabled Analyzer ============

/// Used when `analysis.provider = "disabled"`.
pub struct DisabledAnalyzer;

#[async_trait]
impl Analyzer for DisabledAnalyzer {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn analyze_photo(&self, _instruction: &str, _image_path: &Path) -> Result<String> {
        bail!("analysis provider is disabled")
    }

    async fn summarize_messages(&self, _transcript: &str) -> Result<SiteSummary> {
        bail!("analysis provider is disabled")
    }

    async fn analyze_site(&self, _transcript: &str, _context: &Value) -> Result<String> {
        bail!("analysis provider is disabled")
    }

    async fn safety_tip(&self) -> Result<String> {
        bail!("analysis provider is disabled")
    }
}

// ============ OpenAI-compatible Analyzer ============

pub struct OpenAiAnalyzer {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    retry: RetryPolicy,
}

impl OpenAiAnalyzer {
    /// # Errors
    ///
    /// Returns an error if `model` is not set or no API key can be resolved.
    pub fn new(config: &AnalysisConfig, retry: RetryPolicy) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("analysis.model required for openai provider"))?;
        let api_key = resolve_secret(&config.api_key, &config.api_key_env)
            .ok_or_else(|| anyhow!("{} environment variable not set", config.api_key_env))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            endpoint: format!(
                "{}/chat/completions",
                config.base_url.trim_end_matches('/')
            ),
            model,
            api_key,
            retry,
        })
    }

    /// Send one chat completion request and return the first choice's text.
    async fn complete(&self, messages: Value) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages,
        });

        let reply: Value = self
            .retry
            .call(|| {
                let request = self
                    .http
                    .post(&self.endpoint)
                    .bearer_auth(&self.api_key)
                    .json(&body);
                get_json::<Value>(request)
            })
            .await?;

        let text = parse_completion(&reply)?;
        debug!(model = %self.model, chars = text.len(), "completion received");
        Ok(text)
    }
}

/// Extract `choices[0].message.content` from a chat completion response.
fn parse_completion(reply: &Value) -> Result<String> {
    let content = reply
        .pointer("/choices/0/message/content")
        .ok_or_else(|| anyhow!("Invalid completion response: missing choices[0].message.content"))?;

    match content {
        Value::String(s) => Ok(s.trim().to_string()),
        // some providers return content parts
        Value::Array(parts) => Ok(parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("")
            .trim()
            .to_string()),
        other => Err(anyhow!("Invalid completion content: {}", other)),
    }
}

fn image_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

/// Read an image file into a `data:` URL.
pub async fn image_data_url(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read image: {}", path.display()))?;
    Ok(format!(
        "data:{};base64,{}",
        image_mime(path),
        base64::engine::general_purpose::STANDARD.encode(bytes)
    ))
}

#[async_trait]
impl Analyzer for OpenAiAnalyzer {
    fn name(&self) -> &str {
        &self.model
    }

    async fn analyze_photo(&self, instruction: &str, image_path: &Path) -> Result<String> {
        let data_url = image_data_url(image_path).await?;
        self.complete(json!([{
            "role": "user",
            "content": [
                { "type": "image_url", "image_url": { "url": data_url } },
                { "type": "text", "text": instruction },
            ],
        }]))
        .await
    }

    async fn summarize_messages(&self, transcript: &str) -> Result<SiteSummary> {
        let reply = self
            .complete(json!([
                { "role": "system", "content": SUMMARY_PROMPT },
                { "role": "user", "content": format!("سجلات المحادثة:\n{}", transcript) },
            ]))
            .await?;
        parse_site_summary(&reply)
    }

    async fn analyze_site(&self, transcript: &str, context: &Value) -> Result<String> {
        let mut prompt = String::from(SUPERVISOR_ROLE);
        if let Some(weather) = context.get("weather").filter(|w| !w.is_null()) {
            prompt.push_str(&format!("\nسياق الطقس: {}", weather));
        }
        if let Some(project) = context.get("project").filter(|p| !p.is_null()) {
            prompt.push_str(&format!("\nسياق المشروع: {}", project));
        }
        prompt.push_str(&format!("\nالمدخلات النصية: {}", transcript));

        self.complete(json!([{ "role": "user", "content": prompt }]))
            .await
    }

    async fn safety_tip(&self) -> Result<String> {
        self.complete(json!([{ "role": "user", "content": SAFETY_TIP_PROMPT }]))
            .await
    }
}
