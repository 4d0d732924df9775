mod gemini;

pub use gemini::GeminiBackend;

/// Response bodies containing any of these are treated as quota / rate-limit signals.
const RATE_LIMIT_MARKERS: &[&str] = &[
    "resource_exhausted",
    "rate limit",
    "rate_limit_exceeded",
    "too many requests",
    "quota exceeded",
    "quota_exceeded",
    "exceeded your current quota",
    "insufficient_quota",
];

/// An image ready to be sent to a captioning service.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    /// Image bytes encoded as standard base64.
    pub base64: String,
    pub mime_type: &'static str,
}

impl ImagePayload {
    pub fn from_bytes(bytes: &[u8], mime_type: &'static str) -> Self {
        Self {
            base64: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes),
            mime_type,
        }
    }
}

/// Classified failure of a single remote call.
///
/// Every backend error passes through [`classify_response`] or
/// [`classify_transport`]; retry logic only ever matches on this enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Quota or rate-limit signal tied to the credential that was used.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Network, timeout or server-side failure worth retrying after a delay.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Bad input, permanent auth failure or blocked content. Never retried.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl CallError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Trait for remote captioning services.
///
/// The credential is passed per call so that a single backend instance can be
/// shared by every worker while the [`KeyRotator`](crate::keys::KeyRotator)
/// decides which key each attempt uses.
#[async_trait::async_trait]
pub trait CaptionBackend: Send + Sync {
    /// The display name of this service (e.g. "Gemini").
    fn name(&self) -> &str;
    /// Submit one image with the prompt and return the raw response text.
    async fn generate(
        &self,
        api_key: &str,
        image: &ImagePayload,
        prompt: &str,
    ) -> Result<String, CallError>;
}

/// Classify a non-success HTTP response.
pub fn classify_response(status: u16, body: &str) -> CallError {
    let summary = format!("HTTP {status}: {}", truncate(body, 300));
    match status {
        429 => CallError::RateLimited(summary),
        408 | 500..=599 => CallError::Transient(summary),
        400..=499 if has_rate_limit_marker(body) => CallError::RateLimited(summary),
        _ => CallError::Rejected(summary),
    }
}

/// Classify a transport-level failure (no usable HTTP response).
pub fn classify_transport(err: &reqwest::Error) -> CallError {
    if err.is_builder() {
        CallError::Rejected(format!("invalid request: {err}"))
    } else {
        CallError::Transient(err.to_string())
    }
}

fn has_rate_limit_marker(body: &str) -> bool {
    let lower = body.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Build the fixed prompt asking for structured caption JSON.
pub fn build_prompt() -> String {
    r#"Analyze this image and return a JSON object with the following fields:

{
  "camera": { "angle": "", "shot_type": "" },
  "setting": { "location": "", "environment": "", "time_of_day": "" },
  "objects": { "<object name>": { "count": 1, "description": "" } },
  "activity": { "primary_action": "", "secondary_actions": [] },
  "text_elements": { "scene_text": [] },
  "caption": ""
}

Use "None" for anything that cannot be determined. Only list objects that are present.
"caption" must summarize everything above as one natural, detailed description.

Return ONLY the JSON object, no markdown formatting, no code blocks, no extra text."#
        .to_string()
}

/// Turn raw model output into the text stored on disk.
///
/// Markdown fences and trailing commas are stripped; if the result is a JSON
/// object it is re-emitted pretty-printed, otherwise the trimmed text is kept.
/// Returns `None` for an empty response.
pub fn normalize_caption(text: &str) -> Option<String> {
    let cleaned = text.trim();
    if cleaned.is_empty() {
        return None;
    }

    for candidate in extract_json_candidates(cleaned) {
        for attempt in [candidate.clone(), fix_trailing_commas(&candidate)] {
            if let Ok(value @ serde_json::Value::Object(_)) =
                serde_json::from_str::<serde_json::Value>(&attempt)
            {
                if let Ok(pretty) = serde_json::to_string_pretty(&value) {
                    return Some(pretty);
                }
            }
        }
    }

    log::debug!("Model output is not a JSON object, storing as plain text");
    Some(cleaned.to_string())
}

/// Extract possible JSON object strings from model output.
fn extract_json_candidates(text: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    // ```json ... ``` or ``` ... ```
    if text.contains("```") {
        let stripped = text
            .lines()
            .skip_while(|l| !l.trim().starts_with("```"))
            .skip(1)
            .take_while(|l| !l.trim().starts_with("```"))
            .collect::<Vec<_>>()
            .join("\n");
        if !stripped.is_empty() {
            candidates.push(stripped);
        }
    }

    // Outermost { ... }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            candidates.push(text[start..=end].to_string());
        }
    }

    candidates
}

/// Fix trailing commas in JSON (e.g. {"a": 1,} or ["a",])
fn fix_trailing_commas(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }
        if c == '\\' && in_string {
            result.push(c);
            escape_next = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            result.push(c);
            continue;
        }
        if !in_string && c == ',' {
            let rest = chars.clone().find(|ch| !ch.is_whitespace());
            if matches!(rest, Some('}') | Some(']')) {
                continue;
            }
        }
        result.push(c);
    }
    result
}
