use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

use super::{CallError, CaptionBackend, ImagePayload, classify_response, classify_transport};

pub struct GeminiBackend {
    endpoint: String,
    model: String,
    max_output_tokens: u32,
    client: Client,
}

impl GeminiBackend {
    pub fn new(endpoint: String, model: String, max_output_tokens: u32, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Failed to build HTTP client with timeout ({e}), using defaults");
                Client::new()
            });
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model,
            max_output_tokens,
            client,
        }
    }

    fn request_body(&self, image: &ImagePayload, prompt: &str) -> Value {
        let safety_settings: Vec<Value> = [
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .iter()
        .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
        .collect();

        json!({
            "contents": [
                {
                    "parts": [
                        { "text": prompt },
                        {
                            "inline_data": {
                                "mime_type": image.mime_type,
                                "data": image.base64
                            }
                        }
                    ]
                }
            ],
            "safetySettings": safety_settings,
            "generationConfig": {
                "maxOutputTokens": self.max_output_tokens
            }
        })
    }
}

#[async_trait::async_trait]
impl CaptionBackend for GeminiBackend {
    fn name(&self) -> &str {
        "Gemini"
    }

    async fn generate(
        &self,
        api_key: &str,
        image: &ImagePayload,
        prompt: &str,
    ) -> Result<String, CallError> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&self.request_body(image, prompt))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| classify_transport(&e))?;

        if !status.is_success() {
            return Err(classify_response(status.as_u16(), &text));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| CallError::Transient(format!("unreadable Gemini response: {e}")))?;

        extract_text(&json)
    }
}

/// Pull the generated text out of a `generateContent` response.
fn extract_text(json: &Value) -> Result<String, CallError> {
    if let Some(reason) = json["promptFeedback"]["blockReason"].as_str() {
        return Err(CallError::Rejected(format!("prompt blocked: {reason}")));
    }

    let candidate = json["candidates"]
        .get(0)
        .ok_or_else(|| CallError::Rejected("no candidates returned".to_string()))?;

    match candidate["finishReason"].as_str() {
        None | Some("STOP") => {}
        Some(reason) => {
            return Err(CallError::Rejected(format!("generation stopped: {reason}")));
        }
    }

    let text: String = candidate["content"]["parts"]
        .as_array()
        .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(CallError::Rejected("no content parts in response".to_string()));
    }
    Ok(text)
}
