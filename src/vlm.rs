//! Vision-Language-Model client over the Ollama generate endpoint.
//!
//! Sends `{model, prompt, images: [base64], stream: false}` to
//! `POST {OLLAMA_HOST}/api/generate` and reads `{response}`. Used by the
//! image processor (description + OCR) and the PDF fallback (full page
//! transcription). Every call carries a deadline supplied by the caller.

use std::path::Path;
use std::time::Duration;

use base64::Engine;

use crate::error::{Error, Result};

/// Prompt for image documents: description plus any embedded text.
const DESCRIBE_PROMPT: &str = "Describe this image in detail. \
    Include any text visible in the image. \
    Focus on the main content and any important details.";

/// OCR-only prompt; the sentinel keeps empty pages distinguishable.
const OCR_PROMPT: &str = "Extract all text visible in this image. \
    Return only the text content, without any descriptions. \
    If there is no text, return 'NO TEXT FOUND'.";

/// Prompt for image-only PDF pages: transcription plus structure.
const PAGE_PROMPT: &str = "Transcribe the full text of this document page. \
    Preserve reading order. After the transcription, briefly describe any \
    figures, tables, or diagrams on the page.";

pub struct VlmClient {
    client: reqwest::Client,
    host: String,
    model: String,
}

impl VlmClient {
    pub fn new(host: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Other(e.to_string()))?;
        Ok(Self {
            client,
            host: host.to_string(),
            model: model.to_string(),
        })
    }

    /// Describe an image, including any visible text.
    pub async fn describe_image(&self, image_path: &Path) -> Result<String> {
        let image = encode_image(image_path)?;
        self.generate(DESCRIBE_PROMPT, &image).await
    }

    /// OCR an image. Returns an empty string when the model reports no
    /// text.
    pub async fn extract_text(&self, image_path: &Path) -> Result<String> {
        let image = encode_image(image_path)?;
        let text = self.generate(OCR_PROMPT, &image).await?;
        if text.to_uppercase().contains("NO TEXT FOUND") {
            return Ok(String::new());
        }
        Ok(text)
    }

    /// Transcribe a rendered PDF page.
    pub async fn transcribe_page(&self, image_path: &Path) -> Result<String> {
        let image = encode_image(image_path)?;
        self.generate(PAGE_PROMPT, &image).await
    }

    async fn generate(&self, prompt: &str, image_b64: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "images": [image_b64],
            "stream": false,
        });

        let resp = self
            .client
            .post(format!("{}/api/generate", self.host))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::ModelTimeout { seconds: 60 }
                } else {
                    Error::ModelUnavailable {
                        host: self.host.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::ModelUnavailable {
                host: self.host.clone(),
                message: format!("{status}: {message}"),
            });
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Other(format!("bad VLM response: {e}")))?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| Error::Other("VLM response missing 'response'".into()))
    }
}

fn encode_image(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}
