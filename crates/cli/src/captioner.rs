//! Image captioning through an OpenAI-compatible chat completions endpoint.

use anyhow::Context;
use base64::Engine;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use tracing::debug;

use trajectory_serializer_core::{Captioner, Error, Result};

const CAPTION_PROMPT: &str = "Describe this image in one or two sentences, focusing on the \
details a web agent would need to find the item it shows.";

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAiCaptioner {
    client: HttpClient,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiCaptioner {
    /// Build a captioner from `OPENAI_API_KEY`; a missing key is an error.
    pub fn from_env(model: &str, api_base: &str) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY must be set when image captioning is enabled")?;
        let client = HttpClient::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        })
    }
}

fn mime_type(image: &[u8]) -> &'static str {
    if image.starts_with(&[0xff, 0xd8, 0xff]) {
        "image/jpeg"
    } else if image.starts_with(b"GIF8") {
        "image/gif"
    } else if image.len() > 12 && &image[..4] == b"RIFF" && &image[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/png"
    }
}

impl Captioner for OpenAiCaptioner {
    fn caption(&self, image: &[u8]) -> Result<String> {
        let data_url = format!(
            "data:{};base64,{}",
            mime_type(image),
            base64::engine::general_purpose::STANDARD.encode(image)
        );
        let body = json!({
            "model": self.model,
            "max_tokens": 300,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": CAPTION_PROMPT},
                    {"type": "image_url", "image_url": {"url": data_url}},
                ],
            }],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| Error::ExternalCall(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(Error::ExternalCall(format!("{}: {}", status, text)));
        }
        let value: Value = response
            .json()
            .map_err(|e| Error::ExternalCall(e.to_string()))?;
        let caption = value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| Error::ExternalCall("response has no message content".into()))?;
        debug!(bytes = image.len(), "captioned image");
        Ok(caption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_type_sniffing() {
        assert_eq!(mime_type(&[0xff, 0xd8, 0xff, 0xe0]), "image/jpeg");
        assert_eq!(mime_type(b"GIF89a"), "image/gif");
        assert_eq!(mime_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(mime_type(b"\x89PNG\r\n"), "image/png");
    }
}
