use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use crate::provider::{ModelProvider, ProviderError};

/// Client for any endpoint speaking the OpenAI chat-completions wire format
/// (Groq, OpenAI, most local servers).
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl Drop for OpenAiCompatibleProvider {
    fn drop(&mut self) {
        self.api_key.zeroize();
    }
}

/// Validate the base URL before any credential is attached to a request.
/// HTTPS is required for remote hosts; plain HTTP is tolerated only for
/// localhost (local inference servers).
fn validate_base_url(base_url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(base_url)
        .map_err(|e| format!("Invalid base_url '{}': {}", base_url, e))?;

    let host = parsed.host_str().unwrap_or("");
    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let is_localhost =
                host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1";
            if is_localhost {
                warn!(
                    "Using unencrypted HTTP for local endpoint '{}'; the API key travels in cleartext",
                    base_url
                );
                Ok(())
            } else {
                Err(format!(
                    "HTTP is not allowed for remote base_url '{}'; use HTTPS",
                    base_url
                ))
            }
        }
        other => Err(format!(
            "Unsupported URL scheme '{}' in base_url '{}'",
            other, base_url
        )),
    }
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, String> {
        validate_base_url(base_url)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    async fn complete(
        &self,
        model: &str,
        messages: &[Value],
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
        });

        let url = format!("{}/chat/completions", self.base_url);
        info!(model, url = %url, messages = messages.len(), "Calling completion API");

        let resp = match self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("HTTP request failed: {}", e);
                return Err(ProviderError::network(&e));
            }
        };

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::network(&e))?;

        if !status.is_success() {
            error!(status = %status, "Completion API error: {}", truncate_for_log(&text));
            return Err(ProviderError::from_status(status.as_u16(), &text));
        }

        debug!("Completion response: {}", truncate_for_log(&text));

        let data: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::malformed(format!("response is not JSON: {}", e)))?;

        data["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderError::malformed("no message content in response"))
    }
}

/// Truncate for debug logging, respecting UTF-8 char boundaries.
fn truncate_for_log(text: &str) -> &str {
    if text.len() <= 2000 {
        return text;
    }
    let mut end = 2000;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_accepted() {
        assert!(validate_base_url("https://api.groq.com/openai/v1").is_ok());
    }

    #[test]
    fn http_localhost_accepted() {
        assert!(validate_base_url("http://localhost:8080").is_ok());
        assert!(validate_base_url("http://127.0.0.1:1234").is_ok());
        assert!(validate_base_url("http://[::1]:8080").is_ok());
    }

    #[test]
    fn http_remote_rejected() {
        let err = validate_base_url("http://api.example.com").unwrap_err();
        assert!(err.contains("HTTP is not allowed"), "got: {}", err);
    }

    #[test]
    fn other_schemes_rejected() {
        let err = validate_base_url("ftp://example.com").unwrap_err();
        assert!(err.contains("Unsupported URL scheme"), "got: {}", err);
    }

    #[test]
    fn trailing_slash_trimmed() {
        let provider = OpenAiCompatibleProvider::new("https://api.groq.com/openai/v1/", "k")
            .expect("provider should build");
        assert!(!provider.base_url.ends_with('/'));
    }
}
