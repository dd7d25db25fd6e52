//! LLM completion capability.
//!
//! Synthesis treats the LLM as an opaque oracle: `complete(prompt, cancel)
//! -> text`. The production client speaks a Messages-style HTTP API keyed
//! by `ANTHROPIC_API_KEY`; tests substitute a canned implementation.
//! Responses that must be JSON are parsed defensively by locating the
//! first balanced `{...}` block in the text.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const MESSAGES_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const MAX_COMPLETION_TOKENS: u32 = 1024;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a prompt, honoring the cancellation signal.
    async fn complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<String>;

    /// Identifier of the model answering completions.
    fn model(&self) -> &str;
}

/// HTTP client for a Messages-style completion API.
pub struct HttpLlmClient {
    http: reqwest::Client,
    model: String,
}

impl HttpLlmClient {
    pub fn new(model: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Llm(format!("http client: {}", e)))?;
        Ok(Self { http, model })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| Error::Llm("ANTHROPIC_API_KEY not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "messages": [{"role": "user", "content": prompt}],
        });

        let request = self
            .http
            .post(MESSAGES_ENDPOINT)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            resp = request => resp.map_err(|e| Error::Llm(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Llm(format!("completion API returned {}", status)));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        let text = json
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find_map(|b| b.get("text").and_then(|t| t.as_str()))
            })
            .ok_or_else(|| Error::Llm("completion response had no text block".to_string()))?;

        Ok(text.to_string())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Locate and parse the first balanced `{...}` block in a completion.
///
/// Models wrap JSON in prose or code fences often enough that strict
/// whole-string parsing is a losing game; this scans for the first
/// brace-balanced block that parses.
pub fn parse_first_json_block(text: &str) -> Option<serde_json::Value> {
    let bytes = text.as_bytes();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if start.is_some() => in_string = true,
            b'{' => {
                if start.is_none() {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if let Some(s) = start {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[s..=i];
                        if let Ok(value) = serde_json::from_str(candidate) {
                            return Some(value);
                        }
                        start = None;
                    }
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_plain_json() {
        let value = parse_first_json_block(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn finds_json_in_prose_and_fences() {
        let text = "Sure! Here's the analysis:\n```json\n{\"contradiction\": true, \"severity\": \"high\"}\n```\nLet me know.";
        let value = parse_first_json_block(text).unwrap();
        assert_eq!(value["contradiction"], true);
        assert_eq!(value["severity"], "high");
    }

    #[test]
    fn handles_nested_objects_and_braces_in_strings() {
        let text = r#"prefix {"outer": {"inner": "has } brace"}, "n": 2} suffix"#;
        let value = parse_first_json_block(text).unwrap();
        assert_eq!(value["outer"]["inner"], "has } brace");
        assert_eq!(value["n"], 2);
    }

    #[test]
    fn no_json_returns_none() {
        assert!(parse_first_json_block("no objects here").is_none());
        assert!(parse_first_json_block("broken { not json").is_none());
    }
}
