//! Shared JSON-over-HTTP plumbing for the provider adapters.
//!
//! Every adapter funnels requests through [`post_json`] so transport
//! failures become [`BrainError::provider`] values with a sanitized message
//! and an `error_type` context entry (`Timeout`, `Connect`, `HttpStatus`,
//! `Decode`, `Request`).

use std::time::Duration;

use second_brain_core::error::BrainError;
use second_brain_core::sanitize::sanitize_message;
use serde_json::Value;

pub fn build_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

pub fn error_type(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "Timeout"
    } else if err.is_connect() {
        "Connect"
    } else if err.is_status() {
        "HttpStatus"
    } else if err.is_decode() {
        "Decode"
    } else {
        "Request"
    }
}

/// Name recorded for a failure: the `error_type` context entry when
/// present, else the error kind.
pub fn failure_type(err: &BrainError) -> String {
    err.context()
        .get("error_type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| err.kind().type_name().to_string())
}

fn transport_error(provider: &str, err: reqwest::Error, secrets: &[&str]) -> BrainError {
    let kind = error_type(&err);
    BrainError::provider(provider, sanitize_message(&err.to_string(), secrets))
        .with_context("error_type", kind)
}

/// POST `body` to `url` and decode the JSON response. Non-2xx statuses are
/// errors carrying the status code and a sanitized body excerpt.
pub async fn post_json(
    provider: &str,
    request: reqwest::RequestBuilder,
    body: &Value,
    secrets: &[&str],
) -> Result<Value, BrainError> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| transport_error(provider, e, secrets))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(BrainError::provider(
            provider,
            sanitize_message(&format!("{} API error {}: {}", provider, status, text), secrets),
        )
        .with_context("error_type", "HttpStatus")
        .with_context("status", status.as_u16()));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| transport_error(provider, e, secrets))
}

/// Float at `key`, accepting numbers and numeric strings.
pub fn number(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Join `base` and `path` with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://api.mem0.ai/", "/v1/x/"), "https://api.mem0.ai/v1/x/");
        assert_eq!(join_url("http://h:1", "api/chat"), "http://h:1/api/chat");
    }

    #[test]
    fn test_number_accepts_strings() {
        let row = json!({"a": 0.5, "b": "0.25", "c": "nope", "d": null});
        assert_eq!(number(&row, "a"), Some(0.5));
        assert_eq!(number(&row, "b"), Some(0.25));
        assert_eq!(number(&row, "c"), None);
        assert_eq!(number(&row, "d"), None);
        assert_eq!(number(&row, "missing"), None);
    }

    #[test]
    fn test_failure_type_prefers_context() {
        let err = BrainError::provider("mem0", "x").with_context("error_type", "Timeout");
        assert_eq!(failure_type(&err), "Timeout");
        assert_eq!(failure_type(&BrainError::provider("mem0", "x")), "ProviderError");
    }
}
