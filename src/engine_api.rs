//! JWT-authenticated Engine API JSON-RPC client (§4.5, §6 "Engine API
//! dialect").
//!
//! The JWT is re-minted per call group rather than cached across the whole
//! run, so the recommended ~60 s validity window (claims: `{iat}` only,
//! HS256) never goes stale mid-run even on a long-running instance.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineApiError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const SYNCING_RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Serialize)]
struct JwtClaims {
    iat: u64,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Outcome of one JSON-RPC call, after any SYNCING retries.
#[derive(Clone, Debug)]
pub struct CallOutcome {
    /// The raw JSON-RPC result, on success.
    pub result: Value,
    /// `gasUsed` extracted from the result, if present (only meaningful for
    /// `engine_newPayload*` methods).
    pub gas_used: Option<u64>,
}

/// A JWT-authenticated client for one instance's Engine API endpoint.
pub struct EngineApiClient {
    http: reqwest::Client,
    endpoint: String,
    jwt_secret: Vec<u8>,
    next_id: std::sync::atomic::AtomicU64,
    max_syncing_retries: u32,
}

impl EngineApiClient {
    /// Builds a client for `endpoint`, authenticating with `jwt_secret`
    /// (the raw secret bytes, as read from the client's jwtsecret file).
    #[must_use]
    pub fn new(endpoint: String, jwt_secret: Vec<u8>, max_syncing_retries: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            jwt_secret,
            next_id: std::sync::atomic::AtomicU64::new(1),
            max_syncing_retries,
        }
    }

    fn mint_jwt(&self) -> Result<String, EngineApiError> {
        let iat = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let key = jsonwebtoken::EncodingKey::from_secret(&self.jwt_secret);
        Ok(jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &JwtClaims { iat },
            &key,
        )?)
    }

    /// Issues one JSON-RPC call, retrying while the response indicates
    /// `{status: "SYNCING"}` up to `max_syncing_retries` times with linear
    /// backoff (§4.5).
    pub async fn call(&self, method: &str, params: &Value) -> Result<CallOutcome, EngineApiError> {
        self.call_with_timeout(method, params, DEFAULT_TIMEOUT).await
    }

    /// As [`call`](Self::call), with an explicit per-call timeout.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<CallOutcome, EngineApiError> {
        let mut attempt = 0;
        loop {
            let result = self.call_once(method, params, timeout).await?;
            if is_syncing(&result.result) && attempt < self.max_syncing_retries {
                attempt += 1;
                log::debug!("{method} reported SYNCING, retry {attempt}/{}", self.max_syncing_retries);
                tokio::time::sleep(SYNCING_RETRY_BACKOFF * attempt).await;
                continue;
            }
            if is_syncing(&result.result) {
                return Err(EngineApiError::Malformed(format!(
                    "{method} still SYNCING after {attempt} retries"
                )));
            }
            return Ok(result);
        }
    }

    async fn call_once(&self, method: &str, params: &Value, timeout: Duration) -> Result<CallOutcome, EngineApiError> {
        let jwt = self.mint_jwt()?;
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        log::trace!("-> {method} {params}");
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(jwt)
            .timeout(timeout)
            .json(&request)
            .send()
            .await?
            .json::<JsonRpcResponse>()
            .await?;

        if let Some(error) = response.error {
            return Err(EngineApiError::RpcError {
                code: error.code,
                message: error.message,
            });
        }
        let result = response
            .result
            .ok_or_else(|| EngineApiError::Malformed("response had neither `result` nor `error`".to_string()))?;
        log::trace!("<- {method} {result}");

        let gas_used = result
            .get("gasUsed")
            .or_else(|| result.get("gas_used"))
            .and_then(Value::as_str)
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok());

        Ok(CallOutcome { result, gas_used })
    }
}

fn is_syncing(result: &Value) -> bool {
    result.get("status").and_then(Value::as_str) == Some("SYNCING")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_syncing_status() {
        assert!(is_syncing(&serde_json::json!({"status": "SYNCING"})));
        assert!(!is_syncing(&serde_json::json!({"status": "VALID"})));
        assert!(!is_syncing(&serde_json::json!(null)));
    }
}
