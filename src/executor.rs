//! Test execution (C8, §4.5).
//!
//! Replays one [`Step`]'s calls sequentially against an
//! [`EngineApiClient`], producing a [`StepRecord`] whose aggregate matches
//! §8's invariant (`msg_count = success + fail`,
//! `time_total_ns = Σ call.end_ns − call.start_ns`).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{
    engine_api::EngineApiClient,
    model::{CallRecord, CallStatus, Step, StepAggregate, StepRecord},
};

/// Replays Engine-API call sequences and times them.
pub struct TestExecutor<'a> {
    client: &'a EngineApiClient,
}

impl<'a> TestExecutor<'a> {
    /// Builds an executor driving calls through `client`.
    #[must_use]
    pub fn new(client: &'a EngineApiClient) -> Self {
        Self { client }
    }

    /// Runs every call in `step` sequentially and returns the resulting
    /// record. Never returns `Err` for individual call failures — those are
    /// recorded as [`CallStatus::Fail`] entries (§4.5 "the test is not
    /// aborted").
    pub async fn run_step(&self, step: &Step) -> StepRecord {
        let mut calls = Vec::with_capacity(step.calls.len());
        let mut aggregate = StepAggregate::default();

        for call in &step.calls {
            let start = now_ns();
            let outcome = self.client.call(&call.method, &call.params).await;
            let end = now_ns();

            aggregate.time_total_ns += end.saturating_sub(start);
            aggregate.msg_count += 1;

            let record = match outcome {
                Ok(outcome) => {
                    let status = if is_valid_status(&outcome.result) {
                        CallStatus::Success
                    } else {
                        CallStatus::Fail
                    };
                    if status == CallStatus::Fail {
                        aggregate.fail += 1;
                    } else if let Some(gas_used) = outcome.gas_used {
                        aggregate.gas_used_total += gas_used;
                        aggregate.gas_used_time_total_ns += end.saturating_sub(start);
                    }
                    CallRecord {
                        method: call.method.clone(),
                        start_ns: start,
                        end_ns: end,
                        status,
                        error: None,
                        gas_used: outcome.gas_used,
                    }
                }
                Err(err) => {
                    aggregate.fail += 1;
                    CallRecord {
                        method: call.method.clone(),
                        start_ns: start,
                        end_ns: end,
                        status: CallStatus::Fail,
                        error: Some(err.to_string()),
                        gas_used: None,
                    }
                }
            };
            calls.push(record);
        }

        StepRecord {
            aggregated: aggregate,
            calls,
        }
    }

    /// Issues `call` with `timeout`, ignoring the result beyond logging —
    /// used for best-effort post-test RPC calls (§4.4 step 10).
    pub async fn run_best_effort(
        &self,
        method: &str,
        params: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Option<serde_json::Value> {
        let timeout = timeout.unwrap_or(Duration::from_secs(30));
        match self.client.call_with_timeout(method, params, timeout).await {
            Ok(outcome) => Some(outcome.result),
            Err(err) => {
                log::warn!("best-effort call {method} failed: {err:#}");
                None
            }
        }
    }
}

/// `engine_newPayload*`/`engine_forkchoiceUpdated*` responses carry a
/// top-level or nested `status` field; anything other than `VALID` (after
/// SYNCING retries are exhausted by [`EngineApiClient`]) counts as a
/// failure. Non-engine methods (no `status` field at all) are treated as
/// successful whenever the call itself didn't error.
fn is_valid_status(result: &serde_json::Value) -> bool {
    match result.get("status").and_then(serde_json::Value::as_str) {
        Some(status) => status == "VALID",
        None => match result.get("payloadStatus").and_then(|p| p.get("status")).and_then(serde_json::Value::as_str) {
            Some(status) => status == "VALID",
            None => true,
        },
    }
}

fn now_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_engine_response_without_status_is_success() {
        assert!(is_valid_status(&serde_json::json!("0x10")));
    }

    #[test]
    fn engine_valid_status_is_success() {
        assert!(is_valid_status(&serde_json::json!({"status": "VALID"})));
    }

    #[test]
    fn engine_invalid_status_is_failure() {
        assert!(!is_valid_status(&serde_json::json!({"status": "INVALID"})));
    }

    #[test]
    fn nested_payload_status_is_read() {
        assert!(is_valid_status(
            &serde_json::json!({"payloadStatus": {"status": "VALID"}})
        ));
    }
}
