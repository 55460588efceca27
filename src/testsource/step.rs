//! Step-file parsing: one JSON-RPC call per non-blank, non-comment line
//! (§4.5 "Parses each step file line-by-line").

use std::path::Path;

use crate::{
    error::TestSourceError,
    model::{RpcCall, Step},
};

/// Parses a step file into an ordered [`Step`].
///
/// Blank lines and lines starting with `#` are skipped. Every other line
/// must be a JSON object with `method` and `params` fields.
pub fn parse_step_file(path: &Path) -> Result<Step, TestSourceError> {
    let contents = std::fs::read_to_string(path)?;
    parse_step_str(&contents).map_err(|reason| TestSourceError::MalformedStepFile {
        path: path.display().to_string(),
        reason,
    })
}

fn parse_step_str(contents: &str) -> Result<Step, String> {
    let mut calls = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|err| format!("line {}: invalid JSON: {err}", line_no + 1))?;
        let method = value
            .get("method")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| format!("line {}: missing `method`", line_no + 1))?
            .to_string();
        let params = value
            .get("params")
            .cloned()
            .unwrap_or(serde_json::Value::Array(Vec::new()));
        calls.push(RpcCall { method, params });
    }
    Ok(Step { calls })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_calls_and_skips_comments_and_blanks() {
        let contents = "\
# a comment
{\"method\": \"eth_blockNumber\", \"params\": []}

{\"method\": \"engine_newPayloadV3\", \"params\": [{\"foo\": 1}]}
";
        let step = parse_step_str(contents).unwrap();
        assert_eq!(step.calls.len(), 2);
        assert_eq!(step.calls[0].method, "eth_blockNumber");
        assert_eq!(step.calls[1].method, "engine_newPayloadV3");
    }

    #[test]
    fn rejects_line_missing_method() {
        let err = parse_step_str("{\"params\": []}\n").unwrap_err();
        assert!(err.contains("missing `method`"));
    }

    #[test]
    fn defaults_missing_params_to_empty_array() {
        let step = parse_step_str("{\"method\": \"eth_blockNumber\"}\n").unwrap();
        assert_eq!(step.calls[0].params, serde_json::Value::Array(Vec::new()));
    }
}
