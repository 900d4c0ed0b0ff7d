//! JSON-RPC 2.0 over HTTP.

use crate::abi;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use ticketchain_core::{LedgerError, U256, Wei};
use url::Url;

/// Node error code for a request the wallet holder declined (EIP-1193).
pub const USER_REJECTED_CODE: i64 = 4001;

/// Node error code for execution reverted (geth, Hardhat).
pub const EXECUTION_REVERTED_CODE: i64 = 3;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// The `error` member of a JSON-RPC response.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RpcErrorObject {
    /// Error code
    pub code: i64,
    /// Message text
    pub message: String,
    /// Optional payload; often carries revert data
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    /// Map the node's error onto the ledger taxonomy.
    #[must_use]
    pub fn classify(&self) -> LedgerError {
        let message = self.message.to_lowercase();

        if self.code == USER_REJECTED_CODE
            || message.contains("user denied")
            || message.contains("user rejected")
        {
            return LedgerError::UserRejected;
        }
        if message.contains("insufficient funds") {
            return LedgerError::InsufficientFunds;
        }

        let decoded = self.data.as_ref().and_then(revert_from_data);
        if self.code == EXECUTION_REVERTED_CODE || message.contains("revert") || decoded.is_some() {
            let reason = decoded
                .or_else(|| revert_from_message(&self.message))
                .unwrap_or_else(|| self.message.clone());
            return LedgerError::Revert { reason };
        }

        LedgerError::Rpc(format!("{}: {}", self.code, self.message))
    }
}

/// Find revert data in the many shapes nodes use for `error.data`.
///
/// geth puts the hex string directly in `data`, Hardhat nests it under
/// `data.data`, Ganache keys a `{ reason, return }` object by transaction hash.
fn revert_from_data(data: &Value) -> Option<String> {
    match data {
        Value::String(hex) if hex.starts_with("0x") => {
            abi::from_hex(hex).ok().and_then(|bytes| abi::decode_revert(&bytes))
        },
        Value::Object(map) => {
            if let Some(Value::String(reason)) = map.get("reason") {
                return Some(reason.clone());
            }
            ["data", "return", "result"]
                .iter()
                .filter_map(|key| map.get(*key))
                .chain(map.values())
                .find_map(revert_from_data)
        },
        _ => None,
    }
}

fn revert_from_message(message: &str) -> Option<String> {
    let lower = message.to_lowercase();
    for marker in ["execution reverted:", "reverted with reason string", "revert "] {
        if let Some(at) = lower.find(marker) {
            let Some(tail) = message.get(at + marker.len()..) else {
                continue;
            };
            let rest = tail
                .trim()
                .trim_matches(|c| c == '\'' || c == '"')
                .trim();
            if !rest.is_empty() {
                return Some(rest.to_string());
            }
        }
    }
    None
}

/// JSON-RPC client bound to one endpoint.
#[derive(Debug)]
pub struct RpcTransport {
    client: reqwest::Client,
    endpoint: Url,
    next_id: AtomicU64,
}

impl RpcTransport {
    /// Create a transport whose every request is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Rpc`] if the HTTP client cannot be built.
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            next_id: AtomicU64::new(1),
        })
    }

    /// The endpoint this transport talks to.
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Issue `method` with `params` and decode the result.
    ///
    /// A `null` result decodes into `Option<T>` as `None`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Rpc`] for transport failures, timeouts, non-2xx statuses and
    /// malformed envelopes; node error objects are classified by
    /// [`RpcErrorObject::classify`]; [`LedgerError::Decode`] when the result does not
    /// match `T`.
    #[tracing::instrument(skip(self, params), fields(endpoint = %self.endpoint))]
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let started = Instant::now();

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                metrics::counter!("rpc.requests.failed", "method" => method.to_string())
                    .increment(1);
                if e.is_timeout() {
                    LedgerError::Rpc(format!("{method} timed out"))
                } else {
                    LedgerError::Rpc(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            metrics::counter!("rpc.requests.failed", "method" => method.to_string()).increment(1);
            return Err(LedgerError::Rpc(format!("HTTP {}: {text}", status.as_u16())));
        }

        let envelope: RpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Rpc(format!("malformed response: {e}")))?;

        metrics::histogram!("rpc.request.duration_ms", "method" => method.to_string())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        if let Some(error) = envelope.error {
            tracing::debug!(code = error.code, message = %error.message, "Node returned error");
            return Err(error.classify());
        }

        serde_json::from_value(envelope.result.unwrap_or(Value::Null))
            .map_err(|e| LedgerError::Decode(format!("{method}: {e}")))
    }
}

/// Render a `u64` as a JSON-RPC quantity.
#[must_use]
pub fn quantity(value: u64) -> String {
    format!("{value:#x}")
}

/// Render an amount as a JSON-RPC quantity.
#[must_use]
pub fn wei_quantity(value: Wei) -> String {
    format!("{:#x}", value.0)
}

/// Parse a JSON-RPC quantity into a `u64`.
///
/// # Errors
///
/// Returns [`LedgerError::Decode`] for malformed or oversized quantities.
pub fn parse_quantity(value: &str) -> Result<u64, LedgerError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| LedgerError::Decode(format!("quantity without 0x prefix: {value}")))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16).map_err(|e| LedgerError::Decode(format!("{value}: {e}")))
}

/// Parse a JSON-RPC quantity into a 256-bit value.
///
/// # Errors
///
/// Returns [`LedgerError::Decode`] for malformed quantities.
pub fn parse_u256(value: &str) -> Result<U256, LedgerError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(digits, 16).map_err(|e| LedgerError::Decode(format!("{value}: {e:?}")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    fn error(code: i64, message: &str, data: Option<Value>) -> RpcErrorObject {
        RpcErrorObject {
            code,
            message: message.to_string(),
            data,
        }
    }

    #[test]
    fn classifies_wallet_rejections() {
        assert_eq!(
            error(4001, "MetaMask Tx Signature: User denied transaction signature.", None).classify(),
            LedgerError::UserRejected
        );
        assert_eq!(
            error(-32000, "user rejected the request", None).classify(),
            LedgerError::UserRejected
        );
    }

    #[test]
    fn classifies_insufficient_funds() {
        assert_eq!(
            error(-32000, "insufficient funds for gas * price + value", None).classify(),
            LedgerError::InsufficientFunds
        );
    }

    #[test]
    fn decodes_revert_reason_from_data() {
        let mut data = abi::ERROR_STRING_SELECTOR.to_vec();
        data.extend(abi::encode(&[abi::Token::String("Not owner".into())]));
        let err = error(3, "execution reverted", Some(json!(abi::to_hex(&data))));
        assert_eq!(err.classify(), LedgerError::Revert { reason: "Not owner".into() });
    }

    #[test]
    fn decodes_ganache_reason_object() {
        let err = error(
            -32000,
            "VM Exception while processing transaction: revert Ticket already listed",
            Some(json!({
                "0xabc": { "error": "revert", "reason": "Ticket already listed" }
            })),
        );
        assert_eq!(
            err.classify(),
            LedgerError::Revert { reason: "Ticket already listed".into() }
        );
    }

    #[test]
    fn falls_back_to_message_text() {
        let err = error(-32000, "execution reverted: Price exceeds max resale value", None);
        assert_eq!(
            err.classify(),
            LedgerError::Revert { reason: "Price exceeds max resale value".into() }
        );
    }

    #[test]
    fn other_errors_are_transport_failures() {
        let err = error(-32601, "method not found", None).classify();
        assert!(err.is_retryable());
        assert_eq!(err, LedgerError::Rpc("-32601: method not found".into()));
    }

    #[test]
    fn quantities() {
        assert_eq!(quantity(0), "0x0");
        assert_eq!(quantity(255), "0xff");
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert!(parse_quantity("26").is_err());
        assert_eq!(wei_quantity(Wei::from(1_000_000_000_000_000_000u64)), "0xde0b6b3a7640000");
        assert_eq!(parse_u256("0xde0b6b3a7640000").unwrap(), U256::from(1_000_000_000_000_000_000u64));
    }
}
