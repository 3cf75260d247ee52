use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use in3_node_types::{AccountProof, Address, B256, BlockHeader, Bytes, Log, U64, U256};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PROOF_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RPC_RETRY_BACKOFF_MS: u64 = 250;
const MAX_RETRY_BACKOFF_MS: u128 = 5_000;
const MAX_UPSTREAM_RPC_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRetryConfig {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RpcRetryConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_PROOF_RETRY_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_RPC_RETRY_BACKOFF_MS),
        }
    }
}

impl RpcRetryConfig {
    /// Delay before retry number `attempt` (0-based): doubles per attempt, capped at 5s.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1_u128 << attempt.min(20);
        let base_ms = self.base_backoff.as_millis();
        let backoff_ms = base_ms.saturating_mul(factor).min(MAX_RETRY_BACKOFF_MS);
        Duration::from_millis(backoff_ms as u64)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("RPC {method} request failed: {message}")]
    Transport { method: String, message: String },
    #[error("RPC {method} returned HTTP {status}: {body}")]
    Http {
        method: String,
        status: u16,
        body: String,
    },
    /// The node answered with a JSON-RPC error object, e.g. an `eth_call` revert.
    #[error("RPC {method} error {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("RPC {method} invalid response: {message}")]
    InvalidResponse { method: String, message: String },
}

impl UpstreamError {
    /// Whether the remote executed the request and refused it, as opposed to not being reached.
    pub fn is_rejection(&self) -> bool {
        matches!(self, UpstreamError::Rpc { .. })
    }
}

pub type UpstreamFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, UpstreamError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub to: Address,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
    /// Accepted values for topic0; empty matches any.
    pub topic0: Vec<B256>,
}

/// Reads and writes against the upstream chain node.
pub trait ChainSource: Send + Sync {
    fn block_number(&self) -> UpstreamFuture<'_, u64>;
    fn block_by_number(&self, number: u64) -> UpstreamFuture<'_, Option<BlockHeader>>;
    /// `block` of `None` executes against the latest block.
    fn call(&self, request: CallRequest, block: Option<u64>) -> UpstreamFuture<'_, Bytes>;
    /// One result per request, in request order; a failed entry does not fail the batch.
    fn call_batch(
        &self,
        requests: Vec<CallRequest>,
        block: Option<u64>,
    ) -> UpstreamFuture<'_, Vec<Result<Bytes, UpstreamError>>>;
    fn logs(&self, filter: LogFilter) -> UpstreamFuture<'_, Vec<Log>>;
    fn proof(
        &self,
        address: Address,
        keys: Vec<U256>,
        block: u64,
    ) -> UpstreamFuture<'_, AccountProof>;
    fn chain_id(&self) -> UpstreamFuture<'_, u64>;
    fn gas_price(&self) -> UpstreamFuture<'_, U256>;
    fn transaction_count(&self, address: Address) -> UpstreamFuture<'_, u64>;
    fn send_raw_transaction(&self, raw: Bytes) -> UpstreamFuture<'_, B256>;
}

#[derive(Debug, Clone)]
pub struct UpstreamRpcClient {
    http: reqwest::Client,
    rpc_url: String,
}

impl UpstreamRpcClient {
    pub fn new(rpc_url: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| UpstreamError::Transport {
                method: "client".to_string(),
                message: format!("failed to build HTTP client: {error}"),
            })?;
        Ok(Self {
            http,
            rpc_url: rpc_url.into(),
        })
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, UpstreamError> {
        let result = self.request(method, params).await?;
        decode_result(method, result)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        let body = self
            .post(
                method,
                &json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": method,
                    "params": params,
                }),
            )
            .await?;
        extract_result(method, &body)
    }

    async fn post(&self, method: &str, payload: &Value) -> Result<Value, UpstreamError> {
        let mut response = self
            .http
            .post(&self.rpc_url)
            .json(payload)
            .send()
            .await
            .map_err(|error| UpstreamError::Transport {
                method: method.to_string(),
                message: error.to_string(),
            })?;
        let http_status = response.status();
        let content_length = response.content_length();
        let body = read_json_body_with_limit(
            &mut response,
            content_length,
            MAX_UPSTREAM_RPC_RESPONSE_BYTES,
            method,
        )
        .await?;

        if !http_status.is_success() {
            return Err(UpstreamError::Http {
                method: method.to_string(),
                status: http_status.as_u16(),
                body: body.to_string(),
            });
        }
        Ok(body)
    }

    async fn fetch_call_batch(
        &self,
        requests: Vec<CallRequest>,
        block: Option<u64>,
    ) -> Result<Vec<Result<Bytes, UpstreamError>>, UpstreamError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let tag = block_tag(block);
        let payload: Vec<Value> = requests
            .iter()
            .enumerate()
            .map(|(id, request)| {
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": "eth_call",
                    "params": [{ "to": request.to, "data": request.data }, tag],
                })
            })
            .collect();
        let body = self.post("eth_call", &Value::Array(payload)).await?;
        let responses = body.as_array().ok_or_else(|| UpstreamError::InvalidResponse {
            method: "eth_call".to_string(),
            message: format!("batch response is not an array: {body}"),
        })?;

        let mut results: Vec<Result<Bytes, UpstreamError>> = (0..requests.len())
            .map(|_| {
                Err(UpstreamError::InvalidResponse {
                    method: "eth_call".to_string(),
                    message: "missing from batch response".to_string(),
                })
            })
            .collect();
        for response in responses {
            let Some(id) = response
                .get("id")
                .and_then(Value::as_u64)
                .and_then(|id| usize::try_from(id).ok())
                .filter(|id| *id < results.len())
            else {
                continue;
            };
            results[id] = extract_result("eth_call", response)
                .and_then(|value| decode_result::<Bytes>("eth_call", value));
        }
        Ok(results)
    }
}

fn block_tag(block: Option<u64>) -> Value {
    match block {
        Some(number) => json!(U64::from(number)),
        None => json!("latest"),
    }
}

fn extract_result(method: &str, body: &Value) -> Result<Value, UpstreamError> {
    if let Some(error) = body.get("error") {
        return Err(UpstreamError::Rpc {
            method: method.to_string(),
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        });
    }
    body.get("result")
        .cloned()
        .ok_or_else(|| UpstreamError::InvalidResponse {
            method: method.to_string(),
            message: format!("response missing `result`: {body}"),
        })
}

fn decode_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, UpstreamError> {
    serde_json::from_value(value).map_err(|error| UpstreamError::InvalidResponse {
        method: method.to_string(),
        message: error.to_string(),
    })
}

async fn read_json_body_with_limit(
    response: &mut reqwest::Response,
    content_length: Option<u64>,
    max_bytes: usize,
    method: &str,
) -> Result<Value, UpstreamError> {
    let invalid = |message: String| UpstreamError::InvalidResponse {
        method: method.to_string(),
        message,
    };
    if let Some(length) = content_length
        && length > max_bytes as u64
    {
        return Err(invalid(format!(
            "response too large: content-length={length} exceeds {max_bytes} bytes"
        )));
    }
    let mut buffer = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|error| UpstreamError::Transport {
            method: method.to_string(),
            message: format!("failed reading response chunk: {error}"),
        })?
    {
        append_limited_chunk(&mut buffer, &chunk, max_bytes).map_err(invalid)?;
    }
    serde_json::from_slice(&buffer).map_err(|error| invalid(format!("invalid JSON: {error}")))
}

fn append_limited_chunk(buffer: &mut Vec<u8>, chunk: &[u8], max_bytes: usize) -> Result<(), String> {
    let new_len = buffer
        .len()
        .checked_add(chunk.len())
        .ok_or_else(|| "response size overflow".to_string())?;
    if new_len > max_bytes {
        return Err(format!(
            "response too large: {new_len} exceeds {max_bytes} bytes"
        ));
    }
    buffer.extend_from_slice(chunk);
    Ok(())
}

impl ChainSource for UpstreamRpcClient {
    fn block_number(&self) -> UpstreamFuture<'_, u64> {
        Box::pin(async move {
            let number: U64 = self.call_typed("eth_blockNumber", json!([])).await?;
            Ok(number.to::<u64>())
        })
    }

    fn block_by_number(&self, number: u64) -> UpstreamFuture<'_, Option<BlockHeader>> {
        Box::pin(self.call_typed("eth_getBlockByNumber", json!([U64::from(number), false])))
    }

    fn call(&self, request: CallRequest, block: Option<u64>) -> UpstreamFuture<'_, Bytes> {
        Box::pin(async move {
            self.call_typed(
                "eth_call",
                json!([{ "to": request.to, "data": request.data }, block_tag(block)]),
            )
            .await
        })
    }

    fn call_batch(
        &self,
        requests: Vec<CallRequest>,
        block: Option<u64>,
    ) -> UpstreamFuture<'_, Vec<Result<Bytes, UpstreamError>>> {
        Box::pin(self.fetch_call_batch(requests, block))
    }

    fn logs(&self, filter: LogFilter) -> UpstreamFuture<'_, Vec<Log>> {
        Box::pin(async move {
            let mut params = json!({
                "fromBlock": U64::from(filter.from_block),
                "toBlock": U64::from(filter.to_block),
                "address": filter.addresses,
            });
            if !filter.topic0.is_empty() {
                params["topics"] = json!([filter.topic0]);
            }
            self.call_typed("eth_getLogs", json!([params])).await
        })
    }

    fn proof(
        &self,
        address: Address,
        keys: Vec<U256>,
        block: u64,
    ) -> UpstreamFuture<'_, AccountProof> {
        let keys: Vec<B256> = keys.into_iter().map(B256::from).collect();
        Box::pin(self.call_typed("eth_getProof", json!([address, keys, U64::from(block)])))
    }

    fn chain_id(&self) -> UpstreamFuture<'_, u64> {
        Box::pin(async move {
            let chain_id: U64 = self.call_typed("eth_chainId", json!([])).await?;
            Ok(chain_id.to::<u64>())
        })
    }

    fn gas_price(&self) -> UpstreamFuture<'_, U256> {
        Box::pin(self.call_typed("eth_gasPrice", json!([])))
    }

    fn transaction_count(&self, address: Address) -> UpstreamFuture<'_, u64> {
        Box::pin(async move {
            let count: U64 = self
                .call_typed("eth_getTransactionCount", json!([address, "pending"]))
                .await?;
            Ok(count.to::<u64>())
        })
    }

    fn send_raw_transaction(&self, raw: Bytes) -> UpstreamFuture<'_, B256> {
        Box::pin(self.call_typed("eth_sendRawTransaction", json!([raw])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_limited_chunk_rejects_oversized_payload() {
        let mut buffer = vec![0_u8; 8];
        assert!(append_limited_chunk(&mut buffer, &[1, 2, 3], 10).is_err());
        assert!(append_limited_chunk(&mut buffer, &[1, 2], 10).is_ok());
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn error_payloads_become_rejections() {
        let body = json!({"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"execution reverted"}});
        let error = extract_result("eth_call", &body).expect_err("error payload");
        assert!(error.is_rejection());
        assert_eq!(
            error,
            UpstreamError::Rpc {
                method: "eth_call".to_string(),
                code: -32000,
                message: "execution reverted".to_string(),
            }
        );
    }

    #[test]
    fn retry_backoff_doubles_and_caps() {
        let retry = RpcRetryConfig {
            attempts: 5,
            base_backoff: Duration::from_millis(250),
        };
        assert_eq!(retry.backoff(0), Duration::from_millis(250));
        assert_eq!(retry.backoff(2), Duration::from_millis(1_000));
        assert_eq!(retry.backoff(10), Duration::from_millis(5_000));
        let immediate = RpcRetryConfig {
            attempts: 5,
            base_backoff: Duration::ZERO,
        };
        assert_eq!(immediate.backoff(3), Duration::ZERO);
    }

    #[test]
    fn block_tags_are_hex_quantities() {
        assert_eq!(block_tag(Some(255)), json!("0xff"));
        assert_eq!(block_tag(None), json!("latest"));
    }

    #[test]
    fn decodes_get_proof_response() {
        let raw = json!({
            "address": format!("0x{}", "11".repeat(20)),
            "balance": "0x0",
            "codeHash": format!("0x{}", "22".repeat(32)),
            "nonce": "0x1",
            "storageHash": format!("0x{}", "33".repeat(32)),
            "accountProof": ["0xc0"],
            "storageProof": [{"key": "0x0", "value": "0x5", "proof": []}]
        });
        let proof: AccountProof = decode_result("eth_getProof", raw).expect("proof");
        assert_eq!(proof.storage_proof[0].key, U256::ZERO);
        assert_eq!(proof.storage_proof[0].value, U256::from(5_u64));
        assert_eq!(proof.nonce, U64::from(1_u64));
    }
}
