#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;

use in3_node_types::{
    Address, B256, BlockNumber, BlockRequest, NodeListSnapshot, SignatureAttestation,
    ValidatorSetEntry,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

const JSONRPC_VERSION: &str = "2.0";
const ERR_PARSE: i64 = -32700;
const ERR_INVALID_REQUEST: i64 = -32600;
const ERR_METHOD_NOT_FOUND: i64 = -32601;
const ERR_INVALID_PARAMS: i64 = -32602;
const ERR_INTERNAL: i64 = -32603;
const ERR_UNAVAILABLE: i64 = -32000;
const ERR_REJECTED: i64 = -32001;

pub const MAX_SIGN_REQUESTS: usize = 64;
pub const MAX_PINNED_ADDRESSES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
    pub id: Value,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("invalid JSON-RPC request: {0}")]
    InvalidRequest(String),
    #[error("unknown method: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// The request is well-formed but this node refuses it (block too young, hash mismatch).
    #[error("request rejected: {0}")]
    Rejected(String),
    /// Data this node must deliver could not be produced right now.
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeListQuery {
    pub limit: Option<u64>,
    pub seed: Option<B256>,
    pub pinned_addresses: Vec<Address>,
    pub include_proof: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorListQuery {
    pub start_index: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorListResponse {
    pub states: Vec<ValidatorSetEntry>,
    pub last_checked_block: BlockNumber,
}

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RpcError>> + Send + 'a>>;

/// What a chain handler exposes to inbound requests.
pub trait In3Backend: Send + Sync {
    fn sign(&self, requests: Vec<BlockRequest>) -> BackendFuture<'_, Vec<SignatureAttestation>>;
    fn node_list(&self, query: NodeListQuery) -> BackendFuture<'_, NodeListSnapshot>;
    fn validator_list(&self, query: ValidatorListQuery)
    -> BackendFuture<'_, ValidatorListResponse>;
}

pub struct In3RpcServer<B> {
    backend: B,
}

impl<B> In3RpcServer<B>
where
    B: In3Backend,
{
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn handle_raw(&self, raw: &str) -> String {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.handle_value(value).await,
            Err(error) => serialize_response(error_response(
                Value::Null,
                ERR_PARSE,
                format!("parse error: {error}"),
            )),
        }
    }

    async fn handle_value(&self, value: Value) -> String {
        match value {
            Value::Array(items) => {
                if items.is_empty() {
                    return serialize_response(error_response(
                        Value::Null,
                        ERR_INVALID_REQUEST,
                        "empty batch request",
                    ));
                }
                let mut responses = Vec::with_capacity(items.len());
                for item in items {
                    responses.push(self.handle_item(item).await);
                }
                serde_json::to_string(&responses).unwrap_or_else(|error| {
                    serialize_response(error_response(
                        Value::Null,
                        ERR_INTERNAL,
                        format!("failed to serialize batch response: {error}"),
                    ))
                })
            }
            other => serialize_response(self.handle_item(other).await),
        }
    }

    async fn handle_item(&self, item: Value) -> JsonRpcResponse {
        match serde_json::from_value::<JsonRpcRequest>(item) {
            Ok(request) => self.handle_request(request).await,
            Err(error) => error_response(
                Value::Null,
                ERR_INVALID_REQUEST,
                format!("invalid request object: {error}"),
            ),
        }
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        if request.jsonrpc != JSONRPC_VERSION {
            return error_response(
                request.id,
                ERR_INVALID_REQUEST,
                format!(
                    "unsupported jsonrpc version '{}', expected '{}'",
                    request.jsonrpc, JSONRPC_VERSION
                ),
            );
        }

        debug!(method = %request.method, "handling request");
        match self.execute(request.method.as_str(), &request.params).await {
            Ok(result) => JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                result: Some(result),
                error: None,
                id: request.id,
            },
            Err(error) => map_error_to_response(request.id, error),
        }
    }

    async fn execute(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        match method {
            "in3_sign" => {
                let requests = parse_sign_params(params)?;
                let attestations = self.backend.sign(requests).await?;
                to_value(&attestations)
            }
            "in3_nodeList" => {
                let query = parse_node_list_params(params)?;
                let snapshot = self.backend.node_list(query).await?;
                to_value(&snapshot)
            }
            "in3_validatorList" => {
                let query = parse_validator_list_params(params)?;
                let response = self.backend.validator_list(query).await?;
                to_value(&response)
            }
            _ => Err(RpcError::MethodNotFound(method.to_string())),
        }
    }
}

fn to_value(value: &impl Serialize) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|error| RpcError::Internal(error.to_string()))
}

fn parse_sign_params(params: &Value) -> Result<Vec<BlockRequest>, RpcError> {
    let items = match params {
        Value::Array(items) if items.len() == 1 && items[0].is_array() => {
            items[0].as_array().map(Vec::as_slice).unwrap_or_default()
        }
        Value::Array(items) => items.as_slice(),
        _ => {
            return Err(RpcError::InvalidParams(
                "in3_sign expects an array of block requests".to_string(),
            ));
        }
    };
    if items.is_empty() {
        return Err(RpcError::InvalidParams(
            "in3_sign needs at least one block".to_string(),
        ));
    }
    if items.len() > MAX_SIGN_REQUESTS {
        return Err(RpcError::InvalidParams(format!(
            "in3_sign accepts at most {MAX_SIGN_REQUESTS} blocks, got {}",
            items.len()
        )));
    }
    items.iter().map(parse_block_request).collect()
}

fn parse_block_request(item: &Value) -> Result<BlockRequest, RpcError> {
    let object = item.as_object().ok_or_else(|| {
        RpcError::InvalidParams("block request must be an object".to_string())
    })?;
    let block_number = object
        .get("blockNumber")
        .and_then(value_as_u64)
        .ok_or_else(|| RpcError::InvalidParams("block request needs blockNumber".to_string()))?;
    let hash = match object.get("blockHash").or_else(|| object.get("hash")) {
        None | Some(Value::Null) => None,
        Some(raw) => Some(parse_b256(raw, "blockHash")?),
    };
    Ok(BlockRequest { block_number, hash })
}

fn parse_node_list_params(params: &Value) -> Result<NodeListQuery, RpcError> {
    let (limit, seed, addresses, proof) = match params {
        Value::Null => (None, None, None, None),
        Value::Array(values) => {
            if values.len() > 4 {
                return Err(RpcError::InvalidParams(format!(
                    "in3_nodeList takes at most 4 params, got {}",
                    values.len()
                )));
            }
            (values.first(), values.get(1), values.get(2), values.get(3))
        }
        Value::Object(map) => (
            map.get("limit"),
            map.get("seed"),
            map.get("addresses").or_else(|| map.get("pinnedAddresses")),
            map.get("includeProof"),
        ),
        _ => {
            return Err(RpcError::InvalidParams(
                "params must be array or object".to_string(),
            ));
        }
    };

    let limit = match limit {
        None | Some(Value::Null) => None,
        Some(raw) => Some(value_as_u64(raw).ok_or_else(|| {
            RpcError::InvalidParams("limit must be a non-negative integer".to_string())
        })?),
    };
    let seed = match seed {
        None | Some(Value::Null) => None,
        Some(raw) => Some(parse_b256(raw, "seed")?),
    };
    let pinned_addresses = match addresses {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(values)) => {
            if values.len() > MAX_PINNED_ADDRESSES {
                return Err(RpcError::InvalidParams(format!(
                    "at most {MAX_PINNED_ADDRESSES} pinned addresses are accepted"
                )));
            }
            values
                .iter()
                .map(|raw| {
                    serde_json::from_value::<Address>(raw.clone()).map_err(|error| {
                        RpcError::InvalidParams(format!("invalid pinned address: {error}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        }
        Some(_) => {
            return Err(RpcError::InvalidParams(
                "addresses must be an array".to_string(),
            ));
        }
    };
    let include_proof = match proof {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(_) => {
            return Err(RpcError::InvalidParams(
                "includeProof must be a boolean".to_string(),
            ));
        }
    };

    Ok(NodeListQuery {
        limit,
        seed,
        pinned_addresses,
        include_proof,
    })
}

fn parse_validator_list_params(params: &Value) -> Result<ValidatorListQuery, RpcError> {
    let (start, limit) = match params {
        Value::Null => (None, None),
        Value::Array(values) if values.len() <= 2 => (values.first(), values.get(1)),
        Value::Array(values) => {
            return Err(RpcError::InvalidParams(format!(
                "in3_validatorList takes at most 2 params, got {}",
                values.len()
            )));
        }
        Value::Object(map) => (map.get("startIndex"), map.get("limit")),
        _ => {
            return Err(RpcError::InvalidParams(
                "params must be array or object".to_string(),
            ));
        }
    };
    let parse = |raw: Option<&Value>, field: &str| -> Result<Option<usize>, RpcError> {
        match raw {
            None | Some(Value::Null) => Ok(None),
            Some(raw) => value_as_u64(raw)
                .and_then(|value| usize::try_from(value).ok())
                .map(Some)
                .ok_or_else(|| {
                    RpcError::InvalidParams(format!("{field} must be a non-negative integer"))
                }),
        }
    };
    Ok(ValidatorListQuery {
        start_index: parse(start, "startIndex")?,
        limit: parse(limit, "limit")?,
    })
}

fn parse_b256(raw: &Value, field: &str) -> Result<B256, RpcError> {
    serde_json::from_value::<B256>(raw.clone())
        .map_err(|error| RpcError::InvalidParams(format!("{field} must be 32 bytes hex: {error}")))
}

/// Accepts JSON numbers and `0x`-prefixed hex quantities.
fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => match raw.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => raw.parse().ok(),
        },
        _ => None,
    }
}

fn map_error_to_response(id: Value, error: RpcError) -> JsonRpcResponse {
    match error {
        RpcError::InvalidRequest(message) => error_response(id, ERR_INVALID_REQUEST, message),
        RpcError::MethodNotFound(method) => error_response(
            id,
            ERR_METHOD_NOT_FOUND,
            format!("method '{method}' is not supported"),
        ),
        RpcError::InvalidParams(message) => error_response(id, ERR_INVALID_PARAMS, message),
        RpcError::Rejected(message) => error_response(id, ERR_REJECTED, message),
        RpcError::Unavailable(message) => error_response(id, ERR_UNAVAILABLE, message),
        RpcError::Internal(message) => error_response(id, ERR_INTERNAL, message),
    }
}

fn error_response(id: Value, code: i64, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        result: None,
        error: Some(JsonRpcErrorObject {
            code,
            message: message.into(),
        }),
        id,
    }
}

fn serialize_response(response: JsonRpcResponse) -> String {
    serde_json::to_string(&response).unwrap_or_else(|error| {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "error": { "code": ERR_INTERNAL, "message": format!("failed to serialize response: {error}") },
            "id": Value::Null,
        })
        .to_string()
    })
}
