//! Registry backend for the on-chain model key contract, reached over
//! Ethereum JSON-RPC.
//!
//! Lookups are `eth_call`s against the contract's `getModelKey(string)`
//! view function, which returns a `bytes32`. Publishing sends an
//! `eth_sendTransaction` from an account managed by the node; signing
//! transactions locally is left to the deployment tooling.

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use super::{KeyRegistry, RegistryKey};
use crate::config::RegistryConfig;
use crate::error::{ProvenanceError, RegistryCallError, Result};

/// Name of the contract's lookup function.
pub const LOOKUP_FUNCTION: &str = "getModelKey";

const USER_AGENT_VALUE: &str = concat!("camera-provenance/", env!("CARGO_PKG_VERSION"));
const WORD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiParam {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

/// One entry of a contract ABI. Events, constructors and errors are kept
/// but only functions are used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiItem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
    #[serde(default)]
    pub outputs: Vec<AbiParam>,
    #[serde(rename = "stateMutability", default)]
    pub state_mutability: Option<String>,
}

impl AbiItem {
    fn is_function(&self) -> bool {
        self.kind == "function"
    }

    fn is_read_only(&self) -> bool {
        matches!(self.state_mutability.as_deref(), Some("view" | "pure"))
    }

    fn input_types(&self) -> Vec<&str> {
        self.inputs.iter().map(|p| p.kind.as_str()).collect()
    }

    fn output_types(&self) -> Vec<&str> {
        self.outputs.iter().map(|p| p.kind.as_str()).collect()
    }

    /// Canonical signature, e.g. `getModelKey(string)`.
    pub fn signature(&self) -> String {
        format!("{}({})", self.name, self.input_types().join(","))
    }

    pub fn selector(&self) -> [u8; 4] {
        selector(&self.signature())
    }
}

/// First four bytes of the Keccak-256 hash of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Persisted record of a deployed registry contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDeployment {
    pub address: String,
    pub abi: Vec<AbiItem>,
}

impl RegistryDeployment {
    pub fn from_json(json: &str) -> Result<Self> {
        let deployment: Self = serde_json::from_str(json).map_err(|e| {
            ProvenanceError::Config(format!("Failed to parse deployment record: {}", e))
        })?;
        deployment.validate()?;
        Ok(deployment)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    fn validate(&self) -> Result<()> {
        let hex_part = self.address.strip_prefix("0x").unwrap_or("");
        if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ProvenanceError::Config(format!(
                "Invalid contract address: {}",
                self.address
            )));
        }
        if self.lookup_function().is_none() {
            return Err(ProvenanceError::Config(format!(
                "ABI has no {}(string) returns (bytes32) function",
                LOOKUP_FUNCTION
            )));
        }
        Ok(())
    }

    /// The `string -> bytes32` view function used for lookups.
    pub fn lookup_function(&self) -> Option<&AbiItem> {
        let candidates = || {
            self.abi.iter().filter(|item| {
                item.is_function()
                    && item.input_types() == ["string"]
                    && item.output_types() == ["bytes32"]
            })
        };
        candidates()
            .find(|item| item.name == LOOKUP_FUNCTION)
            .or_else(|| candidates().find(|item| item.is_read_only()))
    }

    /// The state-changing `(string, bytes32)` function used for publishing.
    pub fn publish_function(&self) -> Option<&AbiItem> {
        self.abi.iter().find(|item| {
            item.is_function() && !item.is_read_only() && item.input_types() == ["string", "bytes32"]
        })
    }
}

fn word_from_usize(n: usize) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&(n as u64).to_be_bytes());
    word
}

/// Length word followed by the bytes, right-padded to a word boundary.
fn encode_string_tail(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let padded = bytes.len().div_ceil(WORD) * WORD;
    let mut out = Vec::with_capacity(WORD + padded);
    out.extend_from_slice(&word_from_usize(bytes.len()));
    out.extend_from_slice(bytes);
    out.resize(WORD + padded, 0);
    out
}

pub(crate) fn encode_lookup_call(selector: [u8; 4], identifier: &str) -> Vec<u8> {
    let mut out = selector.to_vec();
    out.extend_from_slice(&word_from_usize(WORD));
    out.extend(encode_string_tail(identifier));
    out
}

pub(crate) fn encode_publish_call(
    selector: [u8; 4],
    identifier: &str,
    public_key: &RegistryKey,
) -> Vec<u8> {
    let mut out = selector.to_vec();
    out.extend_from_slice(&word_from_usize(2 * WORD));
    out.extend_from_slice(public_key);
    out.extend(encode_string_tail(identifier));
    out
}

pub(crate) fn decode_bytes32(result: &str) -> std::result::Result<RegistryKey, RegistryCallError> {
    let hex_part = result.strip_prefix("0x").unwrap_or(result);
    let bytes = hex::decode(hex_part)
        .map_err(|e| RegistryCallError::InvalidResponse(format!("result is not hex: {}", e)))?;
    if bytes.len() < WORD {
        return Err(RegistryCallError::InvalidResponse(format!(
            "expected a 32-byte word, got {} bytes",
            bytes.len()
        )));
    }
    let mut key = [0u8; WORD];
    key.copy_from_slice(&bytes[..WORD]);
    Ok(key)
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

fn transport_error(err: reqwest::Error) -> RegistryCallError {
    if err.is_timeout() {
        RegistryCallError::Timeout
    } else {
        RegistryCallError::Transport(err.to_string())
    }
}

/// JSON-RPC client for the registry contract.
#[derive(Debug)]
pub struct RpcRegistry {
    client: Client,
    rpc_url: String,
    address: String,
    lookup_selector: [u8; 4],
    publish_selector: Option<[u8; 4]>,
    from_address: Option<String>,
    next_id: AtomicU64,
}

impl RpcRegistry {
    pub fn new(config: &RegistryConfig, deployment: &RegistryDeployment) -> Result<Self> {
        let lookup = deployment.lookup_function().ok_or_else(|| {
            ProvenanceError::Config(format!("ABI has no {} function", LOOKUP_FUNCTION))
        })?;

        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(USER_AGENT_VALUE)
            .build()
            .map_err(|e| ProvenanceError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            rpc_url: config.rpc_url.clone(),
            address: deployment.address.clone(),
            lookup_selector: lookup.selector(),
            publish_selector: deployment.publish_function().map(AbiItem::selector),
            from_address: config.from_address.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Build a client from a config, reading the deployment record it names.
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        let deployment = RegistryDeployment::from_file(&config.deployment_path)?;
        Self::new(config, &deployment)
    }

    fn call(&self, method: &str, params: Value) -> std::result::Result<Value, RegistryCallError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!(url = %self.rpc_url, method, id = request.id, "sending JSON-RPC request");

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RegistryCallError::Transport(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(RegistryCallError::InvalidResponse(format!("HTTP {}", status)));
        }

        let body: RpcResponse = response.json().map_err(|e| {
            if e.is_timeout() {
                RegistryCallError::Timeout
            } else {
                RegistryCallError::InvalidResponse(format!("failed to parse response: {}", e))
            }
        })?;

        match (body.result, body.error) {
            (_, Some(error)) => Err(RegistryCallError::Reverted(format!(
                "{} (code {})",
                error.message, error.code
            ))),
            (Some(result), None) => Ok(result),
            (None, None) => Err(RegistryCallError::InvalidResponse(
                "response has neither result nor error".to_string(),
            )),
        }
    }
}

impl KeyRegistry for RpcRegistry {
    fn resolve_key(&self, identifier: &str) -> std::result::Result<RegistryKey, RegistryCallError> {
        let data = encode_lookup_call(self.lookup_selector, identifier);
        let params = json!([
            { "to": self.address, "data": format!("0x{}", hex::encode(data)) },
            "latest"
        ]);

        let result = self.call("eth_call", params)?;
        let result = result.as_str().ok_or_else(|| {
            RegistryCallError::InvalidResponse("eth_call result is not a string".to_string())
        })?;
        decode_bytes32(result)
    }

    fn publish_key(
        &self,
        identifier: &str,
        public_key: &RegistryKey,
    ) -> std::result::Result<(), RegistryCallError> {
        let selector = self.publish_selector.ok_or_else(|| {
            RegistryCallError::Reverted("ABI has no (string, bytes32) publish function".to_string())
        })?;
        let from = self.from_address.as_deref().ok_or_else(|| {
            RegistryCallError::Reverted("no from_address configured for publishing".to_string())
        })?;

        let data = encode_publish_call(selector, identifier, public_key);
        let params = json!([{
            "from": from,
            "to": self.address,
            "data": format!("0x{}", hex::encode(data)),
        }]);

        let tx_hash = self.call("eth_sendTransaction", params)?;
        info!(identifier, tx_hash = %tx_hash, "submitted key registration");
        Ok(())
    }
}
