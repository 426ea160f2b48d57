//! JSON-RPC client for upstream execution-layer nodes.
//!
//! Only the miner-facing subset is consumed: `eth_getWork`,
//! `eth_submitWork`, the pending block, and a liveness probe.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use ethereum_types::U256;
use http_body_util::{BodyExt, Full};
use hyper::{body::Buf, Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Probe deadline; kept short so one dead node cannot stall a check cycle.
const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcResponse {
    #[allow(dead_code)]
    id: Option<Value>,
    result: Option<Value>,
    error: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetWork {
    pub header: String,
    pub seed: String,
    pub target: String,
    /// Some nodes append the block number as a fourth element.
    pub height: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PendingBlock {
    pub raw: Value,
    pub number: Option<u64>,
    pub difficulty: Option<U256>,
}

/// Capability set the proxy consumes from an upstream node.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    fn name(&self) -> &str;
    async fn get_work(&self) -> Result<GetWork>;
    async fn submit_work(&self, params: &[String]) -> Result<bool>;
    async fn get_pending_block(&self) -> Result<Option<PendingBlock>>;
    /// Liveness probe with a short deadline.
    async fn check(&self) -> bool;
}

pub struct RpcClient {
    name: String,
    url: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(name: String, url: String, timeout: Duration) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
        Self { name, url, timeout, client, next_id: AtomicU64::new(1) }
    }

    async fn call(&self, method: &'static str, params: Value, timeout: Duration) -> Result<Value> {
        let payload = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let body = Full::new(Bytes::from(serde_json::to_vec(&payload)?));
        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header("Content-Type", "application/json")
            .body(body)?;

        let response = tokio::time::timeout(timeout, self.client.request(req))
            .await
            .map_err(|_| anyhow!("{}: rpc timeout calling {}", self.name, method))?
            .map_err(|e| anyhow!("{}: rpc connection failed: {}", self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            bail!("{}: rpc http error: {}", self.name, status);
        }
        let bytes = response.into_body().collect().await?.to_bytes();
        let reply: RpcResponse = serde_json::from_reader(bytes.reader())?;
        if let Some(error) = reply.error {
            bail!("{}: rpc error reply: {}", self.name, error);
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }
}

fn parse_quantity_u64(v: &Value) -> Option<u64> {
    let s = v.as_str()?;
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).ok()
}

fn parse_quantity_u256(v: &Value) -> Option<U256> {
    crate::pow::parse_target_hex(v.as_str()?)
}

fn parse_get_work(result: &Value) -> Result<GetWork> {
    let parts = result
        .as_array()
        .ok_or_else(|| anyhow!("eth_getWork reply is not an array"))?;
    if parts.len() < 3 {
        bail!("eth_getWork reply too short: {} elements", parts.len());
    }
    let field = |i: usize| -> Result<String> {
        parts[i]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("eth_getWork element {} is not a string", i))
    };
    Ok(GetWork {
        header: field(0)?,
        seed: field(1)?,
        target: field(2)?,
        height: parts.get(3).and_then(parse_quantity_u64),
    })
}

#[async_trait]
impl UpstreamApi for RpcClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_work(&self) -> Result<GetWork> {
        let result = self.call("eth_getWork", json!([]), self.timeout).await?;
        parse_get_work(&result)
    }

    async fn submit_work(&self, params: &[String]) -> Result<bool> {
        let result = self
            .call("eth_submitWork", json!(params), self.timeout)
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    async fn get_pending_block(&self) -> Result<Option<PendingBlock>> {
        let result = self
            .call("eth_getBlockByNumber", json!(["pending", false]), self.timeout)
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let number = result.get("number").and_then(parse_quantity_u64);
        let difficulty = result.get("difficulty").and_then(parse_quantity_u256);
        Ok(Some(PendingBlock { raw: result, number, difficulty }))
    }

    async fn check(&self) -> bool {
        self.call("eth_getWork", json!([]), CHECK_TIMEOUT.min(self.timeout))
            .await
            .is_ok()
    }
}
