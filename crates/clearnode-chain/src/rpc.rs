//! [`LogSource`] over an Ethereum JSON-RPC endpoint.
//!
//! Live subscriptions poll `eth_blockNumber` and page through new blocks with
//! `eth_getLogs`. A failed poll is reported on the subscription and ends it;
//! the caller decides whether to resubscribe.

use async_trait::async_trait;
use clearnode_core::{Address, TxHash, H256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ChainError;
use crate::source::{LogSource, LogSubscription, RawLog};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    method: &'a str,
    params: P,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<R> {
    result: Option<R>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogFilter {
    address: Address,
    from_block: String,
    to_block: String,
}

/// Log object as returned by `eth_getLogs`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    topics: Vec<H256>,
    data: String,
    block_number: String,
    transaction_hash: TxHash,
    log_index: String,
    #[serde(default)]
    removed: bool,
}

impl TryFrom<RpcLog> for RawLog {
    type Error = ChainError;

    fn try_from(log: RpcLog) -> Result<Self, Self::Error> {
        let data = log.data.strip_prefix("0x").unwrap_or(&log.data);
        Ok(RawLog {
            block_number: parse_hex_u64(&log.block_number)?,
            log_index: parse_hex_u64(&log.log_index)?,
            tx_hash: log.transaction_hash,
            address: log.address,
            topics: log.topics,
            data: hex::decode(data)
                .map_err(|e| ChainError::InvalidResponse(format!("log data: {e}")))?,
        })
    }
}

fn parse_hex_u64(s: &str) -> Result<u64, ChainError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|_| ChainError::InvalidResponse(format!("not a hex quantity: {s}")))
}

fn hex_quantity(v: u64) -> String {
    format!("0x{v:x}")
}

struct RpcClient {
    http: reqwest::Client,
    url: String,
    request_id: AtomicU64,
}

impl RpcClient {
    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, ChainError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
        };
        let response: JsonRpcResponse<R> = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        response
            .result
            .ok_or_else(|| ChainError::InvalidResponse(format!("{method}: missing result")))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let result: String = self.call("eth_blockNumber", Vec::<()>::new()).await?;
        parse_hex_u64(&result)
    }

    async fn get_logs(&self, contract: Address, from: u64, to: u64) -> Result<Vec<RawLog>, ChainError> {
        let filter = LogFilter {
            address: contract,
            from_block: hex_quantity(from),
            to_block: hex_quantity(to),
        };
        let logs: Vec<RpcLog> = self.call("eth_getLogs", [filter]).await?;
        let mut out = Vec::with_capacity(logs.len());
        for log in logs {
            if log.removed {
                tracing::warn!(tx_hash = ?log.transaction_hash, "skipping removed log");
                continue;
            }
            out.push(RawLog::try_from(log)?);
        }
        out.sort_by_key(RawLog::position);
        Ok(out)
    }
}

/// HTTP JSON-RPC log source for one chain.
#[derive(Clone)]
pub struct HttpLogSource {
    rpc: Arc<RpcClient>,
    poll_interval: Duration,
    block_step: u64,
}

impl HttpLogSource {
    pub fn new(
        url: impl Into<String>,
        poll_interval: Duration,
        block_step: u64,
    ) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            rpc: Arc::new(RpcClient {
                http,
                url: url.into(),
                request_id: AtomicU64::new(1),
            }),
            poll_interval,
            block_step: block_step.max(1),
        })
    }
}

#[async_trait]
impl LogSource for HttpLogSource {
    async fn subscribe(
        &self,
        contract: Address,
        from_block: u64,
    ) -> Result<LogSubscription, ChainError> {
        // Fail fast if the endpoint is unreachable.
        self.rpc.block_number().await?;

        let (tx, subscription) = LogSubscription::channel(SUBSCRIPTION_BUFFER);
        let rpc = self.rpc.clone();
        let poll_interval = self.poll_interval;
        let step = self.block_step;

        tokio::spawn(async move {
            let mut next = from_block;
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    return;
                }
                let head = match rpc.block_number().await {
                    Ok(head) => head,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                while next <= head {
                    let to = head.min(next.saturating_add(step - 1));
                    match rpc.get_logs(contract, next, to).await {
                        Ok(logs) => {
                            for log in logs {
                                if tx.send(Ok(log)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                    next = to + 1;
                }
            }
        });

        Ok(subscription)
    }

    async fn fetch_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainError> {
        self.rpc.get_logs(contract, from_block, to_block).await
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        self.rpc.block_number().await
    }
}
