//! JSON-RPC Ledger Gateway
//!
//! Talks to a ledger node (or a relayer in front of one) over JSON-RPC/HTTP.
//! Transport, HTTP and RPC-level failures are classified here so nothing
//! from `reqwest` leaks past the gateway.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use super::LedgerGateway;
use crate::recovery::error::TransactionError;
use crate::recovery::types::{
    LedgerReceipt, LedgerTransaction, RecoveryRequest, TransactionId, ValidationReport,
    VerificationReport,
};

/// RPC error codes the ledger node returns
pub mod codes {
    pub const INVALID_PARAMS: i64 = -32602;
    pub const VALIDATION_FAILED: i64 = -32010;
    pub const INSUFFICIENT_FUNDS: i64 = -32011;
    pub const WALLET_REJECTED: i64 = -32012;
    pub const NODE_BUSY: i64 = -32005;
    /// Server-defined range (-32099..=-32000)
    pub const SERVER_ERROR_MIN: i64 = -32099;
    pub const SERVER_ERROR_MAX: i64 = -32000;
}

/// JSON-RPC request structure
#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Serialize)]
struct RecoveryParams<'a> {
    transaction_id: &'a str,
    wallet_address: &'a str,
    recovery_attempts: u32,
}

impl<'a> From<&'a RecoveryRequest> for RecoveryParams<'a> {
    fn from(req: &'a RecoveryRequest) -> Self {
        Self {
            transaction_id: req.transaction_id.as_str(),
            wallet_address: &req.wallet_address,
            recovery_attempts: req.recovery_attempt_count,
        }
    }
}

#[derive(Serialize)]
struct LookupParams<'a> {
    transaction_id: &'a str,
}

pub struct RpcLedgerGateway {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcLedgerGateway {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, TransactionError> {
        let url = url.into();
        info!(url = %url, timeout_ms = request_timeout.as_millis() as u64, "Initializing ledger RPC gateway");

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransactionError::network("Failed to create HTTP client").with_cause(e))?;

        Ok(Self {
            client,
            url,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<P, T>(&self, method: &'static str, params: P) -> Result<T, TransactionError>
    where
        P: Serialize + Send,
        T: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id,
        };

        debug!(method, id, "Ledger RPC call");

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(method, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_http_status(method, status.as_u16()));
        }

        let body: JsonRpcResponse<T> = response.json().await.map_err(|e| {
            if e.is_timeout() {
                classify_transport(method, e)
            } else {
                TransactionError::unknown(format!("{}: malformed RPC response", method))
                    .with_cause(e)
            }
        })?;

        if let Some(err) = body.error {
            debug!(method, code = err.code, message = %err.message, "Ledger RPC error");
            return Err(classify_rpc_error(err.code, &err.message));
        }

        body.result
            .ok_or_else(|| TransactionError::unknown(format!("{}: empty RPC result", method)))
    }
}

/// Map a transport-level failure into the taxonomy
fn classify_transport(method: &str, e: reqwest::Error) -> TransactionError {
    if e.is_timeout() {
        TransactionError::timeout(format!("{}: ledger did not answer in time", method)).with_cause(e)
    } else if e.is_connect() || e.is_request() {
        TransactionError::network(format!("{}: ledger unreachable", method)).with_cause(e)
    } else {
        TransactionError::unknown(format!("{}: transport failure", method)).with_cause(e)
    }
}

/// Map a non-2xx HTTP status into the taxonomy
pub fn classify_http_status(method: &str, status: u16) -> TransactionError {
    let message = format!("{}: HTTP {}", method, status);
    match status {
        408 | 504 => TransactionError::timeout(message),
        429 | 502 | 503 => TransactionError::network(message),
        400 | 422 => TransactionError::validation(message),
        401 | 403 => TransactionError::wallet(message),
        500..=599 => TransactionError::blockchain(message),
        _ => TransactionError::unknown(message),
    }
}

/// Map a JSON-RPC error object into the taxonomy
pub fn classify_rpc_error(code: i64, message: &str) -> TransactionError {
    let cause = format!("rpc code {}", code);
    let err = match code {
        codes::INVALID_PARAMS | codes::VALIDATION_FAILED => TransactionError::validation(message),
        codes::INSUFFICIENT_FUNDS => TransactionError::insufficient_funds(message),
        codes::WALLET_REJECTED => TransactionError::wallet(message),
        codes::NODE_BUSY => TransactionError::network(message),
        codes::SERVER_ERROR_MIN..=codes::SERVER_ERROR_MAX => TransactionError::blockchain(message),
        _ => TransactionError::unknown(message),
    };
    err.with_cause(cause)
}

#[async_trait]
impl LedgerGateway for RpcLedgerGateway {
    fn name(&self) -> &'static str {
        "rpc"
    }

    async fn submit(&self, req: &RecoveryRequest) -> Result<LedgerReceipt, TransactionError> {
        self.call("ledger_submit", RecoveryParams::from(req)).await
    }

    async fn retry(&self, req: &RecoveryRequest) -> Result<LedgerReceipt, TransactionError> {
        self.call("ledger_retry", RecoveryParams::from(req)).await
    }

    async fn verify(&self, req: &RecoveryRequest) -> Result<VerificationReport, TransactionError> {
        self.call("ledger_verify", RecoveryParams::from(req)).await
    }

    async fn rollback(&self, req: &RecoveryRequest) -> Result<LedgerReceipt, TransactionError> {
        self.call("ledger_rollback", RecoveryParams::from(req)).await
    }

    async fn validate(&self, req: &RecoveryRequest) -> Result<ValidationReport, TransactionError> {
        self.call("ledger_validate", RecoveryParams::from(req)).await
    }

    async fn finalize(&self, req: &RecoveryRequest) -> Result<LedgerReceipt, TransactionError> {
        self.call("ledger_finalize", RecoveryParams::from(req)).await
    }

    async fn get_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<LedgerTransaction, TransactionError> {
        self.call(
            "ledger_getTransaction",
            LookupParams {
                transaction_id: id.as_str(),
            },
        )
        .await
    }
}
