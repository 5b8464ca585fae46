//! Ledger Gateway
//!
//! Adapter boundary to the external blockchain network. Calls are stateless
//! and network-bound. Every failure is mapped into [`TransactionError`]
//! before it leaves this layer.

pub mod rpc;

pub use rpc::RpcLedgerGateway;

use async_trait::async_trait;

use super::error::TransactionError;
use super::types::{
    LedgerReceipt, LedgerTransaction, RecoveryRequest, TransactionId, ValidationReport,
    VerificationReport,
};

#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Get gateway name for logging
    fn name(&self) -> &'static str;

    /// Broadcast the transaction for the first time
    async fn submit(&self, req: &RecoveryRequest) -> Result<LedgerReceipt, TransactionError>;

    /// Re-broadcast after a transient failure
    async fn retry(&self, req: &RecoveryRequest) -> Result<LedgerReceipt, TransactionError>;

    /// Poll confirmation progress
    async fn verify(&self, req: &RecoveryRequest) -> Result<VerificationReport, TransactionError>;

    /// Issue the compensating transaction
    async fn rollback(&self, req: &RecoveryRequest) -> Result<LedgerReceipt, TransactionError>;

    /// Contract-level validation of a verified transaction
    async fn validate(&self, req: &RecoveryRequest) -> Result<ValidationReport, TransactionError>;

    /// Mark the transaction final on the ledger side
    async fn finalize(&self, req: &RecoveryRequest) -> Result<LedgerReceipt, TransactionError>;

    async fn get_transaction(&self, id: &TransactionId)
    -> Result<LedgerTransaction, TransactionError>;
}


#[cfg(test)]
pub use mock::MockLedger;
