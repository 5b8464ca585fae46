//! Retention Worker
//!
//! Background worker that evicts long-terminal transactions from the live
//! state map. The audit trail keeps everything.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::error::TransitionError;
use super::store::TransactionStateStore;

/// Configuration for the retention worker
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// How often to sweep
    pub scan_interval: Duration,
    /// How long a transaction stays terminal before eviction
    pub retention: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(300),
            retention: Duration::from_secs(86_400),
        }
    }
}

pub struct RetentionWorker {
    store: Arc<TransactionStateStore>,
    config: RetentionConfig,
}

impl RetentionWorker {
    pub fn new(store: Arc<TransactionStateStore>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    pub fn with_defaults(store: Arc<TransactionStateStore>) -> Self {
        Self::new(store, RetentionConfig::default())
    }

    /// Run the sweep loop forever
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Starting retention worker"
        );

        loop {
            if let Err(e) = self.sweep_once() {
                error!(error = %e, code = e.code(), "Retention sweep failed");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// Run a single sweep; returns the number of evicted transactions
    ///
    /// The store audits the eviction as `RETENTION_SWEEP`.
    pub fn sweep_once(&self) -> Result<usize, TransitionError> {
        let removed = self.store.sweep(self.config.retention)?;
        if removed.is_empty() {
            debug!("Nothing to sweep");
        } else {
            info!(
                count = removed.len(),
                retention_secs = self.config.retention.as_secs(),
                "Retention sweep evicted terminal transactions"
            );
        }
        Ok(removed.len())
    }
}
