//! Remote cost sources.
//!
//! A [`CostSource`] supplies daily cost facts for an inclusive date range,
//! grouped by (date, account, service). Pagination and account-name lookup are
//! the source's business; callers only see the finished batch.
//!
//! - [`CostExplorerSource`]: Cost Explorer JSON protocol over HTTP
//! - [`StaticSource`]: fixed in-memory facts (tests, offline runs)

mod cost_explorer;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::model::DailyCostFact;

pub use cost_explorer::{CostExplorerConfig, CostExplorerSource};
pub use memory::StaticSource;

/// Facts returned by one fetch, plus how many upstream rows were unusable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CostBatch {
    pub facts: Vec<DailyCostFact>,
    /// Upstream groups dropped for a missing/unparseable date, key or amount.
    pub dropped: usize,
}

/// Failures talking to a cost source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Unreachable, timed out, throttled or a server-side failure. Worth
    /// retrying on a later run.
    #[error("Cost source unavailable: {0}")]
    Transient(String),

    /// The source refused the request outright.
    #[error("Cost source rejected the request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// The client could not be set up locally (TLS backend, bad settings).
    /// Retrying will not help.
    #[error("Cost source client error: {0}")]
    Client(String),

    /// The response could not be understood at all.
    #[error("Malformed cost source response: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Map a non-success HTTP status to a [`SourceError`].
pub fn classify_http_status(status: u16, body: String) -> SourceError {
    match status {
        408 | 429 | 500..=599 => SourceError::Transient(format!("HTTP {}: {}", status, body)),
        _ => SourceError::Rejected { status, body },
    }
}

/// Supplier of daily cost facts.
#[async_trait]
pub trait CostSource: Send + Sync {
    /// Fetch facts dated within `[from, to]`. An empty range yields an empty
    /// batch.
    async fn fetch_daily_costs(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<CostBatch, SourceError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "cost-source"
    }
}

/// Shared handle to a cost source.
pub type CostSourceRef = Arc<dyn CostSource>;
