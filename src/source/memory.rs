//! In-memory cost source.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use super::{CostBatch, CostSource, SourceError};
use crate::model::DailyCostFact;

/// Serves a fixed set of facts, filtered to the requested range.
///
/// Records every requested range so callers can check what was fetched.
#[derive(Default)]
pub struct StaticSource {
    facts: Mutex<Vec<DailyCostFact>>,
    requests: Mutex<Vec<(NaiveDate, NaiveDate)>>,
    failure: Option<String>,
    delay: Option<Duration>,
}

impl StaticSource {
    pub fn new(facts: Vec<DailyCostFact>) -> Self {
        Self {
            facts: Mutex::new(facts),
            ..Self::default()
        }
    }

    /// Source whose every fetch fails with a transient error.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    /// Delay every fetch by `delay` (simulates network latency).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replace the served facts.
    pub fn set_facts(&self, facts: Vec<DailyCostFact>) {
        if let Ok(mut guard) = self.facts.lock() {
            *guard = facts;
        }
    }

    /// Ranges requested so far, in call order.
    pub fn requests(&self) -> Vec<(NaiveDate, NaiveDate)> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CostSource for StaticSource {
    async fn fetch_daily_costs(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<CostBatch, SourceError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((from, to));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(SourceError::Transient(message.clone()));
        }

        let facts = self
            .facts
            .lock()
            .map_err(|_| SourceError::Transient("static source lock poisoned".to_string()))?
            .iter()
            .filter(|fact| fact.date >= from && fact.date <= to)
            .cloned()
            .collect();

        Ok(CostBatch { facts, dropped: 0 })
    }

    fn name(&self) -> &str {
        "static"
    }
}
