//! Refresh and credits-toggle notifications.
//!
//! The sync reconciler and the analysis engine publish here; any number of
//! observers (a UI, the `watch` loop, tests) can subscribe. Publishing with no
//! subscribers is fine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CostEvent {
    /// A sync run finished and its facts are committed.
    DataRefreshed {
        completed_at: DateTime<Utc>,
        fetched: usize,
    },
    /// The credits-inclusion toggle changed.
    CreditsToggled { include_credits: bool },
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<CostEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CostEvent> {
        self.tx.subscribe()
    }

    /// Publish `event`, returning how many subscribers received it.
    pub fn publish(&self, event: CostEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                tracing::trace!("No subscribers for cost event");
                0
            }
        }
    }

    pub fn data_refreshed(&self, completed_at: DateTime<Utc>, fetched: usize) -> usize {
        self.publish(CostEvent::DataRefreshed {
            completed_at,
            fetched,
        })
    }

    pub fn credits_toggled(&self, include_credits: bool) -> usize {
        self.publish(CostEvent::CreditsToggled { include_credits })
    }
}
