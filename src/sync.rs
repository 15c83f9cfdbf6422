//! Incremental sync from a [`CostSource`] into the [`CostStore`].
//!
//! Each run decides which date range to re-fetch from what is already stored,
//! fetches it, and upserts the result in one transaction. Nothing is persisted
//! between runs besides the facts themselves. Only one run should be in flight
//! at a time; serializing runs is the caller's job.

use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::clock::ClockRef;
use crate::events::Notifier;
use crate::source::{CostBatch, CostSourceRef, SourceError};
use crate::store::{CostStore, StoreError};
use crate::windows::DateWindow;

/// Days re-fetched by a full or bootstrap sync.
pub const FULL_SYNC_LOOKBACK_DAYS: u64 = 60;
/// Trailing days always re-fetched to pick up late or corrected billing rows.
pub const CATCH_UP_DAYS: u64 = 3;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] SourceError),

    #[error("Store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether retrying later might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_transient(),
            Self::Store(_) | Self::Cancelled => false,
        }
    }
}

/// Why a run fetches the range it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Forced full resync over the lookback window.
    Full,
    /// Empty store; first fill over the lookback window.
    Bootstrap,
    /// Gaps remain after the latest stored day; fetch from the gap onwards.
    CatchUp,
    /// No gaps; re-pull only the trailing catch-up window.
    Trailing,
}

/// The range a run will fetch, decided before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub mode: SyncMode,
    pub today: NaiveDate,
    pub from: NaiveDate,
    /// Inclusive; always yesterday.
    pub to: NaiveDate,
    /// Days in the originally chosen range with no stored facts. Diagnostic
    /// only; it never narrows the fetch.
    pub missing_dates: Vec<NaiveDate>,
}

impl SyncPlan {
    /// The inclusive fetch range.
    pub fn window(&self) -> DateWindow {
        DateWindow::new(self.from, self.to)
    }

    pub fn is_empty(&self) -> bool {
        self.window().is_empty()
    }
}

/// Completion record of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub plan: SyncPlan,
    pub fetched: usize,
    pub dropped: usize,
    pub completed_at: DateTime<Utc>,
}

pub struct SyncReconciler {
    store: Arc<CostStore>,
    source: CostSourceRef,
    clock: ClockRef,
    notifier: Option<Notifier>,
}

impl SyncReconciler {
    pub fn new(store: Arc<CostStore>, source: CostSourceRef, clock: ClockRef) -> Self {
        Self {
            store,
            source,
            clock,
            notifier: None,
        }
    }

    /// Publish a `DataRefreshed` event after every successful run.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Decide the fetch window for a run.
    pub fn plan(&self, force_full: bool) -> Result<SyncPlan, SyncError> {
        let today = self.clock.today();
        let yesterday = days_back(today, 1);
        let lookback_from = days_back(today, FULL_SYNC_LOOKBACK_DAYS);
        let catch_up_from = days_back(today, CATCH_UP_DAYS);

        let (mode, from) = if force_full {
            (SyncMode::Full, lookback_from)
        } else {
            match self.store.latest_date()? {
                None => (SyncMode::Bootstrap, lookback_from),
                Some(latest) if latest < catch_up_from => {
                    (SyncMode::CatchUp, latest.succ_opt().unwrap_or(latest))
                }
                Some(_) => (SyncMode::CatchUp, catch_up_from),
            }
        };

        let missing_dates = self.store.missing_dates(from, yesterday)?;
        let (mode, from) = if missing_dates.is_empty() && !force_full {
            (SyncMode::Trailing, catch_up_from)
        } else {
            (mode, from)
        };

        Ok(SyncPlan {
            mode,
            today,
            from,
            to: yesterday,
            missing_dates,
        })
    }

    /// Plan, fetch and upsert.
    ///
    /// Cancelling `cancel` at any point before the upsert commits returns
    /// [`SyncError::Cancelled`] and leaves the store untouched. A fetch failure
    /// also leaves the store untouched; no retry is attempted.
    pub async fn run(
        &self,
        force_full: bool,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let plan = self.plan(force_full)?;
        tracing::info!(
            mode = ?plan.mode,
            from = %plan.from,
            to = %plan.to,
            days = plan.window().len_days(),
            missing = plan.missing_dates.len(),
            source = self.source.name(),
            "Planned cost sync"
        );

        let batch = if plan.is_empty() {
            tracing::debug!("Empty sync range; skipping fetch");
            CostBatch::default()
        } else {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(from = %plan.from, to = %plan.to, "Cost sync cancelled during fetch");
                    return Err(SyncError::Cancelled);
                }
                result = self.source.fetch_daily_costs(plan.from, plan.to) => match result {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(error = %e, transient = e.is_transient(), "Cost fetch failed");
                        return Err(e.into());
                    }
                },
            }
        };

        if batch.dropped > 0 {
            tracing::warn!(dropped = batch.dropped, "Dropped malformed cost rows");
        }

        // Last point where cancelling still discards the whole batch.
        if cancel.is_cancelled() {
            tracing::info!(
                fetched = batch.facts.len(),
                "Cost sync cancelled before upsert; discarding fetched facts"
            );
            return Err(SyncError::Cancelled);
        }

        let fetched = self.store.upsert(&batch.facts)?;
        let completed_at = Utc::now();
        tracing::info!(fetched, dropped = batch.dropped, "Cost sync complete");

        if let Some(notifier) = &self.notifier {
            notifier.data_refreshed(completed_at, fetched);
        }

        Ok(SyncOutcome {
            plan,
            fetched,
            dropped: batch.dropped,
            completed_at,
        })
    }
}

fn days_back(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN)
}
