//! # costbar
//!
//! Keeps a local SQLite copy of daily cost-and-usage data and answers
//! period-over-period questions about it.
//!
//! ## Architecture
//!
//! ```text
//!   CostSource ──fetch──▶ SyncReconciler ──upsert──▶ CostStore ◀──read── CostAnalysis
//!                              │                                              │
//!                              └──────────── Notifier (events) ◀──────────────┘
//! ```
//!
//! - [`sync::SyncReconciler`] decides which days to re-fetch and commits each
//!   batch in one transaction.
//! - [`analysis::CostAnalysis`] derives month-to-date, full-month, day-by-day,
//!   per-service and per-account comparisons on every read.
//! - [`clock::Clock`] injects "today" so windows are deterministic.

pub mod analysis;
pub mod clock;
pub mod config;
pub mod events;
pub mod model;
pub mod source;
pub mod store;
pub mod sync;
pub mod windows;

pub use analysis::{AccountPeriod, CostAnalysis, DashboardReport};
pub use clock::{Clock, ClockRef, FixedClock, SystemClock};
pub use config::{Config, ConfigError};
pub use events::{CostEvent, Notifier};
pub use model::DailyCostFact;
pub use source::{CostBatch, CostSource, CostSourceRef, SourceError};
pub use store::{CostStore, StoreError};
pub use sync::{SyncError, SyncOutcome, SyncPlan, SyncReconciler};
