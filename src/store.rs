//! SQLite-backed store of daily cost facts.
//!
//! One table, `daily_costs`, keyed by `(date, account_id, service)`. Dates are
//! stored as ISO `YYYY-MM-DD` text so they sort and compare as strings. Costs
//! are stored as canonical decimal text; rows written by older builds that used
//! a `REAL` column are still readable.
//!
//! SQL only narrows by date. Credit filtering and all summing happen in Rust so
//! that the credit heuristic lives in exactly one place
//! ([`crate::model::is_credit`]) and money never round-trips through floats.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::model::{AccountSummary, DailyCostFact, DimensionTotal, GroupBy};

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS daily_costs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    date TEXT NOT NULL,
    account_id TEXT NOT NULL,
    account_name TEXT NOT NULL,
    service TEXT NOT NULL,
    cost TEXT NOT NULL,
    currency TEXT NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(date, account_id, service)
);
CREATE INDEX IF NOT EXISTS idx_daily_costs_date ON daily_costs(date);
CREATE INDEX IF NOT EXISTS idx_daily_costs_account ON daily_costs(account_id);
";

const UPSERT_SQL: &str = "
INSERT INTO daily_costs (date, account_id, account_name, service, cost, currency)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(date, account_id, service) DO UPDATE SET
    account_name = excluded.account_name,
    cost = excluded.cost,
    currency = excluded.currency
";

/// Errors surfaced by the cost store. The store never retries.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt value in column '{column}': {value}")]
    CorruptRow { column: &'static str, value: String },

    #[error("Invalid cost fact for {date}: {reason}")]
    InvalidFact { date: NaiveDate, reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Durable table of daily cost facts.
///
/// The connection sits behind a mutex; every write is a single transaction, so
/// readers see either all of an upsert batch or none of it.
pub struct CostStore {
    conn: Mutex<Connection>,
}

impl CostStore {
    /// Open (or create) the store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        tracing::debug!(path = %path.display(), "Opened cost store");
        Self::init(conn)
    }

    /// Private in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Most recent date with any fact, or `None` when the store is empty.
    pub fn latest_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        let conn = self.conn()?;
        let latest: Option<String> =
            conn.query_row("SELECT MAX(date) FROM daily_costs", [], |row| row.get(0))?;
        latest.as_deref().map(parse_date).transpose()
    }

    /// Earliest and latest stored dates.
    pub fn date_span(&self) -> Result<Option<(NaiveDate, NaiveDate)>, StoreError> {
        let conn = self.conn()?;
        let span: (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(date), MAX(date) FROM daily_costs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        match span {
            (Some(first), Some(last)) => Ok(Some((parse_date(&first)?, parse_date(&last)?))),
            _ => Ok(None),
        }
    }

    /// Number of stored facts.
    pub fn fact_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM daily_costs", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Every day in `[from, to]` with no facts, ascending. Empty when
    /// `from > to`.
    pub fn missing_dates(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<NaiveDate>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }

        let existing = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT DISTINCT date FROM daily_costs WHERE date >= ?1 AND date <= ?2",
            )?;
            let rows = stmt.query_map(params![format_date(from), format_date(to)], |row| {
                row.get::<_, String>(0)
            })?;
            let mut existing = HashSet::new();
            for date in rows {
                existing.insert(parse_date(&date?)?);
            }
            existing
        };

        Ok(from
            .iter_days()
            .take_while(|day| *day <= to)
            .filter(|day| !existing.contains(day))
            .collect())
    }

    /// Insert or overwrite `facts` in one transaction.
    ///
    /// On a key collision the non-key fields are replaced. The whole batch is
    /// validated before anything is written; any failure rolls back every row.
    /// Returns the number of facts applied.
    pub fn upsert(&self, facts: &[DailyCostFact]) -> Result<usize, StoreError> {
        if facts.is_empty() {
            return Ok(0);
        }
        for fact in facts {
            validate_fact(fact)?;
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
            for fact in facts {
                stmt.execute(params![
                    format_date(fact.date),
                    fact.account_id,
                    fact.account_name,
                    fact.service,
                    fact.cost.normalize().to_string(),
                    fact.currency,
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(facts = facts.len(), "Upserted cost facts");
        Ok(facts.len())
    }

    /// All facts dated within `[from, to]`, ordered by date, account, service.
    ///
    /// With `include_credits == false`, credits and refunds are left out.
    pub fn query(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        include_credits: bool,
    ) -> Result<Vec<DailyCostFact>, StoreError> {
        let mut facts = self.scan(from, to)?;
        if !include_credits {
            facts.retain(|fact| !fact.is_credit());
        }
        Ok(facts)
    }

    /// Sum of cost over [`CostStore::query`]; zero for an empty range.
    ///
    /// Sums here and in the other aggregates saturate at the `Decimal` bounds.
    pub fn total_for_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        include_credits: bool,
    ) -> Result<Decimal, StoreError> {
        Ok(self
            .query(from, to, include_credits)?
            .iter()
            .fold(Decimal::ZERO, |total, fact| total.saturating_add(fact.cost)))
    }

    /// Per-day totals, ascending by date. Days without facts are absent.
    pub fn daily_totals(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        include_credits: bool,
    ) -> Result<Vec<(NaiveDate, Decimal)>, StoreError> {
        let mut totals: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
        for fact in self.query(from, to, include_credits)? {
            let total = totals.entry(fact.date).or_default();
            *total = total.saturating_add(fact.cost);
        }
        Ok(totals.into_iter().collect())
    }

    /// Totals per account or per service, each with a breakdown along the
    /// other dimension.
    ///
    /// Grouped by account, entries are keyed by account id and labelled with
    /// the most recent account name seen in the range.
    pub fn dimension_summaries(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        include_credits: bool,
        group_by: GroupBy,
    ) -> Result<BTreeMap<String, DimensionTotal>, StoreError> {
        let mut groups: BTreeMap<String, DimensionTotal> = BTreeMap::new();
        for fact in self.query(from, to, include_credits)? {
            let (key, label, sub_key) = match group_by {
                GroupBy::Account => (fact.account_id, fact.account_name, fact.service),
                GroupBy::Service => (fact.service.clone(), fact.service, fact.account_id),
            };
            let entry = groups.entry(key).or_default();
            entry.label = label;
            entry.total = entry.total.saturating_add(fact.cost);
            let part = entry.breakdown.entry(sub_key).or_default();
            *part = part.saturating_add(fact.cost);
        }
        Ok(groups)
    }

    /// Per-account totals with service breakdown, largest total first.
    pub fn account_summaries(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        include_credits: bool,
    ) -> Result<Vec<AccountSummary>, StoreError> {
        let mut summaries: Vec<AccountSummary> = self
            .dimension_summaries(from, to, include_credits, GroupBy::Account)?
            .into_iter()
            .map(|(account_id, group)| AccountSummary {
                account_id,
                account_name: group.label,
                total_cost: group.total,
                cost_by_service: group.breakdown,
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.total_cost
                .cmp(&a.total_cost)
                .then_with(|| a.account_id.cmp(&b.account_id))
        });
        Ok(summaries)
    }

    /// Sum of `|cost|` over credit facts in `[from, to]`, independent of any
    /// credits toggle.
    pub fn credits_for_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Decimal, StoreError> {
        Ok(self
            .scan(from, to)?
            .iter()
            .filter(|fact| fact.is_credit())
            .fold(Decimal::ZERO, |total, fact| total.saturating_add(fact.cost.abs())))
    }

    fn scan(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyCostFact>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT date, account_id, account_name, service, cost, currency
             FROM daily_costs
             WHERE date >= ?1 AND date <= ?2
             ORDER BY date, account_id, service",
        )?;
        let mut rows = stmt.query(params![format_date(from), format_date(to)])?;
        let mut facts = Vec::new();
        while let Some(row) = rows.next()? {
            facts.push(fact_from_row(row)?);
        }
        Ok(facts)
    }
}

fn fact_from_row(row: &Row<'_>) -> Result<DailyCostFact, StoreError> {
    let date: String = row.get(0)?;
    Ok(DailyCostFact {
        date: parse_date(&date)?,
        account_id: row.get(1)?,
        account_name: row.get(2)?,
        service: row.get(3)?,
        cost: decimal_from_sql(row.get_ref(4)?)?,
        currency: row.get(5)?,
    })
}

fn decimal_from_sql(value: ValueRef<'_>) -> Result<Decimal, StoreError> {
    let corrupt = |value: String| StoreError::CorruptRow {
        column: "cost",
        value,
    };
    match value {
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            text.trim().parse().map_err(|_| corrupt(text.into_owned()))
        }
        ValueRef::Integer(i) => Ok(Decimal::from(i)),
        ValueRef::Real(f) => Decimal::try_from(f).map_err(|_| corrupt(f.to_string())),
        ValueRef::Null => Err(corrupt("NULL".to_string())),
        ValueRef::Blob(_) => Err(corrupt("<blob>".to_string())),
    }
}

fn validate_fact(fact: &DailyCostFact) -> Result<(), StoreError> {
    let reason = if fact.account_id.trim().is_empty() {
        "empty account id"
    } else if fact.service.trim().is_empty() {
        "empty service"
    } else {
        return Ok(());
    };
    Err(StoreError::InvalidFact {
        date: fact.date,
        reason: reason.to_string(),
    })
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(value: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| StoreError::CorruptRow {
        column: "date",
        value: value.to_string(),
    })
}
