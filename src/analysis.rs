//! Period-over-period comparisons computed on read from the [`CostStore`].
//!
//! Every figure is derived fresh from the store for the clock's "today"; the
//! only state is the credits-inclusion toggle. Identical store contents, date
//! and toggle always give identical output.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::clock::ClockRef;
use crate::events::Notifier;
use crate::model::{
    AccountSummary, ComparisonResult, CreditsSummary, DateRanges, DayComparison,
    DimensionSummary, GroupBy,
};
use crate::store::{CostStore, StoreError};
use crate::windows::{DateWindow, Windows};

const MONTH_TO_DATE_LABEL: &str = "Month-to-Date";

/// Which calendar month [`CostAnalysis::account_summaries`] covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountPeriod {
    /// First of this month through today.
    ThisMonth,
    /// The whole of last month.
    LastMonth,
}

/// Headline figures in one serializable bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardReport {
    pub today: NaiveDate,
    pub include_credits: bool,
    pub month_to_date: ComparisonResult,
    pub full_month: ComparisonResult,
    pub credits: CreditsSummary,
    pub top_account: Option<AccountSummary>,
    pub date_ranges: DateRanges,
}

pub struct CostAnalysis {
    store: Arc<CostStore>,
    clock: ClockRef,
    include_credits: AtomicBool,
    notifier: Option<Notifier>,
}

impl CostAnalysis {
    /// Credits are included by default.
    pub fn new(store: Arc<CostStore>, clock: ClockRef) -> Self {
        Self {
            store,
            clock,
            include_credits: AtomicBool::new(true),
            notifier: None,
        }
    }

    /// Publish `CreditsToggled` whenever the toggle actually changes.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn include_credits(&self) -> bool {
        self.include_credits.load(Ordering::SeqCst)
    }

    pub fn set_include_credits(&self, include: bool) {
        let previous = self.include_credits.swap(include, Ordering::SeqCst);
        if previous != include {
            self.notify_toggle(include);
        }
    }

    /// Flip the toggle and return the new value.
    pub fn toggle_credits(&self) -> bool {
        let include = !self.include_credits.fetch_xor(true, Ordering::SeqCst);
        self.notify_toggle(include);
        include
    }

    fn notify_toggle(&self, include: bool) {
        tracing::debug!(include_credits = include, "Credits toggle changed");
        if let Some(notifier) = &self.notifier {
            notifier.credits_toggled(include);
        }
    }

    /// Windows for the clock's current date.
    pub fn windows(&self) -> Windows {
        Windows::for_today(self.clock.today())
    }

    fn total(&self, window: DateWindow) -> Result<Decimal, StoreError> {
        self.store
            .total_for_range(window.start, window.end, self.include_credits())
    }

    /// This month so far vs. last month through the same day-of-month.
    pub fn month_to_date_comparison(&self) -> Result<ComparisonResult, StoreError> {
        let w = self.windows();
        Ok(ComparisonResult::new(
            MONTH_TO_DATE_LABEL,
            self.total(w.month_to_date)?,
            self.total(w.last_month_to_date)?,
        ))
    }

    /// Last complete calendar month vs. the one before it.
    pub fn full_month_comparison(&self) -> Result<ComparisonResult, StoreError> {
        let w = self.windows();
        Ok(ComparisonResult::new(
            w.full_month_label(),
            self.total(w.last_month)?,
            self.total(w.month_before_last)?,
        ))
    }

    /// Day-of-month pairs from day 1 to the last day with data in either month.
    ///
    /// Days without data count as zero rather than being skipped.
    pub fn day_by_day_comparison(&self) -> Result<Vec<DayComparison>, StoreError> {
        let w = self.windows();
        let this_month = self.totals_by_day_of_month(w.month_to_date)?;
        let last_month = self.totals_by_day_of_month(w.last_month)?;

        let max_day = this_month
            .keys()
            .chain(last_month.keys())
            .copied()
            .max()
            .unwrap_or(0);

        Ok((1..=max_day)
            .map(|day| {
                DayComparison::new(
                    day,
                    this_month.get(&day).copied().unwrap_or_default(),
                    last_month.get(&day).copied().unwrap_or_default(),
                )
            })
            .collect())
    }

    fn totals_by_day_of_month(&self, window: DateWindow) -> Result<BTreeMap<u32, Decimal>, StoreError> {
        Ok(self
            .store
            .daily_totals(window.start, window.end, self.include_credits())?
            .into_iter()
            .map(|(date, total)| (date.day(), total))
            .collect())
    }

    /// Per-account totals and service breakdown, largest first.
    pub fn account_summaries(&self, period: AccountPeriod) -> Result<Vec<AccountSummary>, StoreError> {
        let w = self.windows();
        let window = match period {
            AccountPeriod::ThisMonth => w.month_to_date,
            AccountPeriod::LastMonth => w.last_month,
        };
        self.store
            .account_summaries(window.start, window.end, self.include_credits())
    }

    /// Account with the largest spend this month, if any.
    pub fn top_account(&self) -> Result<Option<AccountSummary>, StoreError> {
        Ok(self
            .account_summaries(AccountPeriod::ThisMonth)?
            .into_iter()
            .next())
    }

    /// MTD and rolling 30-day comparison for every service or account seen in
    /// any of the four windows, in ascending name order.
    ///
    /// Accounts are grouped by display name.
    pub fn dimension_comparison(&self, group_by: GroupBy) -> Result<Vec<DimensionSummary>, StoreError> {
        let w = self.windows();
        let mtd = self.totals_by_name(w.month_to_date, group_by)?;
        let last_same_day = self.totals_by_name(w.last_month_to_date, group_by)?;
        let rolling = self.totals_by_name(w.rolling_30, group_by)?;
        let previous = self.totals_by_name(w.previous_30, group_by)?;

        let names: BTreeSet<&String> = mtd
            .keys()
            .chain(last_same_day.keys())
            .chain(rolling.keys())
            .chain(previous.keys())
            .collect();

        let lookup = |totals: &BTreeMap<String, Decimal>, name: &str| {
            totals.get(name).copied().unwrap_or_default()
        };

        Ok(names
            .into_iter()
            .map(|name| {
                let name = name.as_str();
                DimensionSummary::new(
                    name,
                    lookup(&mtd, name),
                    lookup(&last_same_day, name),
                    lookup(&rolling, name),
                    lookup(&previous, name),
                )
            })
            .collect())
    }

    fn totals_by_name(
        &self,
        window: DateWindow,
        group_by: GroupBy,
    ) -> Result<BTreeMap<String, Decimal>, StoreError> {
        let groups = self.store.dimension_summaries(
            window.start,
            window.end,
            self.include_credits(),
            group_by,
        )?;
        let mut totals: BTreeMap<String, Decimal> = BTreeMap::new();
        for group in groups.into_values() {
            let total = totals.entry(group.label).or_default();
            *total = total.saturating_add(group.total);
        }
        Ok(totals)
    }

    /// Per-service comparison, highest month-to-date cost first.
    pub fn service_comparison(&self) -> Result<Vec<DimensionSummary>, StoreError> {
        self.dimension_comparison(GroupBy::Service)
            .map(sort_by_mtd_descending)
    }

    /// Per-account comparison, highest month-to-date cost first.
    pub fn account_comparison(&self) -> Result<Vec<DimensionSummary>, StoreError> {
        self.dimension_comparison(GroupBy::Account)
            .map(sort_by_mtd_descending)
    }

    /// Credits this month so far vs. the whole of last month. Ignores the
    /// credits toggle.
    pub fn credits_summary(&self) -> Result<CreditsSummary, StoreError> {
        let w = self.windows();
        Ok(CreditsSummary {
            mtd_credits: self
                .store
                .credits_for_range(w.month_to_date.start, w.month_to_date.end)?,
            last_month_credits: self
                .store
                .credits_for_range(w.last_month.start, w.last_month.end)?,
        })
    }

    pub fn date_ranges(&self) -> DateRanges {
        self.windows().date_ranges()
    }

    pub fn dashboard(&self) -> Result<DashboardReport, StoreError> {
        let w = self.windows();
        Ok(DashboardReport {
            today: w.today,
            include_credits: self.include_credits(),
            month_to_date: self.month_to_date_comparison()?,
            full_month: self.full_month_comparison()?,
            credits: self.credits_summary()?,
            top_account: self.top_account()?,
            date_ranges: w.date_ranges(),
        })
    }
}

fn sort_by_mtd_descending(mut rows: Vec<DimensionSummary>) -> Vec<DimensionSummary> {
    rows.sort_by(|a, b| b.mtd_cost.cmp(&a.mtd_cost).then_with(|| a.name.cmp(&b.name)));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::events::CostEvent;
    use crate::model::DailyCostFact;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn fact(date: NaiveDate, account: &str, name: &str, service: &str, cost: &str) -> DailyCostFact {
        DailyCostFact::new(date, account, name, service, dec(cost), "USD")
    }

    fn analysis_with(facts: &[DailyCostFact], today: NaiveDate) -> CostAnalysis {
        let store = Arc::new(CostStore::open_in_memory().unwrap());
        store.upsert(facts).unwrap();
        CostAnalysis::new(store, Arc::new(FixedClock(today)))
    }

    #[test]
    fn test_month_to_date_comparison() {
        let analysis = analysis_with(
            &[
                fact(d(2024, 3, 1), "1", "Prod", "EC2", "50"),
                fact(d(2024, 3, 15), "1", "Prod", "EC2", "25"),
                fact(d(2024, 2, 15), "1", "Prod", "EC2", "100"),
                // After last month's same day: outside the comparison.
                fact(d(2024, 2, 16), "1", "Prod", "EC2", "1000"),
            ],
            d(2024, 3, 15),
        );

        let mtd = analysis.month_to_date_comparison().unwrap();
        assert_eq!(mtd.label, "Month-to-Date");
        assert_eq!(mtd.current, dec("75"));
        assert_eq!(mtd.previous, dec("100"));
        assert_eq!(mtd.difference, dec("-25"));
        assert_eq!(mtd.percentage_change, dec("-25"));
        assert!(!mtd.is_up());
    }

    #[test]
    fn test_full_month_comparison() {
        let analysis = analysis_with(
            &[
                fact(d(2024, 2, 29), "1", "Prod", "EC2", "60"),
                fact(d(2024, 1, 1), "1", "Prod", "EC2", "40"),
            ],
            d(2024, 3, 15),
        );

        let full = analysis.full_month_comparison().unwrap();
        assert_eq!(full.label, "February vs January");
        assert_eq!(full.current, dec("60"));
        assert_eq!(full.previous, dec("40"));
        assert_eq!(full.percentage_change, dec("50"));
    }

    #[test]
    fn test_zero_denominator_policy() {
        let analysis = analysis_with(&[], d(2024, 3, 15));
        let mtd = analysis.month_to_date_comparison().unwrap();
        assert_eq!(mtd.percentage_change, Decimal::ZERO);

        let analysis = analysis_with(&[fact(d(2024, 3, 2), "1", "Prod", "EC2", "50")], d(2024, 3, 15));
        let mtd = analysis.month_to_date_comparison().unwrap();
        assert_eq!(mtd.percentage_change, dec("100"));
    }

    #[test]
    fn test_day_by_day_spans_longest_month_with_data() {
        let mut facts: Vec<_> = (1..=15)
            .map(|day| fact(d(2024, 8, day), "1", "Prod", "EC2", "2"))
            .collect();
        facts.extend((1..=31).map(|day| fact(d(2024, 7, day), "1", "Prod", "EC2", "1")));
        let analysis = analysis_with(&facts, d(2024, 8, 15));

        let days = analysis.day_by_day_comparison().unwrap();
        assert_eq!(days.len(), 31);
        assert_eq!(days[0].day_of_month, 1);
        assert_eq!(days[0].this_month, dec("2"));
        assert_eq!(days[0].percentage_change, dec("100"));
        for day in &days[15..] {
            assert_eq!(day.this_month, Decimal::ZERO);
            assert_eq!(day.last_month, dec("1"));
            assert_eq!(day.percentage_change, dec("-100"));
        }
    }

    #[test]
    fn test_day_by_day_zero_fills_gaps() {
        let analysis = analysis_with(
            &[
                fact(d(2024, 3, 1), "1", "Prod", "EC2", "5"),
                fact(d(2024, 3, 4), "1", "Prod", "EC2", "5"),
            ],
            d(2024, 3, 15),
        );
        let days = analysis.day_by_day_comparison().unwrap();
        assert_eq!(days.len(), 4);
        assert_eq!(days[1].this_month, Decimal::ZERO);
        assert_eq!(days[1].percentage_change, Decimal::ZERO);
    }

    #[test]
    fn test_day_by_day_empty_store() {
        let analysis = analysis_with(&[], d(2024, 3, 15));
        assert!(analysis.day_by_day_comparison().unwrap().is_empty());
    }

    #[test]
    fn test_dimension_comparison_unions_windows() {
        let analysis = analysis_with(
            &[
                fact(d(2024, 3, 10), "1", "Prod", "EC2", "10"),
                // Only in the previous 30-day window.
                fact(d(2024, 1, 20), "1", "Prod", "Lambda", "4"),
                fact(d(2024, 2, 10), "1", "Prod", "EC2", "5"),
            ],
            d(2024, 3, 15),
        );

        let rows = analysis.dimension_comparison(GroupBy::Service).unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["EC2", "Lambda"]);

        let ec2 = &rows[0];
        assert_eq!(ec2.mtd_cost, dec("10"));
        assert_eq!(ec2.last_month_same_day_cost, dec("5"));
        assert_eq!(ec2.mtd_change_percent, dec("100"));
        assert!(ec2.mtd_is_up);
        assert_eq!(ec2.rolling_30_cost, dec("10"));
        assert_eq!(ec2.previous_30_cost, dec("5"));

        let lambda = &rows[1];
        assert_eq!(lambda.mtd_cost, Decimal::ZERO);
        assert_eq!(lambda.rolling_30_cost, Decimal::ZERO);
        assert_eq!(lambda.previous_30_cost, dec("4"));
        assert_eq!(lambda.rolling_change_percent, dec("-100"));
        assert!(!lambda.rolling_is_up);
        // 0 vs 0 counts as up.
        assert!(lambda.mtd_is_up);
    }

    #[test]
    fn test_service_comparison_sorted_by_mtd() {
        let analysis = analysis_with(
            &[
                fact(d(2024, 3, 2), "1", "Prod", "Amazon S3", "3"),
                fact(d(2024, 3, 2), "1", "Prod", "Amazon EC2", "30"),
                fact(d(2024, 3, 2), "1", "Prod", "AWS Lambda", "3"),
            ],
            d(2024, 3, 15),
        );
        let names: Vec<_> = analysis
            .service_comparison()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["Amazon EC2", "AWS Lambda", "Amazon S3"]);
    }

    #[test]
    fn test_account_comparison_groups_by_name() {
        let analysis = analysis_with(
            &[
                fact(d(2024, 3, 2), "1", "Prod", "EC2", "10"),
                fact(d(2024, 3, 2), "2", "Dev", "EC2", "20"),
                fact(d(2024, 3, 3), "2", "Dev", "S3", "1"),
            ],
            d(2024, 3, 15),
        );
        let rows = analysis.account_comparison().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "Dev");
        assert_eq!(rows[0].mtd_cost, dec("21"));
        assert_eq!(rows[1].name, "Prod");
    }

    #[test]
    fn test_account_summaries_by_period() {
        let analysis = analysis_with(
            &[
                fact(d(2024, 3, 2), "1", "Prod", "EC2", "10"),
                fact(d(2024, 3, 2), "2", "Dev", "EC2", "20"),
                fact(d(2024, 2, 2), "1", "Prod", "EC2", "7"),
            ],
            d(2024, 3, 15),
        );

        let this_month = analysis.account_summaries(AccountPeriod::ThisMonth).unwrap();
        assert_eq!(this_month.len(), 2);
        assert_eq!(this_month[0].account_id, "2");

        let last_month = analysis.account_summaries(AccountPeriod::LastMonth).unwrap();
        assert_eq!(last_month.len(), 1);
        assert_eq!(last_month[0].total_cost, dec("7"));
        assert_eq!(last_month[0].cost_by_service["EC2"], dec("7"));

        assert_eq!(analysis.top_account().unwrap().unwrap().account_name, "Dev");
    }

    #[test]
    fn test_credits_toggle_changes_totals() {
        let analysis = analysis_with(
            &[
                fact(d(2024, 3, 2), "1", "Prod", "EC2", "5"),
                fact(d(2024, 3, 2), "1", "Prod", "Refund Credit", "-10"),
            ],
            d(2024, 3, 15),
        );

        assert!(analysis.include_credits());
        assert_eq!(analysis.month_to_date_comparison().unwrap().current, dec("-5"));

        assert!(!analysis.toggle_credits());
        assert_eq!(analysis.month_to_date_comparison().unwrap().current, dec("5"));

        // Credits summary ignores the toggle.
        let credits = analysis.credits_summary().unwrap();
        assert_eq!(credits.mtd_credits, dec("10"));
        assert_eq!(credits.last_month_credits, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_toggle_publishes_event() {
        let notifier = Notifier::new();
        let mut events = notifier.subscribe();
        let analysis = analysis_with(&[], d(2024, 3, 15)).with_notifier(notifier);

        analysis.set_include_credits(true);
        analysis.set_include_credits(false);

        assert_eq!(
            events.recv().await.unwrap(),
            CostEvent::CreditsToggled {
                include_credits: false
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_dashboard_is_deterministic() {
        let facts = [
            fact(d(2024, 3, 2), "1", "Prod", "EC2", "10.10"),
            fact(d(2024, 2, 2), "1", "Prod", "EC2", "5.05"),
        ];
        let analysis = analysis_with(&facts, d(2024, 3, 15));

        let first = analysis.dashboard().unwrap();
        let second = analysis.dashboard().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.date_ranges.mtd, "Mar 1 - Mar 15");
        assert_eq!(first.month_to_date.percentage_change, dec("100"));
        assert_eq!(first.top_account.unwrap().total_cost, dec("10.10"));
    }
}
