//! Cost facts and the comparison records derived from them.
//!
//! `DailyCostFact` is the only persisted shape. Everything else in this module
//! is computed on read by [`crate::analysis::CostAnalysis`] and never stored.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Service-name markers that flag a line item as a credit or refund.
const CREDIT_MARKERS: [&str; 2] = ["credit", "refund"];

/// One (date, account, service) cost observation.
///
/// Keyed by `(date, account_id, service)`. Re-ingesting the same key replaces
/// `account_name`, `cost` and `currency`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCostFact {
    pub date: NaiveDate,
    pub account_id: String,
    /// Display name; denormalized and may change between syncs.
    pub account_name: String,
    pub service: String,
    pub cost: Decimal,
    pub currency: String,
}

impl DailyCostFact {
    pub fn new(
        date: NaiveDate,
        account_id: impl Into<String>,
        account_name: impl Into<String>,
        service: impl Into<String>,
        cost: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            date,
            account_id: account_id.into(),
            account_name: account_name.into(),
            service: service.into(),
            cost,
            currency: currency.into(),
        }
    }

    /// Whether this fact counts as a credit/refund rather than spend.
    pub fn is_credit(&self) -> bool {
        is_credit(&self.service, self.cost)
    }
}

/// Credit heuristic shared by every credit-aware query.
///
/// A fact is a credit when its service name mentions a credit or refund, or
/// when its cost is negative. Either condition alone is enough.
pub fn is_credit(service: &str, cost: Decimal) -> bool {
    if cost < Decimal::ZERO {
        return true;
    }
    let service = service.to_ascii_lowercase();
    CREDIT_MARKERS.iter().any(|marker| service.contains(marker))
}

/// Percentage change from `previous` to `current`.
///
/// With a zero `previous` the change is 100 when `current` is non-zero and 0
/// otherwise. Results outside the `Decimal` range saturate at its bounds.
pub fn percentage_change(current: Decimal, previous: Decimal) -> Decimal {
    if !previous.is_zero() {
        let diff = current.saturating_sub(previous);
        match diff.checked_div(previous) {
            Some(ratio) => ratio.saturating_mul(Decimal::ONE_HUNDRED),
            None if diff.is_sign_negative() != previous.is_sign_negative() => Decimal::MIN,
            None => Decimal::MAX,
        }
    } else if !current.is_zero() {
        Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    }
}

/// Dimension used to group facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Account,
    Service,
}

impl std::fmt::Display for GroupBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Account => write!(f, "account"),
            Self::Service => write!(f, "service"),
        }
    }
}

/// Current vs. previous period totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonResult {
    pub label: String,
    pub current: Decimal,
    pub previous: Decimal,
    pub difference: Decimal,
    pub percentage_change: Decimal,
}

impl ComparisonResult {
    pub fn new(label: impl Into<String>, current: Decimal, previous: Decimal) -> Self {
        Self {
            label: label.into(),
            current,
            previous,
            difference: current.saturating_sub(previous),
            percentage_change: percentage_change(current, previous),
        }
    }

    pub fn is_up(&self) -> bool {
        self.difference >= Decimal::ZERO
    }
}

/// This month vs. last month for one day-of-month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayComparison {
    /// 1-based day of month.
    pub day_of_month: u32,
    pub this_month: Decimal,
    pub last_month: Decimal,
    pub difference: Decimal,
    pub percentage_change: Decimal,
}

impl DayComparison {
    pub fn new(day_of_month: u32, this_month: Decimal, last_month: Decimal) -> Self {
        Self {
            day_of_month,
            this_month,
            last_month,
            difference: this_month.saturating_sub(last_month),
            percentage_change: percentage_change(this_month, last_month),
        }
    }
}

/// Per-account total with a service breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountSummary {
    pub account_id: String,
    pub account_name: String,
    pub total_cost: Decimal,
    pub cost_by_service: BTreeMap<String, Decimal>,
}

/// Total for one dimension value over a date range, as grouped by the store.
///
/// For [`GroupBy::Account`] the key is the account id, `label` the account name
/// and `breakdown` is keyed by service. For [`GroupBy::Service`] the key and
/// `label` are the service name and `breakdown` is keyed by account id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DimensionTotal {
    pub label: String,
    pub total: Decimal,
    pub breakdown: BTreeMap<String, Decimal>,
}

/// One service or account compared across the four analysis windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimensionSummary {
    pub name: String,
    pub mtd_cost: Decimal,
    pub last_month_same_day_cost: Decimal,
    pub mtd_change_percent: Decimal,
    pub mtd_is_up: bool,
    pub rolling_30_cost: Decimal,
    pub previous_30_cost: Decimal,
    pub rolling_change_percent: Decimal,
    pub rolling_is_up: bool,
}

impl DimensionSummary {
    pub fn new(
        name: impl Into<String>,
        mtd_cost: Decimal,
        last_month_same_day_cost: Decimal,
        rolling_30_cost: Decimal,
        previous_30_cost: Decimal,
    ) -> Self {
        Self {
            name: name.into(),
            mtd_cost,
            last_month_same_day_cost,
            mtd_change_percent: percentage_change(mtd_cost, last_month_same_day_cost),
            mtd_is_up: mtd_cost >= last_month_same_day_cost,
            rolling_30_cost,
            previous_30_cost,
            rolling_change_percent: percentage_change(rolling_30_cost, previous_30_cost),
            rolling_is_up: rolling_30_cost >= previous_30_cost,
        }
    }
}

/// Credits (absolute value) month-to-date vs. the whole of last month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreditsSummary {
    pub mtd_credits: Decimal,
    pub last_month_credits: Decimal,
}

/// Display labels for the four comparison windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateRanges {
    pub mtd: String,
    pub last_month_to_date: String,
    pub rolling_30: String,
    pub previous_30: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_credit_by_service_name() {
        assert!(is_credit("Refund Credit", dec("10")));
        assert!(is_credit("AWS Credits", dec("0")));
        assert!(is_credit("Tax refund", dec("1.5")));
        assert!(!is_credit("Amazon Elastic Compute Cloud - Compute", dec("5")));
    }

    #[test]
    fn test_credit_by_negative_cost() {
        assert!(is_credit("EC2", dec("-0.01")));
        assert!(!is_credit("EC2", dec("0")));
        assert!(!is_credit("EC2", dec("-0")));
    }

    #[test]
    fn test_percentage_change_zero_denominator() {
        assert_eq!(percentage_change(dec("0"), dec("0")), dec("0"));
        assert_eq!(percentage_change(dec("50"), dec("0")), dec("100"));
        assert_eq!(percentage_change(dec("-5"), dec("0")), dec("100"));
        assert_eq!(percentage_change(dec("50"), dec("100")), dec("-50"));
        assert_eq!(percentage_change(dec("150"), dec("100")), dec("50"));
    }

    #[test]
    fn test_percentage_change_saturates_on_tiny_previous() {
        let tiny = dec("0.0000000000000000001");
        assert_eq!(percentage_change(dec("100000000000"), tiny), Decimal::MAX);
        assert_eq!(percentage_change(dec("-100000000000"), tiny), Decimal::MIN);
        assert_eq!(percentage_change(Decimal::MAX, dec("1")), Decimal::MAX);

        let wide = ComparisonResult::new("MTD", Decimal::MAX, Decimal::MIN);
        assert_eq!(wide.difference, Decimal::MAX);
        assert!(wide.is_up());
    }

    #[test]
    fn test_comparison_result_direction() {
        let up = ComparisonResult::new("MTD", dec("12"), dec("10"));
        assert_eq!(up.difference, dec("2"));
        assert_eq!(up.percentage_change, dec("20"));
        assert!(up.is_up());

        let down = ComparisonResult::new("MTD", dec("5"), dec("10"));
        assert_eq!(down.difference, dec("-5"));
        assert!(!down.is_up());
    }

    #[test]
    fn test_dimension_summary_flags() {
        let s = DimensionSummary::new("EC2", dec("10"), dec("0"), dec("30"), dec("40"));
        assert_eq!(s.mtd_change_percent, dec("100"));
        assert!(s.mtd_is_up);
        assert_eq!(s.rolling_change_percent, dec("-25"));
        assert!(!s.rolling_is_up);
    }
}
