//! Cost Explorer JSON protocol client.
//!
//! Speaks `GetCostAndUsage` / `GetDimensionValues` (`application/x-amz-json-1.1`)
//! against a configured endpoint. Request signing is left to whatever fronts
//! that endpoint; this client sends plain JSON.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{classify_http_status, CostBatch, CostSource, SourceError};
use crate::model::DailyCostFact;

const TARGET_PREFIX: &str = "AWSInsightsIndexService";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const COST_METRIC: &str = "UnblendedCost";
const DEFAULT_CURRENCY: &str = "USD";
/// Account names are looked up over this many days ending at the fetch end.
const ACCOUNT_LOOKUP_DAYS: u64 = 30;

/// Connection settings for [`CostExplorerSource`].
#[derive(Debug, Clone)]
pub struct CostExplorerConfig {
    /// Base URL requests are POSTed to.
    pub endpoint: String,
    /// Credential profile the fronting signer should use (logged only).
    pub profile: String,
    pub region: String,
    pub timeout: Duration,
}

impl CostExplorerConfig {
    /// Settings for the public regional endpoint.
    pub fn for_region(profile: impl Into<String>, region: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            endpoint: format!("https://ce.{}.amazonaws.com/", region),
            profile: profile.into(),
            region,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TimePeriod {
    start: String,
    end: String,
}

impl TimePeriod {
    /// Cost Explorer ranges are end-exclusive.
    fn inclusive(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            start: from.format("%Y-%m-%d").to_string(),
            end: (to + Days::new(1)).format("%Y-%m-%d").to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct GroupDefinition {
    #[serde(rename = "Type")]
    group_type: &'static str,
    #[serde(rename = "Key")]
    key: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetCostAndUsageRequest {
    time_period: TimePeriod,
    granularity: &'static str,
    metrics: Vec<&'static str>,
    group_by: Vec<GroupDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetCostAndUsageResponse {
    #[serde(default)]
    results_by_time: Vec<ResultByTime>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResultByTime {
    #[serde(default)]
    time_period: Option<ResponsePeriod>,
    #[serde(default)]
    groups: Vec<Group>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResponsePeriod {
    start: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Group {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    metrics: HashMap<String, MetricValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetricValue {
    amount: Option<String>,
    unit: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetDimensionValuesRequest {
    time_period: TimePeriod,
    dimension: &'static str,
    context: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetDimensionValuesResponse {
    #[serde(default)]
    dimension_values: Vec<DimensionValue>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DimensionValue {
    value: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

/// A usable upstream row before account names are attached.
#[derive(Debug)]
struct RawCost {
    date: NaiveDate,
    account_id: String,
    service: String,
    amount: Decimal,
    currency: String,
}

/// Cost Explorer client with a per-instance account-name cache.
pub struct CostExplorerSource {
    client: reqwest::Client,
    config: CostExplorerConfig,
    /// `None` until the first lookup; a failed lookup caches an empty map so
    /// the rest of the run falls back to raw account ids.
    account_names: Mutex<Option<HashMap<String, String>>>,
}

impl CostExplorerSource {
    pub fn new(config: CostExplorerConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SourceError::Client(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            account_names: Mutex::new(None),
        })
    }

    async fn call<Req, Resp>(&self, operation: &str, body: &Req) -> Result<Resp, SourceError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body)
            .map_err(|e| SourceError::Decode(format!("Failed to encode {}: {}", operation, e)))?;

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-target", format!("{}.{}", TARGET_PREFIX, operation))
            .body(payload)
            .send()
            .await
            .map_err(|e| SourceError::Transient(format!("{} request failed: {}", operation, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status.as_u16(), body));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| SourceError::Decode(format!("{} response: {}", operation, e)))
    }

    async fn fetch_raw(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<(Vec<RawCost>, usize), SourceError> {
        let mut rows = Vec::new();
        let mut dropped = 0;
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let request = GetCostAndUsageRequest {
                time_period: TimePeriod::inclusive(from, to),
                granularity: "DAILY",
                metrics: vec![COST_METRIC],
                group_by: vec![
                    GroupDefinition {
                        group_type: "DIMENSION",
                        key: "LINKED_ACCOUNT",
                    },
                    GroupDefinition {
                        group_type: "DIMENSION",
                        key: "SERVICE",
                    },
                ],
                next_page_token: page_token.clone(),
            };
            let response: GetCostAndUsageResponse = self.call("GetCostAndUsage", &request).await?;
            pages += 1;

            for result in response.results_by_time {
                let date = result
                    .time_period
                    .as_ref()
                    .and_then(|p| NaiveDate::parse_from_str(&p.start, "%Y-%m-%d").ok());
                for group in result.groups {
                    match (date, parse_group(&group)) {
                        (Some(date), Ok(Some((account_id, service, amount, currency)))) => {
                            rows.push(RawCost {
                                date,
                                account_id,
                                service,
                                amount,
                                currency,
                            });
                        }
                        // Non-positive amounts are not kept.
                        (Some(_), Ok(None)) => {}
                        (None, _) => {
                            dropped += 1;
                            tracing::warn!(
                                keys = ?group.keys,
                                "Dropping cost group with missing or unparseable date"
                            );
                        }
                        (Some(date), Err(reason)) => {
                            dropped += 1;
                            tracing::warn!(%date, keys = ?group.keys, reason, "Dropping malformed cost group");
                        }
                    }
                }
            }

            match next_page("GetCostAndUsage", page_token.as_deref(), response.next_page_token)? {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        tracing::debug!(
            source = self.name(),
            pages,
            rows = rows.len(),
            dropped,
            "Fetched cost pages"
        );
        Ok((rows, dropped))
    }

    /// Display name for `account_id`, falling back to the id itself.
    async fn account_name(&self, account_id: &str, period_end: NaiveDate) -> String {
        let mut cache = self.account_names.lock().await;
        if cache.is_none() {
            let names = match self.load_account_names(period_end).await {
                Ok(names) => names,
                Err(e) => {
                    tracing::warn!(error = %e, "Account name lookup failed; using account ids");
                    HashMap::new()
                }
            };
            *cache = Some(names);
        }
        cache
            .as_ref()
            .and_then(|names| names.get(account_id))
            .cloned()
            .unwrap_or_else(|| account_id.to_string())
    }

    async fn load_account_names(
        &self,
        period_end: NaiveDate,
    ) -> Result<HashMap<String, String>, SourceError> {
        let start = period_end - Days::new(ACCOUNT_LOOKUP_DAYS - 1);
        let mut names = HashMap::new();
        let mut page_token: Option<String> = None;

        loop {
            let request = GetDimensionValuesRequest {
                time_period: TimePeriod::inclusive(start, period_end),
                dimension: "LINKED_ACCOUNT",
                context: "COST_AND_USAGE",
                next_page_token: page_token.clone(),
            };
            let response: GetDimensionValuesResponse =
                self.call("GetDimensionValues", &request).await?;

            for value in response.dimension_values {
                let name = value
                    .attributes
                    .get("description")
                    .filter(|d| !d.trim().is_empty())
                    .cloned()
                    .unwrap_or_else(|| value.value.clone());
                names.insert(value.value, name);
            }

            match next_page("GetDimensionValues", page_token.as_deref(), response.next_page_token)? {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        tracing::debug!(accounts = names.len(), "Loaded account names");
        Ok(names)
    }
}

/// Token for the next page, or `None` when the listing is complete.
///
/// A token equal to the one just sent would loop forever and is a decode error.
fn next_page(
    operation: &str,
    sent: Option<&str>,
    received: Option<String>,
) -> Result<Option<String>, SourceError> {
    match received.filter(|t| !t.is_empty()) {
        Some(next) if sent == Some(next.as_str()) => {
            tracing::warn!(operation, token = %next, "Pagination token did not advance");
            Err(SourceError::Decode(format!(
                "{} pagination token did not advance",
                operation
            )))
        }
        next => Ok(next),
    }
}

/// Extract `(account_id, service, amount, currency)` from a group.
///
/// `Ok(None)` means the group is well-formed but its amount is not positive.
fn parse_group(group: &Group) -> Result<Option<(String, String, Decimal, String)>, &'static str> {
    let (account_id, service) = match group.keys.as_slice() {
        [account_id, service, ..] if !account_id.is_empty() && !service.is_empty() => {
            (account_id.clone(), service.clone())
        }
        _ => return Err("missing account/service keys"),
    };
    let metric = group.metrics.get(COST_METRIC).ok_or("missing cost metric")?;
    let amount: Decimal = metric
        .amount
        .as_deref()
        .ok_or("missing amount")?
        .trim()
        .parse()
        .map_err(|_| "unparseable amount")?;
    if amount <= Decimal::ZERO {
        return Ok(None);
    }
    let currency = metric
        .unit
        .clone()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
    Ok(Some((account_id, service, amount, currency)))
}

#[async_trait]
impl CostSource for CostExplorerSource {
    async fn fetch_daily_costs(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<CostBatch, SourceError> {
        if to < from {
            return Ok(CostBatch::default());
        }
        tracing::debug!(
            endpoint = %self.config.endpoint,
            profile = %self.config.profile,
            region = %self.config.region,
            %from,
            %to,
            "Fetching daily costs"
        );

        let (rows, dropped) = self.fetch_raw(from, to).await?;
        let mut facts = Vec::with_capacity(rows.len());
        for row in rows {
            let account_name = self.account_name(&row.account_id, to).await;
            facts.push(DailyCostFact {
                date: row.date,
                account_id: row.account_id,
                account_name,
                service: row.service,
                cost: row.amount,
                currency: row.currency,
            });
        }

        Ok(CostBatch { facts, dropped })
    }

    fn name(&self) -> &str {
        "cost-explorer"
    }
}
