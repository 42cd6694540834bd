//! Per-customer Recency, Frequency and Monetary aggregation

use crate::config::AggregateOptions;
use crate::data::{TransactionTable, AMOUNT, CUSTOMER_ID, TIMESTAMP_MS, TRANSACTION_ID};
use crate::error::{Result, RfmError};
use crate::scoring::ScoreSet;
use chrono::{DateTime, Duration, NaiveDateTime};
use polars::prelude::*;
use tracing::{info, warn};

/// One row per distinct customer
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerRfm {
    pub customer_id: String,
    /// Whole days since the customer's last transaction, plus one
    pub recency: i64,
    /// Number of distinct transaction ids
    pub frequency: u32,
    /// Sum of all transaction amounts
    pub monetary: f64,
    /// Filled in by [`crate::scoring::score_customers`]
    pub scores: Option<ScoreSet>,
    /// Filled in by [`crate::model::assign_segments`]
    pub cluster: Option<usize>,
}

impl CustomerRfm {
    pub fn new(customer_id: impl Into<String>, recency: i64, frequency: u32, monetary: f64) -> Self {
        Self {
            customer_id: customer_id.into(),
            recency,
            frequency,
            monetary,
            scores: None,
            cluster: None,
        }
    }
}

/// Result of collapsing the transaction table
#[derive(Debug, Clone)]
pub struct Aggregation {
    /// Customers sorted by id
    pub customers: Vec<CustomerRfm>,
    /// Date recency is measured from
    pub reference_date: NaiveDateTime,
    /// Customers dropped because none of their transactions had a valid date
    pub excluded: Vec<String>,
}

/// Collapse transactions into one RFM record per customer
///
/// The reference date is the latest valid transaction date in the whole
/// table unless `options.reference_date` overrides it. Customers with
/// missing or unparseable dates fail the aggregation, or are handled
/// leniently when `options.skip_invalid_dates` is set: recency then comes
/// from the valid dates only and customers without any are excluded.
pub fn aggregate_customers(
    table: &TransactionTable,
    options: &AggregateOptions,
) -> Result<Aggregation> {
    if table.is_empty() {
        return Err(RfmError::EmptyInput(
            "transaction table has no rows".to_string(),
        ));
    }

    let reference_ms = match options.reference_date {
        Some(reference) => reference.and_utc().timestamp_millis(),
        None => table.latest_timestamp_ms()?.ok_or_else(|| {
            RfmError::integrity("(all customers)", "no transaction has a valid date")
        })?,
    };
    let reference_date = DateTime::from_timestamp_millis(reference_ms)
        .map(|date| date.naive_utc())
        .ok_or_else(|| RfmError::Config(format!("reference date {reference_ms}ms is out of range")))?;

    let grouped = table
        .frame()
        .clone()
        .lazy()
        .group_by([col(CUSTOMER_ID)])
        .agg([
            col(TIMESTAMP_MS).max().alias("last_seen_ms"),
            col(TIMESTAMP_MS).null_count().alias("missing_dates"),
            col(TRANSACTION_ID).n_unique().alias("frequency"),
            col(AMOUNT).sum().alias("monetary"),
        ])
        .collect()?;

    let ids = grouped.column(CUSTOMER_ID)?.str()?;
    let last_seen = grouped.column("last_seen_ms")?.i64()?;
    let missing = grouped.column("missing_dates")?.cast(&DataType::Int64)?;
    let missing = missing.i64()?;
    let frequency = grouped.column("frequency")?.cast(&DataType::Int64)?;
    let frequency = frequency.i64()?;
    let monetary = grouped.column("monetary")?.cast(&DataType::Float64)?;
    let monetary = monetary.f64()?;

    let mut customers = Vec::with_capacity(grouped.height());
    let mut excluded = Vec::new();

    for i in 0..grouped.height() {
        let Some(customer_id) = ids.get(i) else {
            continue;
        };

        let missing_dates = missing.get(i).unwrap_or(0);
        if missing_dates > 0 && !options.skip_invalid_dates {
            return Err(RfmError::integrity(
                customer_id,
                format!("{missing_dates} transaction(s) have a missing or unparseable date"),
            ));
        }

        let Some(last_ms) = last_seen.get(i) else {
            warn!(customer_id, "excluding customer without a valid transaction date");
            excluded.push(customer_id.to_string());
            continue;
        };
        if missing_dates > 0 {
            warn!(
                customer_id,
                missing_dates, "recency computed from valid transaction dates only"
            );
        }

        let elapsed = reference_ms - last_ms;
        if elapsed < 0 {
            return Err(RfmError::integrity(
                customer_id,
                format!("last transaction is after the reference date {reference_date}"),
            ));
        }
        let recency = Duration::milliseconds(elapsed).num_days() + 1;

        let count = frequency.get(i).unwrap_or(0);
        let count = u32::try_from(count)
            .ok()
            .filter(|&count| count > 0)
            .ok_or_else(|| {
                RfmError::integrity(customer_id, format!("invalid transaction count {count}"))
            })?;

        customers.push(CustomerRfm::new(
            customer_id,
            recency,
            count,
            monetary.get(i).unwrap_or(0.0),
        ));
    }

    if customers.is_empty() {
        return Err(RfmError::EmptyInput(
            "no customer has a valid transaction date".to_string(),
        ));
    }

    customers.sort_by(|a, b| a.customer_id.cmp(&b.customer_id));

    info!(
        customers = customers.len(),
        excluded = excluded.len(),
        reference_date = %reference_date,
        "aggregated RFM metrics"
    );

    Ok(Aggregation {
        customers,
        reference_date,
        excluded,
    })
}
