//! Batch pipeline: aggregate, score, then cluster

use crate::aggregate::{aggregate_customers, CustomerRfm};
use crate::config::PipelineConfig;
use crate::data::TransactionTable;
use crate::error::{Result, RfmError};
use crate::model::{assign_segments, SegmentModel};
use crate::scoring::{score_customers, ScoreThresholds};
use chrono::NaiveDateTime;
use std::time::Instant;
use tracing::{info, warn};

/// Outcome of one pipeline run
#[derive(Debug)]
pub struct RfmRun {
    /// Scored customers, sorted by id, with a cluster when clustering succeeded
    pub customers: Vec<CustomerRfm>,
    pub reference_date: NaiveDateTime,
    /// Customers left out for lack of a valid transaction date
    pub excluded: Vec<String>,
    pub thresholds: ScoreThresholds,
    pub segments: Option<SegmentModel>,
    /// Why clustering failed, when partial results were allowed
    pub clustering_error: Option<RfmError>,
}

impl RfmRun {
    pub fn is_complete(&self) -> bool {
        self.segments.is_some()
    }
}

/// Run aggregation, scoring and clustering over one transaction snapshot
///
/// Aggregation and scoring errors always stop the run. A clustering
/// failure stops it too, unless `config.allow_partial` is set; the run
/// then carries the error and every customer keeps `cluster = None`.
pub fn run_pipeline(table: &TransactionTable, config: &PipelineConfig) -> Result<RfmRun> {
    let start = Instant::now();

    let aggregation = aggregate_customers(table, &config.aggregate)?;
    let mut customers = aggregation.customers;

    config.clustering.validate(customers.len())?;

    let thresholds = score_customers(&mut customers, config.quantile_method)?;
    info!(customers = customers.len(), "scored customers");

    let (segments, clustering_error) = match assign_segments(&mut customers, &config.clustering)
    {
        Ok(model) => (Some(model), None),
        Err(err) if config.allow_partial => {
            warn!(error = %err, "clustering failed, emitting scores without clusters");
            for customer in &mut customers {
                customer.cluster = None;
            }
            (None, Some(err))
        }
        Err(err) => return Err(err),
    };

    info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        complete = segments.is_some(),
        "pipeline finished"
    );

    Ok(RfmRun {
        customers,
        reference_date: aggregation.reference_date,
        excluded: aggregation.excluded,
        thresholds,
        segments,
        clustering_error,
    })
}
