//! Command-line interface definitions and configuration resolution

use crate::config::{
    AggregateOptions, ClusterConfig, FileConfig, LabelOrder, LoadOptions, PipelineConfig,
    QuantileMethod,
};
use crate::data::parse_timestamp;
use crate::error::{Result, RfmError};
use clap::Parser;
use std::ops::RangeInclusive;
use std::path::PathBuf;

/// RFM customer segmentation: quartile scores and K-Means clusters from transactions
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the input transactions CSV file
    #[arg(short, long, env = "RFM_INPUT")]
    pub input: PathBuf,

    /// Output path for the per-customer RFM table
    #[arg(short, long, default_value = "rfm_clusters.csv", env = "RFM_OUTPUT")]
    pub output: PathBuf,

    /// Optional output path for the per-cluster summary table
    #[arg(long, env = "RFM_SUMMARY")]
    pub summary: Option<PathBuf>,

    /// TOML configuration file; command-line flags override its values
    #[arg(short, long, env = "RFM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of clusters for K-Means [default: 3]
    #[arg(short = 'k', long, env = "RFM_CLUSTERS")]
    pub clusters: Option<usize>,

    /// Random seed for K-Means initialization [default: 42]
    #[arg(long, env = "RFM_SEED")]
    pub seed: Option<u64>,

    /// Extra clustering attempts with the following seeds when a fit fails
    #[arg(long, env = "RFM_SEED_RETRIES")]
    pub seed_retries: Option<u32>,

    /// Quantile interpolation for score thresholds [default: linear]
    #[arg(long, value_enum, env = "RFM_QUANTILE_METHOD")]
    pub quantile_method: Option<QuantileMethod>,

    /// Cluster numbering [default: recency]
    #[arg(long, value_enum, env = "RFM_LABEL_ORDER")]
    pub label_order: Option<LabelOrder>,

    /// Maximum iterations for K-Means [default: 300]
    #[arg(long, env = "RFM_MAX_ITERS")]
    pub max_iters: Option<u64>,

    /// Tolerance for K-Means convergence [default: 1e-4]
    #[arg(long, env = "RFM_TOLERANCE")]
    pub tolerance: Option<f64>,

    /// Number of K-Means initializations per seed [default: 10]
    #[arg(long, env = "RFM_N_RUNS")]
    pub n_runs: Option<usize>,

    /// Date recency is measured from [default: latest transaction date]
    #[arg(long, env = "RFM_REFERENCE_DATE")]
    pub reference_date: Option<String>,

    /// chrono format of the transaction date column, e.g. "%d/%m/%y"
    #[arg(long, env = "RFM_DATE_FORMAT")]
    pub date_format: Option<String>,

    /// Exclude customers without a valid transaction date instead of failing
    #[arg(long, env = "RFM_SKIP_INVALID_DATES")]
    pub skip_invalid_dates: bool,

    /// Drop transactions with a zero amount before aggregation
    #[arg(long, env = "RFM_DROP_ZERO_AMOUNTS")]
    pub drop_zero_amounts: bool,

    /// Still write scores, with an empty cluster column, if clustering fails
    #[arg(long, env = "RFM_ALLOW_PARTIAL")]
    pub allow_partial: bool,

    /// Offline calibration: report K-Means inertia for a range of cluster
    /// counts instead of running the pipeline. Example: --elbow 1-10
    #[arg(long)]
    pub elbow: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Merge flags, the optional configuration file and defaults
    pub fn resolve_config(&self) -> Result<PipelineConfig> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        self.merge(file)
    }

    fn merge(&self, file: FileConfig) -> Result<PipelineConfig> {
        let defaults = ClusterConfig::default();
        let descriptions = file.segment_descriptions()?.unwrap_or_default();

        let date_format = self.date_format.clone().or(file.date_format);
        let reference_date = match self.reference_date.as_ref().or(file.reference_date.as_ref()) {
            Some(raw) => Some(parse_timestamp(raw, date_format.as_deref()).ok_or_else(|| {
                RfmError::Config(format!("cannot parse reference date `{raw}`"))
            })?),
            None => None,
        };

        Ok(PipelineConfig {
            load: LoadOptions {
                columns: file.columns.unwrap_or_default(),
                date_format,
                drop_zero_amounts: self.drop_zero_amounts
                    || file.drop_zero_amounts.unwrap_or(false),
            },
            aggregate: AggregateOptions {
                reference_date,
                skip_invalid_dates: self.skip_invalid_dates
                    || file.skip_invalid_dates.unwrap_or(false),
            },
            quantile_method: self
                .quantile_method
                .or(file.quantile_method)
                .unwrap_or_default(),
            clustering: ClusterConfig {
                cluster_count: self
                    .clusters
                    .or(file.cluster_count)
                    .unwrap_or(defaults.cluster_count),
                random_seed: self.seed.or(file.random_seed).unwrap_or(defaults.random_seed),
                max_iterations: self
                    .max_iters
                    .or(file.max_iterations)
                    .unwrap_or(defaults.max_iterations),
                tolerance: self.tolerance.or(file.tolerance).unwrap_or(defaults.tolerance),
                n_runs: self.n_runs.or(file.n_runs).unwrap_or(defaults.n_runs),
                seed_retries: self
                    .seed_retries
                    .or(file.seed_retries)
                    .unwrap_or(defaults.seed_retries),
                label_order: self
                    .label_order
                    .or(file.label_order)
                    .unwrap_or(defaults.label_order),
            },
            allow_partial: self.allow_partial || file.allow_partial.unwrap_or(false),
            descriptions,
        })
    }

    /// Parse the elbow range
    /// Expected format: "min-max", e.g. "1-10"
    pub fn parse_elbow_range(&self) -> Result<Option<RangeInclusive<usize>>> {
        let Some(ref range) = self.elbow else {
            return Ok(None);
        };

        let invalid = || RfmError::Config(format!("elbow range must look like `1-10`, got `{range}`"));
        let (min, max) = range.split_once('-').ok_or_else(invalid)?;
        let min: usize = min.trim().parse().map_err(|_| invalid())?;
        let max: usize = max.trim().parse().map_err(|_| invalid())?;

        if min == 0 || min > max {
            return Err(invalid());
        }
        Ok(Some(min..=max))
    }
}
