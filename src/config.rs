//! Pipeline configuration and the optional TOML configuration file

use crate::error::{Result, RfmError};
use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_CLUSTER_COUNT: usize = 3;
pub const DEFAULT_RANDOM_SEED: u64 = 42;
pub const DEFAULT_MAX_ITERATIONS: u64 = 300;
pub const DEFAULT_TOLERANCE: f64 = 1e-4;
pub const DEFAULT_N_RUNS: usize = 10;

/// Interpolation used when a quantile falls between two ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum QuantileMethod {
    /// Linear interpolation between the closest ranks
    #[default]
    Linear,
    /// Lower of the two closest ranks
    Lower,
    /// Higher of the two closest ranks
    Higher,
    /// Closest rank, ties to the even rank
    Nearest,
    /// Mean of the two closest ranks
    Midpoint,
}

/// How cluster labels are numbered after fitting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LabelOrder {
    /// Keep the numbering produced by K-Means
    Algorithm,
    /// Cluster 0 has the lowest mean recency (most recent customers)
    #[default]
    Recency,
    /// Cluster 0 has the highest mean monetary value
    Monetary,
}

/// Names of the required input columns
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnMap {
    pub transaction_id: String,
    pub customer_id: String,
    pub transaction_date: String,
    pub transaction_amount: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            transaction_id: "transaction_id".to_string(),
            customer_id: "customer_id".to_string(),
            transaction_date: "transaction_date".to_string(),
            transaction_amount: "transaction_amount".to_string(),
        }
    }
}

/// Options controlling how the transaction file is read
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub columns: ColumnMap,
    /// Explicit chrono format; `None` tries the built-in list
    pub date_format: Option<String>,
    pub drop_zero_amounts: bool,
}

/// Options for collapsing transactions into customers
#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    /// Replaces the dataset's latest transaction date as recency reference
    pub reference_date: Option<NaiveDateTime>,
    /// Warn and exclude customers without a valid date instead of failing
    pub skip_invalid_dates: bool,
}

/// K-Means settings
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub cluster_count: usize,
    pub random_seed: u64,
    pub max_iterations: u64,
    pub tolerance: f64,
    pub n_runs: usize,
    /// Additional attempts with `seed + 1`, `seed + 2`, ... after a failed fit
    pub seed_retries: u32,
    pub label_order: LabelOrder,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_count: DEFAULT_CLUSTER_COUNT,
            random_seed: DEFAULT_RANDOM_SEED,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
            n_runs: DEFAULT_N_RUNS,
            seed_retries: 0,
            label_order: LabelOrder::default(),
        }
    }
}

impl ClusterConfig {
    /// Check the settings against the number of customers to be clustered
    pub fn validate(&self, population: usize) -> Result<()> {
        if self.cluster_count == 0 {
            return Err(RfmError::Config(
                "cluster_count must be a positive integer".to_string(),
            ));
        }
        if self.cluster_count > population {
            return Err(RfmError::Config(format!(
                "cluster_count ({}) exceeds the number of customers ({})",
                self.cluster_count, population
            )));
        }
        if self.max_iterations == 0 {
            return Err(RfmError::Config(
                "max_iterations must be positive".to_string(),
            ));
        }
        if self.n_runs == 0 {
            return Err(RfmError::Config("n_runs must be positive".to_string()));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(RfmError::Config(format!(
                "tolerance must be a positive number, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// Static cluster id to description lookup consumed by reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptions(BTreeMap<usize, String>);

impl Default for SegmentDescriptions {
    fn default() -> Self {
        Self(BTreeMap::from([
            (0, "Potential".to_string()),
            (1, "Cold Leads".to_string()),
            (2, "High-value".to_string()),
        ]))
    }
}

impl SegmentDescriptions {
    pub fn new(entries: BTreeMap<usize, String>) -> Self {
        Self(entries)
    }

    pub fn describe(&self, cluster: usize) -> &str {
        self.0
            .get(&cluster)
            .map(String::as_str)
            .unwrap_or("No description available")
    }
}

/// Fully resolved configuration for one batch run
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub load: LoadOptions,
    pub aggregate: AggregateOptions,
    pub quantile_method: QuantileMethod,
    pub clustering: ClusterConfig,
    /// Emit scores with an empty cluster column when clustering fails
    pub allow_partial: bool,
    pub descriptions: SegmentDescriptions,
}

/// Contents of the optional TOML configuration file
///
/// Every key is optional; command-line flags take precedence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub cluster_count: Option<usize>,
    pub random_seed: Option<u64>,
    pub quantile_method: Option<QuantileMethod>,
    pub max_iterations: Option<u64>,
    pub tolerance: Option<f64>,
    pub n_runs: Option<usize>,
    pub seed_retries: Option<u32>,
    pub label_order: Option<LabelOrder>,
    pub allow_partial: Option<bool>,
    pub reference_date: Option<String>,
    pub date_format: Option<String>,
    pub skip_invalid_dates: Option<bool>,
    pub drop_zero_amounts: Option<bool>,
    pub columns: Option<ColumnMap>,
    pub descriptions: Option<BTreeMap<String, String>>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Cluster descriptions keyed by numeric cluster id
    pub fn segment_descriptions(&self) -> Result<Option<SegmentDescriptions>> {
        let Some(raw) = &self.descriptions else {
            return Ok(None);
        };

        let mut entries = BTreeMap::new();
        for (key, description) in raw {
            let cluster: usize = key.trim().parse().map_err(|_| {
                RfmError::Config(format!("description key `{key}` is not a cluster id"))
            })?;
            entries.insert(cluster, description.clone());
        }
        Ok(Some(SegmentDescriptions::new(entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_cluster_count() {
        let config = ClusterConfig::default();
        assert!(config.validate(3).is_ok());
        assert!(config.validate(100).is_ok());
        assert!(matches!(config.validate(2), Err(RfmError::Config(_))));

        let zero = ClusterConfig {
            cluster_count: 0,
            ..ClusterConfig::default()
        };
        assert!(matches!(zero.validate(10), Err(RfmError::Config(_))));
    }

    #[test]
    fn test_validate_tolerance() {
        let config = ClusterConfig {
            tolerance: 0.0,
            ..ClusterConfig::default()
        };
        assert!(config.validate(10).is_err());
    }

    #[test]
    fn test_parse_file_config() {
        let config = FileConfig::parse(
            r#"
            cluster_count = 4
            random_seed = 7
            quantile_method = "midpoint"
            label_order = "monetary"
            skip_invalid_dates = true

            [columns]
            transaction_id = "TransactionID"
            customer_id = "CustomerID"
            transaction_date = "TransactionDate"
            transaction_amount = "TransactionAmount (INR)"

            [descriptions]
            0 = "Champions"
            3 = "Dormant"
            "#,
        )
        .unwrap();

        assert_eq!(config.cluster_count, Some(4));
        assert_eq!(config.random_seed, Some(7));
        assert_eq!(config.quantile_method, Some(QuantileMethod::Midpoint));
        assert_eq!(config.label_order, Some(LabelOrder::Monetary));
        assert_eq!(config.skip_invalid_dates, Some(true));
        assert_eq!(
            config.columns.unwrap().transaction_amount,
            "TransactionAmount (INR)"
        );

        let config = FileConfig::parse("[descriptions]\n0 = \"Champions\"\n3 = \"Dormant\"\n").unwrap();
        let descriptions = config.segment_descriptions().unwrap().unwrap();
        assert_eq!(descriptions.describe(0), "Champions");
        assert_eq!(descriptions.describe(3), "Dormant");
        assert_eq!(descriptions.describe(1), "No description available");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(matches!(
            FileConfig::parse("clusters = 3"),
            Err(RfmError::ConfigFile(_))
        ));
    }

    #[test]
    fn test_bad_description_key() {
        let config = FileConfig::parse("[descriptions]\nvip = \"Champions\"\n").unwrap();
        assert!(config.segment_descriptions().is_err());
    }

    #[test]
    fn test_default_descriptions() {
        let descriptions = SegmentDescriptions::default();
        assert_eq!(descriptions.describe(2), "High-value");
    }
}
