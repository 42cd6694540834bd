//! Error taxonomy for the RFM pipeline

use polars::prelude::PolarsError;
use thiserror::Error;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, RfmError>;

/// Errors raised while loading, aggregating, scoring or clustering customers
#[derive(Error, Debug)]
pub enum RfmError {
    /// A required input column is missing or holds malformed values
    #[error("schema error in column `{column}`: {reason}")]
    Schema { column: String, reason: String },

    /// Inconsistent transaction dates for a customer
    #[error("data integrity error for customer `{customer_id}`: {reason}")]
    DataIntegrity { customer_id: String, reason: String },

    /// K-Means did not produce a usable partition
    #[error("clustering failed with seed {seed}: {reason}")]
    Convergence { seed: u64, reason: String },

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Nothing left to process
    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] PolarsError),

    #[error("config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),
}

impl RfmError {
    pub(crate) fn schema(column: &str, reason: impl Into<String>) -> Self {
        Self::Schema {
            column: column.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn integrity(customer_id: &str, reason: impl Into<String>) -> Self {
        Self::DataIntegrity {
            customer_id: customer_id.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors a retry with another seed may resolve
    pub fn is_convergence(&self) -> bool {
        matches!(self, Self::Convergence { .. })
    }
}
