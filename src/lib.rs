//! RfmForge: customer segmentation from a transaction log
//!
//! Transactions are collapsed into Recency, Frequency and Monetary metrics
//! per customer, scored 1-4 on quartile thresholds and grouped with
//! K-Means on the standardized metrics.

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod scoring;

// Re-export public items for easier access
pub use aggregate::{aggregate_customers, Aggregation, CustomerRfm};
pub use cli::Args;
pub use config::{ClusterConfig, LabelOrder, PipelineConfig, QuantileMethod};
pub use data::{load_transactions, Transaction, TransactionTable};
pub use error::{Result, RfmError};
pub use model::{assign_segments, elbow_scan, fit_segments, suggest_elbow, SegmentModel};
pub use pipeline::{run_pipeline, RfmRun};
pub use scoring::{score_customers, ScoreSet, ScoreThresholds};
