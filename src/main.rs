//! RfmForge: customer segmentation from transaction logs
//!
//! This is the main entrypoint that orchestrates loading, RFM scoring,
//! clustering and writing the result tables.

use anyhow::{Context, Result};
use clap::Parser;
use rfmforge::{
    aggregate_customers, elbow_scan, load_transactions, report, run_pipeline, suggest_elbow,
    Args, PipelineConfig,
};
use std::ops::RangeInclusive;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let default_filter = if args.verbose {
        "rfmforge=debug"
    } else {
        "rfmforge=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = args
        .resolve_config()
        .context("Failed to resolve configuration")?;

    // Check if in calibration mode
    if let Some(range) = args.parse_elbow_range()? {
        run_elbow_mode(&args, &config, range)?;
    } else {
        run_full_pipeline(&args, &config)?;
    }

    Ok(())
}

/// Report inertia per cluster count for choosing the production cluster count
fn run_elbow_mode(args: &Args, config: &PipelineConfig, range: RangeInclusive<usize>) -> Result<()> {
    println!("=== Elbow Scan ===");

    let table = load_transactions(&args.input, &config.load)
        .with_context(|| format!("Failed to load {}", args.input.display()))?;
    let aggregation = aggregate_customers(&table, &config.aggregate)?;

    let points = elbow_scan(&aggregation.customers, range, &config.clustering)?;

    println!("\n  k | Inertia");
    println!("  --|----------");
    for point in &points {
        println!("  {:2} | {:10.2}", point.k, point.inertia);
    }

    match suggest_elbow(&points) {
        Some(k) => println!("\nSuggested cluster count: {}", k),
        None => println!("\nNo clear elbow in this range"),
    }

    Ok(())
}

/// Run the full segmentation pipeline
fn run_full_pipeline(args: &Args, config: &PipelineConfig) -> Result<()> {
    println!("=== RFM Segmentation Pipeline ===\n");

    let start_time = Instant::now();

    info!(input = %args.input.display(), "loading transactions");
    let table = load_transactions(&args.input, &config.load)
        .with_context(|| format!("Failed to load {}", args.input.display()))?;
    println!("✓ Transactions loaded: {}", table.len());

    let run = run_pipeline(&table, config).context("RFM pipeline failed")?;
    println!(
        "✓ Customers scored: {} (reference date {})",
        run.customers.len(),
        run.reference_date.date()
    );
    if !run.excluded.is_empty() {
        println!(
            "  Excluded {} customers without a valid transaction date",
            run.excluded.len()
        );
    }

    report::print_thresholds(&run.thresholds);

    let summaries = report::summarize_clusters(&run.customers, &config.descriptions)?;
    match (&run.segments, &run.clustering_error) {
        (Some(model), _) => report::print_cluster_statistics(model, &summaries),
        (None, Some(err)) => println!("\n✗ Clustering failed, cluster column left empty: {}", err),
        (None, None) => {}
    }

    report::write_customers_csv(&run.customers, &args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    if let Some(summary_path) = &args.summary {
        report::write_summary_csv(&summaries, summary_path)
            .with_context(|| format!("Failed to write {}", summary_path.display()))?;
    }

    let total_time = start_time.elapsed();
    println!("\n=== Pipeline Complete ===");
    println!("Total processing time: {:.2}s", total_time.as_secs_f64());
    println!("Customer table saved to: {}", args.output.display());
    if let Some(summary_path) = &args.summary {
        println!("Cluster summary saved to: {}", summary_path.display());
    }

    Ok(())
}
