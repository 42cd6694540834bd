//! Output tables for reporting and the dashboard

use crate::aggregate::CustomerRfm;
use crate::config::SegmentDescriptions;
use crate::error::Result;
use crate::model::SegmentModel;
use crate::scoring::ScoreThresholds;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use tracing::info;

/// Column order of the per-customer output file
pub const OUTPUT_COLUMNS: [&str; 11] = [
    "customer_id",
    "recency",
    "frequency",
    "monetary",
    "recency_score",
    "frequency_score",
    "monetary_score",
    "rfm_score",
    "rfm_group",
    "weighted_rfm_score",
    "cluster",
];

/// Per-cluster averages as shown by the dashboard
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSummary {
    pub cluster: usize,
    pub customers: usize,
    /// Share of clustered customers, 0 to 100
    pub percentage: f64,
    pub mean_recency: f64,
    pub mean_frequency: f64,
    pub mean_monetary: f64,
    pub mean_rfm_score: f64,
    pub description: String,
}

/// Enriched customer table as a Polars frame
///
/// Score and cluster columns are null for customers that were not scored
/// or clustered.
pub fn customers_frame(customers: &[CustomerRfm]) -> Result<DataFrame> {
    let score = |pick: fn(&crate::scoring::ScoreSet) -> u8| -> Vec<Option<u32>> {
        customers
            .iter()
            .map(|c| c.scores.as_ref().map(|s| u32::from(pick(s))))
            .collect()
    };

    let frame = DataFrame::new(vec![
        Series::new(
            OUTPUT_COLUMNS[0],
            customers.iter().map(|c| c.customer_id.as_str()).collect::<Vec<_>>(),
        ),
        Series::new(
            OUTPUT_COLUMNS[1],
            customers.iter().map(|c| c.recency).collect::<Vec<i64>>(),
        ),
        Series::new(
            OUTPUT_COLUMNS[2],
            customers.iter().map(|c| c.frequency).collect::<Vec<u32>>(),
        ),
        Series::new(
            OUTPUT_COLUMNS[3],
            customers.iter().map(|c| c.monetary).collect::<Vec<f64>>(),
        ),
        Series::new(OUTPUT_COLUMNS[4], score(|s| s.recency_score)),
        Series::new(OUTPUT_COLUMNS[5], score(|s| s.frequency_score)),
        Series::new(OUTPUT_COLUMNS[6], score(|s| s.monetary_score)),
        Series::new(OUTPUT_COLUMNS[7], score(|s| s.rfm_score)),
        Series::new(
            OUTPUT_COLUMNS[8],
            customers
                .iter()
                .map(|c| c.scores.as_ref().map(|s| s.rfm_group.as_str()))
                .collect::<Vec<_>>(),
        ),
        Series::new(OUTPUT_COLUMNS[9], score(|s| s.weighted_rfm_score)),
        Series::new(
            OUTPUT_COLUMNS[10],
            customers
                .iter()
                .map(|c| c.cluster.map(|l| l as u32))
                .collect::<Vec<Option<u32>>>(),
        ),
    ])?;

    Ok(frame)
}

/// Write the enriched customer table as CSV
pub fn write_customers_csv(customers: &[CustomerRfm], path: &Path) -> Result<()> {
    let mut frame = customers_frame(customers)?;
    write_csv(&mut frame, path)?;
    info!(rows = frame.height(), path = %path.display(), "wrote customer table");
    Ok(())
}

/// Average metrics of every cluster, ordered by cluster id
///
/// Customers without a cluster are left out.
pub fn summarize_clusters(
    customers: &[CustomerRfm],
    descriptions: &SegmentDescriptions,
) -> Result<Vec<ClusterSummary>> {
    let grouped = customers_frame(customers)?
        .lazy()
        .filter(col("cluster").is_not_null())
        .group_by([col("cluster")])
        .agg([
            col("customer_id").count().alias("customers"),
            col("recency").mean().alias("mean_recency"),
            col("frequency").mean().alias("mean_frequency"),
            col("monetary").mean().alias("mean_monetary"),
            col("rfm_score").mean().alias("mean_rfm_score"),
        ])
        .collect()?;

    let cluster = grouped.column("cluster")?.cast(&DataType::Int64)?;
    let cluster = cluster.i64()?;
    let counts = grouped.column("customers")?.cast(&DataType::Int64)?;
    let counts = counts.i64()?;
    let mean = |name: &str| -> Result<Vec<f64>> {
        let series = grouped.column(name)?.cast(&DataType::Float64)?;
        Ok(series
            .f64()?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect())
    };
    let (recency, frequency, monetary, rfm_score) = (
        mean("mean_recency")?,
        mean("mean_frequency")?,
        mean("mean_monetary")?,
        mean("mean_rfm_score")?,
    );

    let total: i64 = counts.into_iter().flatten().sum();
    let mut summaries = Vec::with_capacity(grouped.height());
    for i in 0..grouped.height() {
        let (Some(id), Some(count)) = (cluster.get(i), counts.get(i)) else {
            continue;
        };
        let id = id as usize;
        summaries.push(ClusterSummary {
            cluster: id,
            customers: count as usize,
            percentage: if total > 0 {
                count as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            mean_recency: recency[i],
            mean_frequency: frequency[i],
            mean_monetary: monetary[i],
            mean_rfm_score: rfm_score[i],
            description: descriptions.describe(id).to_string(),
        });
    }
    summaries.sort_by_key(|summary| summary.cluster);

    Ok(summaries)
}

/// Write cluster summaries, including descriptions, as CSV
pub fn write_summary_csv(summaries: &[ClusterSummary], path: &Path) -> Result<()> {
    let column = |pick: fn(&ClusterSummary) -> f64| -> Vec<f64> {
        summaries.iter().map(pick).collect()
    };

    let mut frame = DataFrame::new(vec![
        Series::new(
            "cluster",
            summaries.iter().map(|s| s.cluster as u32).collect::<Vec<_>>(),
        ),
        Series::new(
            "customers",
            summaries.iter().map(|s| s.customers as u64).collect::<Vec<_>>(),
        ),
        Series::new("percentage", column(|s| s.percentage)),
        Series::new("mean_recency", column(|s| s.mean_recency)),
        Series::new("mean_frequency", column(|s| s.mean_frequency)),
        Series::new("mean_monetary", column(|s| s.mean_monetary)),
        Series::new("mean_rfm_score", column(|s| s.mean_rfm_score)),
        Series::new(
            "description",
            summaries.iter().map(|s| s.description.as_str()).collect::<Vec<_>>(),
        ),
    ])?;

    write_csv(&mut frame, path)?;
    info!(clusters = summaries.len(), path = %path.display(), "wrote cluster summary");
    Ok(())
}

fn write_csv(frame: &mut DataFrame, path: &Path) -> Result<()> {
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(frame)?;
    Ok(())
}

/// Print quartile thresholds to the console
pub fn print_thresholds(thresholds: &ScoreThresholds) {
    println!("\n=== Quartile Thresholds ===");
    println!("  Metric    |      Q25 |      Q50 |      Q75");
    println!("  ----------|----------|----------|----------");
    for (name, q) in [
        ("Recency", thresholds.recency),
        ("Frequency", thresholds.frequency),
        ("Monetary", thresholds.monetary),
    ] {
        println!("  {:9} | {:8.2} | {:8.2} | {:8.2}", name, q.q25, q.q50, q.q75);
    }
}

/// Print cluster statistics to the console
pub fn print_cluster_statistics(model: &SegmentModel, summaries: &[ClusterSummary]) {
    println!("\n=== Cluster Statistics ===");
    println!("Number of clusters: {}", model.n_clusters);
    println!("Total customers: {}", model.labels.len());
    println!("Seed: {}", model.seed);
    println!("Within-cluster sum of squares (Inertia): {:.2}", model.inertia);
    println!(
        "Silhouette score (sample): {:.3}",
        model.silhouette_sample(1000)
    );

    println!("\nCluster sizes:");
    for summary in summaries {
        println!(
            "  Cluster {}: {} customers ({:.1}%) - {}",
            summary.cluster, summary.customers, summary.percentage, summary.description
        );
    }

    println!("\nCluster averages:");
    println!("  Cluster | Recency | Frequency |    Monetary | RFM Score");
    println!("  --------|---------|-----------|-------------|----------");
    for summary in summaries {
        println!(
            "  {:7} | {:7.2} | {:9.2} | {:11.2} | {:9.2}",
            summary.cluster,
            summary.mean_recency,
            summary.mean_frequency,
            summary.mean_monetary,
            summary.mean_rfm_score
        );
    }

    println!("\nCentroids (original units):");
    let sizes = model.cluster_sizes();
    for (cluster, centroid) in model.raw_centroids().outer_iter().enumerate() {
        println!(
            "  Cluster {} (n={}): recency {:.1}, frequency {:.2}, monetary {:.2}",
            cluster, sizes[cluster], centroid[0], centroid[1], centroid[2]
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::ScoreSet;
    use tempfile::tempdir;

    fn scored_customers() -> Vec<CustomerRfm> {
        let rows = [
            ("C1", 81, 2, 150.0, (1, 2, 1), Some(1)),
            ("C2", 1, 1, 500.0, (4, 1, 4), Some(0)),
            ("C3", 5, 4, 300.0, (3, 4, 3), Some(0)),
            ("C4", 40, 1, 20.0, (2, 1, 1), Some(1)),
        ];
        rows.iter()
            .map(|&(id, r, f, m, (rs, fs, ms), cluster)| {
                let mut customer = CustomerRfm::new(id, r, f, m);
                customer.scores = Some(ScoreSet::new(rs, fs, ms));
                customer.cluster = cluster;
                customer
            })
            .collect()
    }

    #[test]
    fn test_customers_frame_columns() {
        let frame = customers_frame(&scored_customers()).unwrap();
        let names: Vec<String> = frame
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        assert_eq!(names, OUTPUT_COLUMNS.to_vec());
        assert_eq!(frame.height(), 4);
    }

    #[test]
    fn test_write_customers_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rfm.csv");

        let mut customers = scored_customers();
        customers[3].cluster = None;
        write_customers_csv(&customers, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), OUTPUT_COLUMNS.join(","));
        assert_eq!(lines.next().unwrap(), "C1,81,2,150.0,1,2,1,4,121,5,1");
        // Unclustered customers keep their scores and an empty cluster
        assert_eq!(lines.nth(2).unwrap(), "C4,40,1,20.0,2,1,1,4,211,6,");
    }

    #[test]
    fn test_summarize_clusters() {
        let summaries =
            summarize_clusters(&scored_customers(), &SegmentDescriptions::default()).unwrap();

        assert_eq!(summaries.len(), 2);
        let first = &summaries[0];
        assert_eq!(first.cluster, 0);
        assert_eq!(first.customers, 2);
        assert_eq!(first.percentage, 50.0);
        assert_eq!(first.mean_recency, 3.0);
        assert_eq!(first.mean_frequency, 2.5);
        assert_eq!(first.mean_monetary, 400.0);
        assert_eq!(first.mean_rfm_score, 9.5);
        assert_eq!(first.description, "Potential");

        assert_eq!(summaries[1].description, "Cold Leads");
        assert_eq!(summaries[1].mean_recency, 60.5);
    }

    #[test]
    fn test_summary_skips_unclustered() {
        let mut customers = scored_customers();
        for customer in &mut customers {
            customer.cluster = None;
        }
        let summaries = summarize_clusters(&customers, &SegmentDescriptions::default()).unwrap();
        assert!(summaries.is_empty());
    }

    #[test]
    fn test_write_summary_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let summaries =
            summarize_clusters(&scored_customers(), &SegmentDescriptions::default()).unwrap();

        write_summary_csv(&summaries, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(
            "cluster,customers,percentage,mean_recency,mean_frequency,mean_monetary,mean_rfm_score,description"
        ));
        assert_eq!(content.lines().count(), 3);
    }
}
