//! K-Means segmentation of customers in standardized RFM space

use crate::aggregate::CustomerRfm;
use crate::config::{ClusterConfig, LabelOrder};
use crate::error::{Result, RfmError};
use linfa::prelude::*;
use linfa_clustering::KMeans;
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use tracing::{debug, info, warn};

/// Number of features: recency, frequency, monetary
pub const N_FEATURES: usize = 3;

/// Zero-mean, unit-variance scaling fitted on the customer population
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    pub mean: Array1<f64>,
    /// Population standard deviation; constant features use 1.0
    pub std: Array1<f64>,
}

impl StandardScaler {
    pub fn fit(features: &Array2<f64>) -> Result<Self> {
        let mean = features.mean_axis(Axis(0)).ok_or_else(|| {
            RfmError::EmptyInput("cannot standardize an empty feature matrix".to_string())
        })?;
        let std = features
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > f64::EPSILON { s } else { 1.0 });

        Ok(Self { mean, std })
    }

    pub fn transform(&self, features: &Array2<f64>) -> Array2<f64> {
        (features - &self.mean) / &self.std
    }

    pub fn inverse_transform(&self, scaled: &Array2<f64>) -> Array2<f64> {
        scaled * &self.std + &self.mean
    }
}

/// Raw `[recency, frequency, monetary]` rows, one per customer
pub fn feature_matrix(customers: &[CustomerRfm]) -> Array2<f64> {
    Array2::from_shape_fn((customers.len(), N_FEATURES), |(row, feature)| {
        let customer = &customers[row];
        match feature {
            0 => customer.recency as f64,
            1 => f64::from(customer.frequency),
            _ => customer.monetary,
        }
    })
}

/// Fitted segmentation of one customer population
#[derive(Debug, Clone)]
pub struct SegmentModel {
    pub n_clusters: usize,
    /// Seed of the successful fit
    pub seed: u64,
    /// Cluster per customer, in the order of the input customers
    pub labels: Array1<usize>,
    /// Centroids in standardized space
    pub centroids: Array2<f64>,
    /// Within-cluster sum of squares in standardized space
    pub inertia: f64,
    pub scaler: StandardScaler,
    /// Standardized features the model was fitted on
    pub features: Array2<f64>,
}

impl SegmentModel {
    /// Centroids converted back to recency days, transaction counts and spend
    pub fn raw_centroids(&self) -> Array2<f64> {
        self.scaler.inverse_transform(&self.centroids)
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for &label in self.labels.iter() {
            if label < self.n_clusters {
                sizes[label] += 1;
            }
        }
        sizes
    }

    /// Mean silhouette coefficient over the first `sample_size` customers
    pub fn silhouette_sample(&self, sample_size: usize) -> f64 {
        let n_samples = self.features.nrows().min(sample_size);
        if n_samples < 2 || self.n_clusters < 2 {
            return 0.0;
        }

        let mut silhouette_sum = 0.0;

        for i in 0..n_samples {
            let point = self.features.row(i);
            let cluster_label = self.labels[i];

            let mut same_cluster = (0.0, 0usize);
            let mut other_clusters = vec![(0.0, 0usize); self.n_clusters];

            for j in (0..n_samples).filter(|&j| j != i) {
                let distance = euclidean_distance(&point, &self.features.row(j));
                let other_label = self.labels[j];
                let slot = if other_label == cluster_label {
                    &mut same_cluster
                } else {
                    &mut other_clusters[other_label]
                };
                slot.0 += distance;
                slot.1 += 1;
            }

            // Singleton clusters score zero
            if same_cluster.1 == 0 {
                continue;
            }
            let a_i = same_cluster.0 / same_cluster.1 as f64;

            let b_i = other_clusters
                .iter()
                .filter(|(_, count)| *count > 0)
                .map(|(sum, count)| sum / *count as f64)
                .fold(f64::INFINITY, f64::min);

            if b_i.is_finite() && a_i.max(b_i) > 0.0 {
                silhouette_sum += (b_i - a_i) / a_i.max(b_i);
            }
        }

        silhouette_sum / n_samples as f64
    }
}

/// Fit K-Means on raw RFM features with a single seed
///
/// Features are standardized first so that monetary magnitudes do not
/// dominate the distance. A fit that fails inside linfa, or that leaves
/// any of the `cluster_count` clusters empty, is a convergence error.
pub fn fit_segments(
    raw_features: &Array2<f64>,
    config: &ClusterConfig,
    seed: u64,
) -> Result<SegmentModel> {
    config.validate(raw_features.nrows())?;

    let distinct = distinct_rows(raw_features);
    if distinct < config.cluster_count {
        return Err(RfmError::Convergence {
            seed,
            reason: format!(
                "only {distinct} distinct customers for {} clusters",
                config.cluster_count
            ),
        });
    }

    let scaler = StandardScaler::fit(raw_features)?;
    let features = scaler.transform(raw_features);
    let dataset = DatasetBase::from(features.clone());

    let model = KMeans::params_with(config.cluster_count, StdRng::seed_from_u64(seed), L2Dist)
        .max_n_iterations(config.max_iterations)
        .tolerance(config.tolerance)
        .n_runs(config.n_runs)
        .fit(&dataset)
        .map_err(|err| RfmError::Convergence {
            seed,
            reason: err.to_string(),
        })?;

    let labels: Array1<usize> = model.predict(&dataset);

    let populated = populated_clusters(&labels, config.cluster_count);
    if populated < config.cluster_count {
        return Err(RfmError::Convergence {
            seed,
            reason: format!(
                "only {populated} of {} clusters received customers",
                config.cluster_count
            ),
        });
    }

    // linfa stops silently at its iteration cap and its centroids lag the
    // cluster means, so the partition is settled on exact means here
    let (labels, centroids) = refine_partition(&features, labels, config, seed)?;

    let (labels, centroids) = relabel(labels, centroids, raw_features, config.label_order);
    let inertia = compute_inertia(&features, &labels, &centroids);

    debug!(seed, inertia, "fitted K-Means");

    Ok(SegmentModel {
        n_clusters: config.cluster_count,
        seed,
        labels,
        centroids,
        inertia,
        scaler,
        features,
    })
}

/// Cluster customers and write the label into each record
///
/// Tries `random_seed` first, then `random_seed + 1` and so on for
/// `seed_retries` extra attempts while the fit fails to converge. The
/// sequence of seeds is fixed, so identical input and configuration
/// always yield the same partition.
pub fn assign_segments(
    customers: &mut [CustomerRfm],
    config: &ClusterConfig,
) -> Result<SegmentModel> {
    let raw_features = feature_matrix(customers);
    let mut attempt = 0u32;

    let model = loop {
        let seed = config.random_seed.wrapping_add(u64::from(attempt));
        match fit_segments(&raw_features, config, seed) {
            Ok(model) => break model,
            Err(err) if err.is_convergence() && attempt < config.seed_retries => {
                warn!(seed, error = %err, "clustering failed, retrying with next seed");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    };

    for (customer, &label) in customers.iter_mut().zip(model.labels.iter()) {
        customer.cluster = Some(label);
    }

    info!(
        clusters = model.n_clusters,
        seed = model.seed,
        inertia = model.inertia,
        "assigned customer segments"
    );

    Ok(model)
}

/// Inertia of one cluster count, used for offline cluster count selection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElbowPoint {
    pub k: usize,
    pub inertia: f64,
}

/// Fit every cluster count in `range` and record its inertia
///
/// Counts above the population size are skipped, as are counts whose fit
/// fails; both are logged.
pub fn elbow_scan(
    customers: &[CustomerRfm],
    range: RangeInclusive<usize>,
    config: &ClusterConfig,
) -> Result<Vec<ElbowPoint>> {
    let raw_features = feature_matrix(customers);
    let mut points = Vec::new();

    for k in range {
        if k == 0 || k > customers.len() {
            warn!(k, customers = customers.len(), "skipping cluster count");
            continue;
        }
        let candidate = ClusterConfig {
            cluster_count: k,
            label_order: LabelOrder::Algorithm,
            ..config.clone()
        };
        match fit_segments(&raw_features, &candidate, config.random_seed) {
            Ok(model) => points.push(ElbowPoint {
                k,
                inertia: model.inertia,
            }),
            Err(err) => warn!(k, error = %err, "elbow fit failed"),
        }
    }

    if points.is_empty() {
        return Err(RfmError::Config(
            "no cluster count in the elbow range could be fitted".to_string(),
        ));
    }
    Ok(points)
}

/// Cluster count where the inertia curve bends the most
///
/// Both axes are normalized to [0, 1] and the point farthest below the
/// chord from the first to the last point is chosen.
pub fn suggest_elbow(points: &[ElbowPoint]) -> Option<usize> {
    let (first, last) = (points.first()?, points.last()?);
    if points.len() < 3 {
        return None;
    }

    let k_span = (last.k - first.k) as f64;
    let inertia_span = first.inertia - last.inertia;
    if k_span <= 0.0 || inertia_span <= 0.0 {
        return None;
    }

    points
        .iter()
        .map(|point| {
            let x = (point.k - first.k) as f64 / k_span;
            let y = (point.inertia - last.inertia) / inertia_span;
            // The chord runs from (0, 1) to (1, 0)
            (point.k, (1.0 - x) - y)
        })
        .filter(|(_, gap)| *gap > 1e-9)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(k, _)| k)
}

fn distinct_rows(features: &Array2<f64>) -> usize {
    features
        .outer_iter()
        .map(|row| row.iter().map(|v| v.to_bits()).collect::<Vec<u64>>())
        .collect::<HashSet<_>>()
        .len()
}

/// Lloyd iterations on exact cluster means, starting from `labels`
///
/// Each iteration assigns every customer to its nearest centroid and
/// recomputes the means. The partition is accepted once the summed squared
/// centroid shift drops below `config.tolerance`; running out of
/// `config.max_iterations` first, or emptying a cluster, is a convergence
/// error.
fn refine_partition(
    features: &Array2<f64>,
    labels: Array1<usize>,
    config: &ClusterConfig,
    seed: u64,
) -> Result<(Array1<usize>, Array2<f64>)> {
    let n_clusters = config.cluster_count;
    let emptied = || RfmError::Convergence {
        seed,
        reason: "a cluster lost all of its customers".to_string(),
    };

    let mut centroids = cluster_means(features, &labels, n_clusters).ok_or_else(emptied)?;
    let mut shift = f64::INFINITY;

    for iteration in 1..=config.max_iterations {
        let labels = nearest_centroids(features, &centroids);
        let updated = cluster_means(features, &labels, n_clusters).ok_or_else(emptied)?;
        shift = squared_shift(&centroids, &updated);
        centroids = updated;

        if shift < config.tolerance {
            debug!(seed, iteration, shift, "K-Means converged");
            return Ok((labels, centroids));
        }
    }

    Err(RfmError::Convergence {
        seed,
        reason: format!(
            "centroids still moved by {shift:.3e} after {} iterations",
            config.max_iterations
        ),
    })
}

/// Per-cluster mean of `features`; `None` when a cluster has no members
fn cluster_means(
    features: &Array2<f64>,
    labels: &Array1<usize>,
    n_clusters: usize,
) -> Option<Array2<f64>> {
    let mut sums = Array2::<f64>::zeros((n_clusters, features.ncols()));
    let mut counts = vec![0usize; n_clusters];

    for (row, &label) in features.outer_iter().zip(labels.iter()) {
        let mut sum = sums.row_mut(label);
        sum += &row;
        counts[label] += 1;
    }

    for (mut sum, &count) in sums.outer_iter_mut().zip(counts.iter()) {
        if count == 0 {
            return None;
        }
        sum /= count as f64;
    }
    Some(sums)
}

/// Index of the closest centroid for every row, lowest index on ties
fn nearest_centroids(features: &Array2<f64>, centroids: &Array2<f64>) -> Array1<usize> {
    features
        .outer_iter()
        .map(|row| {
            let mut best = (0, f64::INFINITY);
            for (cluster, centroid) in centroids.outer_iter().enumerate() {
                let distance = euclidean_distance(&row, &centroid);
                if distance < best.1 {
                    best = (cluster, distance);
                }
            }
            best.0
        })
        .collect()
}

fn squared_shift(before: &Array2<f64>, after: &Array2<f64>) -> f64 {
    before
        .iter()
        .zip(after.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum()
}

fn populated_clusters(labels: &Array1<usize>, n_clusters: usize) -> usize {
    let mut seen = vec![false; n_clusters];
    for &label in labels.iter() {
        if label < n_clusters {
            seen[label] = true;
        }
    }
    seen.into_iter().filter(|&s| s).count()
}

/// Renumber clusters by a canonical key so numbering survives refits
fn relabel(
    labels: Array1<usize>,
    centroids: Array2<f64>,
    raw_features: &Array2<f64>,
    order: LabelOrder,
) -> (Array1<usize>, Array2<f64>) {
    let n_clusters = centroids.nrows();
    if order == LabelOrder::Algorithm {
        return (labels, centroids);
    }

    let mut sums = vec![(0.0, 0.0, 0usize); n_clusters];
    for (row, &label) in raw_features.outer_iter().zip(labels.iter()) {
        let entry = &mut sums[label];
        entry.0 += row[0];
        entry.1 += row[2];
        entry.2 += 1;
    }
    let means: Vec<(f64, f64)> = sums
        .iter()
        .map(|&(recency, monetary, count)| {
            let count = count.max(1) as f64;
            (recency / count, monetary / count)
        })
        .collect();

    let mut ranked: Vec<usize> = (0..n_clusters).collect();
    ranked.sort_by(|&a, &b| {
        let (recency_a, monetary_a) = means[a];
        let (recency_b, monetary_b) = means[b];
        let ordering = match order {
            LabelOrder::Monetary => monetary_b
                .total_cmp(&monetary_a)
                .then(recency_a.total_cmp(&recency_b)),
            _ => recency_a
                .total_cmp(&recency_b)
                .then(monetary_b.total_cmp(&monetary_a)),
        };
        ordering.then(a.cmp(&b))
    });

    let mut mapping = vec![0; n_clusters];
    for (new_label, &old_label) in ranked.iter().enumerate() {
        mapping[old_label] = new_label;
    }

    let mut reordered = Array2::<f64>::zeros(centroids.raw_dim());
    for (old_label, centroid) in centroids.outer_iter().enumerate() {
        reordered.row_mut(mapping[old_label]).assign(&centroid);
    }

    (labels.mapv(|label| mapping[label]), reordered)
}

/// Within-cluster sum of squares
fn compute_inertia(features: &Array2<f64>, labels: &Array1<usize>, centroids: &Array2<f64>) -> f64 {
    let mut inertia = 0.0;

    for (i, &cluster) in labels.iter().enumerate() {
        if cluster < centroids.nrows() {
            inertia += euclidean_distance(&features.row(i), &centroids.row(cluster)).powi(2);
        }
    }

    inertia
}

fn euclidean_distance(point1: &ArrayView1<f64>, point2: &ArrayView1<f64>) -> f64 {
    point1
        .iter()
        .zip(point2.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Order-independent view of a labelling: which customers share a cluster
pub fn partition_of(labels: &[usize]) -> Vec<Vec<usize>> {
    let n_clusters = labels.iter().max().map_or(0, |&max| max + 1);
    let mut groups = vec![Vec::new(); n_clusters];
    for (index, &label) in labels.iter().enumerate() {
        groups[label].push(index);
    }
    groups.retain(|group| !group.is_empty());
    groups.sort();
    groups
}
