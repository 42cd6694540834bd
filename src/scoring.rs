//! Quartile thresholds and ordinal RFM scoring
//!
//! Recency and Monetary are binned on their 25th/50th/75th percentiles;
//! Frequency uses fixed cut-offs because most customers only transact a
//! handful of times. Values equal to a boundary fall into the lower bin.

use crate::aggregate::CustomerRfm;
use crate::config::QuantileMethod;
use crate::error::{Result, RfmError};
use tracing::debug;

/// Frequency counts at or above this value share the top score
pub const FREQUENCY_CAP: u32 = 4;

/// Weight of the recency score in [`ScoreSet::weighted_rfm_score`]
pub const RECENCY_WEIGHT: u8 = 2;

/// 25th, 50th and 75th percentiles of one metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quartiles {
    pub q25: f64,
    pub q50: f64,
    pub q75: f64,
}

impl Quartiles {
    /// Compute quartiles over the whole population
    pub fn compute(values: &[f64], method: QuantileMethod) -> Result<Self> {
        if values.is_empty() {
            return Err(RfmError::EmptyInput(
                "cannot compute quartiles of an empty population".to_string(),
            ));
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        Ok(Self {
            q25: quantile(&sorted, 0.25, method),
            q50: quantile(&sorted, 0.50, method),
            q75: quantile(&sorted, 0.75, method),
        })
    }
}

/// Quartiles of all three metrics for one scoring run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreThresholds {
    pub recency: Quartiles,
    /// Reported only; frequency scoring uses [`frequency_score`]
    pub frequency: Quartiles,
    pub monetary: Quartiles,
}

/// Quantile of already sorted values
///
/// Position is `h = (n - 1) * q` on zero-based ranks, the convention used
/// by R's type 7 and NumPy; `method` decides what happens between ranks.
///
/// Panics if `sorted` is empty.
pub fn quantile(sorted: &[f64], q: f64, method: QuantileMethod) -> f64 {
    let last = sorted.len() - 1;
    let h = last as f64 * q.clamp(0.0, 1.0);
    let lower = h.floor() as usize;
    let upper = (h.ceil() as usize).min(last);
    let fraction = h - lower as f64;

    match method {
        QuantileMethod::Linear => sorted[lower] + fraction * (sorted[upper] - sorted[lower]),
        QuantileMethod::Lower => sorted[lower],
        QuantileMethod::Higher => sorted[upper],
        QuantileMethod::Nearest => sorted[(h.round_ties_even() as usize).min(last)],
        QuantileMethod::Midpoint => (sorted[lower] + sorted[upper]) / 2.0,
    }
}

/// Lower recency is better: 4 up to Q25, then 3, 2 and 1 above Q75
pub fn recency_score(recency: f64, thresholds: &Quartiles) -> u8 {
    if recency <= thresholds.q25 {
        4
    } else if recency <= thresholds.q50 {
        3
    } else if recency <= thresholds.q75 {
        2
    } else {
        1
    }
}

/// Counts 1, 2 and 3 score as themselves; anything larger scores 4
pub fn frequency_score(frequency: u32) -> u8 {
    frequency.clamp(1, FREQUENCY_CAP) as u8
}

/// Higher spend is better: 1 up to Q25, then 2, 3 and 4 above Q75
pub fn monetary_score(monetary: f64, thresholds: &Quartiles) -> u8 {
    if monetary <= thresholds.q25 {
        1
    } else if monetary <= thresholds.q50 {
        2
    } else if monetary <= thresholds.q75 {
        3
    } else {
        4
    }
}

/// Ordinal scores of one customer and the composites derived from them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreSet {
    pub recency_score: u8,
    pub frequency_score: u8,
    pub monetary_score: u8,
    /// Sum of the three scores, 3 to 12
    pub rfm_score: u8,
    /// Scores as digits in recency, frequency, monetary order, e.g. `"413"`
    pub rfm_group: String,
    /// `2 * recency_score + frequency_score + monetary_score`
    pub weighted_rfm_score: u8,
}

impl ScoreSet {
    pub fn new(recency_score: u8, frequency_score: u8, monetary_score: u8) -> Self {
        Self {
            recency_score,
            frequency_score,
            monetary_score,
            rfm_score: recency_score + frequency_score + monetary_score,
            rfm_group: format!("{recency_score}{frequency_score}{monetary_score}"),
            weighted_rfm_score: recency_score * RECENCY_WEIGHT + frequency_score + monetary_score,
        }
    }
}

/// Score every customer in place and return the thresholds used
pub fn score_customers(
    customers: &mut [CustomerRfm],
    method: QuantileMethod,
) -> Result<ScoreThresholds> {
    let recency: Vec<f64> = customers.iter().map(|c| c.recency as f64).collect();
    let frequency: Vec<f64> = customers.iter().map(|c| f64::from(c.frequency)).collect();
    let monetary: Vec<f64> = customers.iter().map(|c| c.monetary).collect();

    let thresholds = ScoreThresholds {
        recency: Quartiles::compute(&recency, method)?,
        frequency: Quartiles::compute(&frequency, method)?,
        monetary: Quartiles::compute(&monetary, method)?,
    };
    debug!(?thresholds, ?method, "computed quartile thresholds");

    for customer in customers.iter_mut() {
        customer.scores = Some(ScoreSet::new(
            recency_score(customer.recency as f64, &thresholds.recency),
            frequency_score(customer.frequency),
            monetary_score(customer.monetary, &thresholds.monetary),
        ));
    }

    Ok(thresholds)
}
