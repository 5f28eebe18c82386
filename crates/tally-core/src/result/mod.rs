//! Run result: an append-only accumulator while the run is live, and an
//! immutable statistical snapshot once finalized.

pub mod stats;

pub use stats::{percentile_sorted, SummaryStats};

use crate::errors::category;
use crate::model::SampleResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

/// Score at or above which a sample counts as passing.
// TODO: derive from each metric's score_range() once metrics declare thresholds.
pub const PASS_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagStats {
    pub sample_count: usize,
    pub avg_score: Option<f64>,
    pub pass_rate: Option<f64>,
    pub error_rate: f64,
}

#[derive(Debug, Default)]
struct TagAccumulator {
    total: usize,
    errors: usize,
    scored: usize,
    passed: usize,
    scores: Vec<f64>,
}

impl TagAccumulator {
    fn record(&mut self, r: &SampleResult) {
        self.total += 1;
        if r.is_error() {
            self.errors += 1;
        }
        if r.is_scored() {
            self.scored += 1;
            if r.passes(PASS_THRESHOLD) {
                self.passed += 1;
            }
            if let Some(mean) = r.mean_score() {
                self.scores.push(mean);
            }
        }
    }

    fn finalize(&self) -> TagStats {
        TagStats {
            sample_count: self.total,
            avg_score: mean(&self.scores),
            pass_rate: ratio(self.passed, self.scored),
            error_rate: ratio(self.errors, self.total).unwrap_or(0.0),
        }
    }
}

/// Finalized run result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub duration_ms: u64,
    /// Dataset size as reported up front, if known.
    pub total_count: Option<usize>,
    pub sample_count: usize,
    pub completed_count: usize,
    pub error_count: usize,
    pub cancelled: bool,
    pub sample_results: Vec<SampleResult>,
    pub summary_stats: BTreeMap<String, SummaryStats>,
    pub latency_stats: SummaryStats,
    pub pass_rate: Option<f64>,
    pub error_categories: BTreeMap<String, usize>,
    pub by_tag: BTreeMap<String, BTreeMap<String, TagStats>>,
    /// Sample ids that produced more than one result; only the first counted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duplicate_sample_ids: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl EvalResult {
    pub fn result_for(&self, sample_id: &str) -> Option<&SampleResult> {
        self.sample_results.iter().find(|r| r.sample_id == sample_id)
    }
}

/// Mutable run state owned by the pool controller.
#[derive(Debug)]
pub struct ResultAccumulator {
    run_id: String,
    start_time: DateTime<Utc>,
    started: Instant,
    total_count: Option<usize>,
    sample_results: Vec<SampleResult>,
    seen: HashSet<String>,
    duplicates: Vec<String>,
    completed_count: usize,
    error_count: usize,
    scored_count: usize,
    passed_count: usize,
    scores: BTreeMap<String, Vec<f64>>,
    latencies: Vec<f64>,
    error_categories: BTreeMap<String, usize>,
    tags: BTreeMap<String, BTreeMap<String, TagAccumulator>>,
}

impl ResultAccumulator {
    pub fn new(run_id: impl Into<String>, total_count: Option<usize>) -> Self {
        Self {
            run_id: run_id.into(),
            start_time: Utc::now(),
            started: Instant::now(),
            total_count,
            sample_results: Vec::new(),
            seen: HashSet::new(),
            duplicates: Vec::new(),
            completed_count: 0,
            error_count: 0,
            scored_count: 0,
            passed_count: 0,
            scores: BTreeMap::new(),
            latencies: Vec::new(),
            error_categories: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    /// Append one sample outcome. A second result for the same sample id is
    /// rejected, noted in the finalized result, and `false` is returned.
    pub fn record(&mut self, result: SampleResult) -> bool {
        if !self.seen.insert(result.sample_id.clone()) {
            if !self.duplicates.contains(&result.sample_id) {
                self.duplicates.push(result.sample_id);
            }
            return false;
        }

        match &result.error {
            Some(error) => {
                self.error_count += 1;
                *self
                    .error_categories
                    .entry(category::classify(error).as_str().to_string())
                    .or_insert(0) += 1;
            }
            None => self.completed_count += 1,
        }

        if result.is_scored() {
            self.scored_count += 1;
            if result.passes(PASS_THRESHOLD) {
                self.passed_count += 1;
            }
        }

        for (metric, score) in &result.scores {
            self.scores.entry(metric.clone()).or_default().push(*score);
        }
        self.latencies.push(result.latency_ms as f64);

        for (key, value) in &result.tags {
            self.tags
                .entry(key.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .record(&result);
        }

        self.sample_results.push(result);
        true
    }

    pub fn sample_count(&self) -> usize {
        self.sample_results.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed_count
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn duplicate_sample_ids(&self) -> &[String] {
        &self.duplicates
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
    }

    /// Compute statistics and produce the immutable snapshot.
    pub fn finalize(
        &self,
        cancelled: bool,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> EvalResult {
        let summary_stats = self
            .scores
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(metric, values)| (metric.clone(), SummaryStats::from_values(values)))
            .collect();

        let by_tag = self
            .tags
            .iter()
            .map(|(key, values)| {
                let per_value = values
                    .iter()
                    .map(|(value, acc)| (value.clone(), acc.finalize()))
                    .collect();
                (key.clone(), per_value)
            })
            .collect();

        EvalResult {
            run_id: self.run_id.clone(),
            start_time: self.start_time,
            finish_time: Utc::now(),
            duration_ms: self.elapsed_ms(),
            total_count: self.total_count,
            sample_count: self.sample_results.len(),
            completed_count: self.completed_count,
            error_count: self.error_count,
            cancelled,
            sample_results: self.sample_results.clone(),
            summary_stats,
            latency_stats: SummaryStats::from_values(&self.latencies),
            pass_rate: ratio(self.passed_count, self.scored_count),
            error_categories: self.error_categories.clone(),
            by_tag,
            duplicate_sample_ids: self.duplicates.clone(),
            metadata,
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn ratio(num: usize, den: usize) -> Option<f64> {
    if den == 0 {
        None
    } else {
        Some(num as f64 / den as f64)
    }
}
