use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::RunAggregate;

/// Everything the runner hands over once a batch finishes: the folded
/// aggregate plus the context the aggregate itself cannot know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub url: String,
    /// Wall-clock duration of the whole batch.
    pub wall_time: Duration,
    pub aggregate: RunAggregate,
}

/// Derived statistics for one run, ready for humans or machines.
///
/// A `RunReport` is a pure data transformation of a [`RunSummary`]: sorting,
/// averaging, and rank-based percentiles happen exactly once, here. Latency
/// fields are `None` when the run produced no measured samples (for example
/// when every exchange failed at the connection layer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub url: String,
    pub wall_time: Duration,
    pub total: usize,
    pub successful: usize,
    pub errors: usize,
    pub timeouts: usize,
    /// Measured exchanges per second of batch wall time.
    pub requests_per_sec: f64,
    pub mean_ms: Option<f64>,
    pub median_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub status_counts: BTreeMap<u16, usize>,
}

impl From<RunSummary> for RunReport {
    fn from(summary: RunSummary) -> Self {
        let RunSummary {
            url,
            wall_time,
            aggregate,
        } = summary;

        let mut sorted = aggregate.latencies_ms.clone();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();

        let wall_secs = wall_time.as_secs_f64();
        let requests_per_sec = if wall_secs > 0.0 {
            n as f64 / wall_secs
        } else {
            0.0
        };

        Self {
            url,
            wall_time,
            total: aggregate.total,
            successful: aggregate.successful,
            errors: aggregate.errors,
            timeouts: aggregate.timeouts,
            requests_per_sec,
            mean_ms: (n > 0).then(|| sorted.iter().sum::<f64>() / n as f64),
            median_ms: median(&sorted),
            min_ms: sorted.first().copied(),
            max_ms: sorted.last().copied(),
            p95_ms: rank_percentile(&sorted, 0.95),
            p99_ms: rank_percentile(&sorted, 0.99),
            status_counts: aggregate.status_counts,
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(50))?;
        writeln!(f, "HTTP/3 LOAD TEST RESULTS")?;
        writeln!(f, "{}", "=".repeat(50))?;
        writeln!(f, "URL: {}", self.url)?;
        writeln!(f, "Total time: {:.2}s", self.wall_time.as_secs_f64())?;
        writeln!(f, "Total requests: {}", self.total)?;
        writeln!(f, "Successful: {}", self.successful)?;
        writeln!(f, "Errors: {}", self.errors)?;
        writeln!(f, "Timeouts: {}", self.timeouts)?;
        writeln!(f, "Requests/sec: {:.2}", self.requests_per_sec)?;

        if let (Some(mean), Some(median), Some(max), Some(min), Some(p95), Some(p99)) = (
            self.mean_ms,
            self.median_ms,
            self.max_ms,
            self.min_ms,
            self.p95_ms,
            self.p99_ms,
        ) {
            writeln!(f)?;
            writeln!(f, "Response times (ms):")?;
            writeln!(f, "  Mean: {mean:.2}")?;
            writeln!(f, "  Median: {median:.2}")?;
            writeln!(f, "  Max: {max:.2}")?;
            writeln!(f, "  Min: {min:.2}")?;
            writeln!(f, "  95th percentile: {p95:.2}")?;
            writeln!(f, "  99th percentile: {p99:.2}")?;
        }

        writeln!(f)?;
        writeln!(f, "Status codes:")?;
        for (code, count) in &self.status_counts {
            writeln!(f, "  {code}: {count} requests")?;
        }
        Ok(())
    }
}

/// Rank-based percentile over an ascending-sorted sample list.
///
/// Index is `floor(p * n)` clamped to `n - 1`, with no interpolation between
/// neighboring samples, so the same sample set always yields the exact same
/// value regardless of input order.
pub fn rank_percentile(sorted: &[f64], p: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let idx = ((p * n as f64).floor() as usize).min(n - 1);
    Some(sorted[idx])
}

/// Classic median over an ascending-sorted sample list: midpoint average for
/// an even number of samples.
pub fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod rank_percentile {
        use super::*;

        #[test]
        fn empty_yields_none() {
            assert_eq!(rank_percentile(&[], 0.95), None);
        }

        #[test]
        fn single_sample_is_every_percentile() {
            assert_eq!(rank_percentile(&[5.0], 0.5), Some(5.0));
            assert_eq!(rank_percentile(&[5.0], 0.95), Some(5.0));
            assert_eq!(rank_percentile(&[5.0], 0.99), Some(5.0));
        }

        #[test]
        fn index_is_floor_of_p_times_n() {
            // n = 20, floor(0.95 * 20) = 19, the last element.
            let sorted: Vec<f64> = (1..=20).map(f64::from).collect();
            assert_eq!(rank_percentile(&sorted, 0.95), Some(20.0));

            // n = 100, floor(0.95 * 100) = 95 (0-indexed).
            let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
            assert_eq!(rank_percentile(&sorted, 0.95), Some(96.0));
            assert_eq!(rank_percentile(&sorted, 0.99), Some(100.0));
        }

        #[test]
        fn index_clamps_to_last_element() {
            let sorted = [1.0, 2.0, 3.0];
            assert_eq!(rank_percentile(&sorted, 1.0), Some(3.0));
        }
    }

    mod median {
        use super::*;

        #[test]
        fn odd_count_takes_middle() {
            assert_eq!(median(&[1.0, 2.0, 9.0]), Some(2.0));
        }

        #[test]
        fn even_count_averages_midpoints() {
            assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), Some(2.5));
        }

        #[test]
        fn empty_yields_none() {
            assert_eq!(median(&[]), None);
        }
    }

    fn summary_with(latencies_ms: Vec<f64>) -> RunSummary {
        let mut aggregate = RunAggregate::new();
        aggregate.total = latencies_ms.len();
        aggregate.successful = latencies_ms.len();
        aggregate.latencies_ms = latencies_ms;
        RunSummary {
            url: "https://localhost:4433/".to_string(),
            wall_time: Duration::from_secs(2),
            aggregate,
        }
    }

    #[test]
    fn derivations_from_known_samples() {
        let report = RunReport::from(summary_with(vec![30.0, 10.0, 20.0, 40.0]));

        assert_eq!(report.mean_ms, Some(25.0));
        assert_eq!(report.median_ms, Some(25.0));
        assert_eq!(report.min_ms, Some(10.0));
        assert_eq!(report.max_ms, Some(40.0));
        // floor(0.95 * 4) = 3.
        assert_eq!(report.p95_ms, Some(40.0));
        // 4 measured samples over 2 seconds.
        assert_eq!(report.requests_per_sec, 2.0);
    }

    #[test]
    fn percentiles_are_stable_under_input_reordering() {
        let a = RunReport::from(summary_with(vec![5.0, 1.0, 4.0, 2.0, 3.0]));
        let b = RunReport::from(summary_with(vec![3.0, 2.0, 5.0, 4.0, 1.0]));
        assert_eq!(a.p95_ms, b.p95_ms);
        assert_eq!(a.p99_ms, b.p99_ms);
        assert_eq!(a.median_ms, b.median_ms);
    }

    #[test]
    fn no_samples_means_no_latency_block() {
        let mut aggregate = RunAggregate::new();
        aggregate.total = 2;
        aggregate.errors = 2;
        let report = RunReport::from(RunSummary {
            url: "https://localhost:4433/".to_string(),
            wall_time: Duration::from_secs(1),
            aggregate,
        });

        assert_eq!(report.mean_ms, None);
        assert_eq!(report.requests_per_sec, 0.0);
        let rendered = report.to_string();
        assert!(!rendered.contains("Response times"));
        assert!(rendered.contains("Errors: 2"));
    }

    #[test]
    fn rendered_fields_match_the_stable_set() {
        let mut report = RunReport::from(summary_with(vec![10.0, 20.0]));
        report.status_counts.insert(200, 2);
        let rendered = report.to_string();

        assert!(rendered.contains("HTTP/3 LOAD TEST RESULTS"));
        assert!(rendered.contains("URL: https://localhost:4433/"));
        assert!(rendered.contains("Total time: 2.00s"));
        assert!(rendered.contains("Requests/sec: 1.00"));
        assert!(rendered.contains("  Mean: 15.00"));
        assert!(rendered.contains("  200: 2 requests"));
    }
}
