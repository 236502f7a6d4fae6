use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::outcome::{FailureKind, Outcome};

/// Mergeable accumulator over the [`Outcome`]s of one run.
///
/// The aggregate stores raw, information-preserving data: classification
/// counters, a status-code histogram, and the individual latency samples.
/// Derived statistics (mean, percentiles, throughput) are not computed here;
/// they belong to [`RunReport`](crate::report::RunReport), which is converted
/// from an aggregate once the batch is done. Keeping the raw samples costs
/// one `f64` per measured exchange and is what makes exact rank-based
/// percentiles possible later.
///
/// `merge` is associative and commutative, so worker-local aggregates can be
/// combined in any order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunAggregate {
    /// Every outcome seen, successful or not.
    pub total: usize,
    pub successful: usize,
    /// Connection and protocol failures combined.
    pub errors: usize,
    pub timeouts: usize,
    /// Latency samples in milliseconds, unsorted, one per outcome that
    /// measured a duration.
    pub latencies_ms: Vec<f64>,
    /// Status code -> count, over outcomes that carried a status code.
    pub status_counts: BTreeMap<u16, usize>,
}

impl RunAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incorporate a single outcome.
    pub fn consume(&mut self, outcome: &Outcome) {
        self.total += 1;
        match outcome.failure {
            None => self.successful += 1,
            Some(FailureKind::Timeout) => self.timeouts += 1,
            Some(FailureKind::ConnectionError) | Some(FailureKind::ProtocolError) => {
                self.errors += 1
            }
        }
        if let Some(ms) = outcome.latency_ms() {
            self.latencies_ms.push(ms);
        }
        if let Some(code) = outcome.status_code {
            *self.status_counts.entry(code).or_insert(0) += 1;
        }
    }

    /// Incorporate a batch of outcomes, one [`consume`](Self::consume) each.
    pub fn aggregate(&mut self, outcomes: &[Outcome]) {
        outcomes.iter().for_each(|o| self.consume(o));
    }

    /// Combine two aggregates into one.
    pub fn merge(&mut self, other: Self) {
        self.total += other.total;
        self.successful += other.successful;
        self.errors += other.errors;
        self.timeouts += other.timeouts;
        self.latencies_ms.extend(other.latencies_ms);
        for (code, count) in other.status_counts {
            *self.status_counts.entry(code).or_insert(0) += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn mixed_outcomes() -> Vec<Outcome> {
        vec![
            Outcome::completed(1, Duration::from_millis(10), 200),
            Outcome::completed(2, Duration::from_millis(20), 200),
            Outcome::completed(3, Duration::from_millis(30), 404),
            Outcome::timed_out(4, Duration::from_millis(100)),
            Outcome::connection_error(5, "refused"),
            Outcome::protocol_error(6, "missing :status"),
        ]
    }

    #[test]
    fn counts_partition_the_total() {
        let mut agg = RunAggregate::new();
        agg.aggregate(&mixed_outcomes());

        assert_eq!(agg.total, 6);
        assert_eq!(agg.successful, 3);
        assert_eq!(agg.errors, 2);
        assert_eq!(agg.timeouts, 1);
        assert_eq!(agg.successful + agg.errors + agg.timeouts, agg.total);
    }

    #[test]
    fn latencies_cover_successes_and_timeouts_only() {
        let mut agg = RunAggregate::new();
        agg.aggregate(&mixed_outcomes());

        // 3 successes + 1 timeout measured a duration; the two hard failures
        // never did.
        assert_eq!(agg.latencies_ms.len(), 4);
        assert_eq!(agg.latencies_ms, vec![10.0, 20.0, 30.0, 100.0]);
    }

    #[test]
    fn histogram_totals_never_exceed_success_count() {
        let mut agg = RunAggregate::new();
        agg.aggregate(&mixed_outcomes());

        let histogram_total: usize = agg.status_counts.values().sum();
        assert_eq!(histogram_total, 3);
        assert!(histogram_total <= agg.successful);
        assert_eq!(agg.status_counts.get(&200), Some(&2));
        assert_eq!(agg.status_counts.get(&404), Some(&1));
    }

    #[test]
    fn merge_is_order_independent() {
        let outcomes = mixed_outcomes();
        let (left, right) = outcomes.split_at(3);

        let mut a = RunAggregate::new();
        a.aggregate(left);
        let mut b = RunAggregate::new();
        b.aggregate(right);

        let mut ab = a.clone();
        ab.merge(b.clone());
        let mut ba = b;
        ba.merge(a);

        assert_eq!(ab.total, ba.total);
        assert_eq!(ab.successful, ba.successful);
        assert_eq!(ab.errors, ba.errors);
        assert_eq!(ab.timeouts, ba.timeouts);
        assert_eq!(ab.status_counts, ba.status_counts);
        // Sample multisets match even though append order differs.
        let mut lhs = ab.latencies_ms;
        let mut rhs = ba.latencies_ms;
        lhs.sort_by(f64::total_cmp);
        rhs.sort_by(f64::total_cmp);
        assert_eq!(lhs, rhs);
    }
}
