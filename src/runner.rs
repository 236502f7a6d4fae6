//! Orchestration of a whole load-test batch.
//!
//! The `LoadRunner` fans a fixed number of exchanges through the
//! [`ConcurrencyGate`] and folds their outcomes into one [`RunAggregate`],
//! in whatever order they finish.
//!
//! # High-level flow
//! 1. Build the request from the target URL and pick the session engine for
//!    the configured [`SessionMode`].
//! 2. Spawn a collector task that owns the receiving end of an outcome
//!    channel and aggregates in batches.
//! 3. For every request id (1-based), wait for a gate permit, then spawn a
//!    worker that runs the exchange and sends its outcome down the channel.
//!    The permit rides inside the worker so it returns no matter how the
//!    exchange ends, panics included.
//! 4. Drop the local sender, join the workers, and take the aggregate from
//!    the collector. A lost worker shrinks the totals; it never aborts the
//!    batch.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};
use typed_builder::TypedBuilder;
use url::Url;

use crate::aggregate::RunAggregate;
use crate::error::Error;
use crate::exchange::{ExchangeConfig, ExchangeDriver, PooledSession, RequestSpec, SessionMode};
use crate::gate::ConcurrencyGate;
use crate::outcome::Outcome;
use crate::report::RunSummary;

/// Drives `total_requests` exchanges against one URL, at most `concurrency`
/// of them in flight at a time.
#[derive(Debug, Clone, TypedBuilder)]
pub struct LoadRunner {
    pub url: Url,
    #[builder(default = 10)]
    pub concurrency: usize,
    #[builder(default = 100)]
    pub total_requests: usize,
    #[builder(default)]
    pub exchange: ExchangeConfig,
    /// Print one line per finished exchange, as it finishes.
    #[builder(default = false)]
    pub progress: bool,
}

impl LoadRunner {
    /// Run the whole batch and summarize it.
    ///
    /// Individual exchanges never fail this call; their problems live in the
    /// aggregate. The errors here are the up-front kind: a URL that cannot be
    /// turned into a request, or a concurrency of zero.
    pub async fn run(&self) -> Result<RunSummary, Error> {
        let spec = RequestSpec::get(&self.url)?;
        let gate = ConcurrencyGate::new(self.concurrency)?;

        info!(
            url = %self.url,
            concurrency = self.concurrency,
            total_requests = self.total_requests,
            session_mode = ?self.exchange.session_mode,
            "starting load test run..."
        );
        let started = Instant::now();

        let aggregate = match self.exchange.session_mode {
            SessionMode::PerRequest => {
                let driver = Arc::new(ExchangeDriver::new(spec, self.exchange.clone()));
                self.run_batch(gate, move |request_id| {
                    let driver = driver.clone();
                    async move { driver.run(request_id).await }
                })
                .await
            }
            SessionMode::Pooled => {
                let pool = PooledSession::connect(spec, self.exchange.clone());
                self.run_batch(gate, move |request_id| {
                    let pool = pool.clone();
                    async move { pool.submit(request_id).await }
                })
                .await
            }
        };

        let wall_time = started.elapsed();
        info!(outcomes = aggregate.total, ?wall_time, "load test run finished");
        Ok(RunSummary {
            url: self.url.to_string(),
            wall_time,
            aggregate,
        })
    }

    /// Gate, spawn, and collect one batch. `action` runs one exchange to its
    /// outcome and is infallible by construction.
    async fn run_batch<F, Fut>(&self, gate: ConcurrencyGate, action: F) -> RunAggregate
    where
        F: Fn(u64) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let buffer = gate.limit() * 10;
        let (outcome_tx, outcome_rx) = mpsc::channel(buffer);
        let collector = tokio::spawn(collect_outcomes(outcome_rx, buffer, self.progress));

        let mut workers = Vec::with_capacity(self.total_requests);
        for i in 0..self.total_requests {
            let request_id = (i + 1) as u64;
            let permit = match gate.admit().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(request_id, "concurrency gate refused a permit: {e}");
                    break;
                }
            };
            let tx = outcome_tx.clone();
            let fut = action(request_id);
            workers.push(tokio::spawn(async move {
                let outcome = fut.await;
                drop(permit);
                if tx.send(outcome).await.is_err() {
                    debug!(request_id, "outcome collector is gone");
                }
            }));
        }
        drop(outcome_tx);

        for result in join_all(workers).await {
            if let Err(e) = result {
                // The permit already returned on unwind; the batch goes on.
                error!("exchange worker failed: {e}");
            }
        }

        match collector.await {
            Ok(aggregate) => aggregate,
            Err(e) => {
                error!("outcome collector failed: {e}");
                RunAggregate::new()
            }
        }
    }
}

/// Collector task: drains the outcome channel in batches until every sender
/// is gone, printing progress lines along the way when asked to.
async fn collect_outcomes(
    mut rx: mpsc::Receiver<Outcome>,
    batch_size: usize,
    progress: bool,
) -> RunAggregate {
    let mut aggregate = RunAggregate::new();
    let mut batch = Vec::new();

    loop {
        // Block for the first outcome, then soak up whatever else is ready.
        match rx.recv().await {
            Some(outcome) => batch.push(outcome),
            None => break,
        }
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(outcome) => batch.push(outcome),
                Err(_) => break,
            }
        }

        for outcome in batch.drain(..) {
            if progress {
                println!("{}", outcome.progress_line());
            }
            aggregate.consume(&outcome);
        }
    }

    debug!(outcomes = aggregate.total, "collector drained");
    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn runner(concurrency: usize, total_requests: usize) -> LoadRunner {
        LoadRunner::builder()
            .url(Url::parse("https://localhost:4433/").unwrap())
            .concurrency(concurrency)
            .total_requests(total_requests)
            .build()
    }

    #[tokio::test]
    async fn outcomes_fold_into_the_aggregate() {
        let runner = runner(2, 3);
        let gate = ConcurrencyGate::new(2).unwrap();
        let aggregate = runner
            .run_batch(gate, |id| async move {
                Outcome::completed(id, Duration::from_millis(10), 200)
            })
            .await;

        assert_eq!(aggregate.total, 3);
        assert_eq!(aggregate.successful, 3);
        assert_eq!(aggregate.errors, 0);
        assert_eq!(aggregate.timeouts, 0);
        assert_eq!(aggregate.status_counts.get(&200), Some(&3));
        assert_eq!(aggregate.latencies_ms.len(), 3);
    }

    #[tokio::test]
    async fn mixed_outcomes_partition_the_totals() {
        let runner = runner(4, 4);
        let gate = ConcurrencyGate::new(4).unwrap();
        let aggregate = runner
            .run_batch(gate, |id| async move {
                match id {
                    1 => Outcome::completed(1, Duration::from_millis(5), 200),
                    2 => Outcome::timed_out(2, Duration::from_millis(100)),
                    3 => Outcome::connection_error(3, "refused"),
                    _ => Outcome::completed(id, Duration::from_millis(7), 404),
                }
            })
            .await;

        assert_eq!(aggregate.total, 4);
        assert_eq!(aggregate.successful, 2);
        assert_eq!(aggregate.timeouts, 1);
        assert_eq!(aggregate.errors, 1);
        assert_eq!(aggregate.status_counts.get(&200), Some(&1));
        assert_eq!(aggregate.status_counts.get(&404), Some(&1));
        // Two successes plus the timeout carry a measured duration.
        assert_eq!(aggregate.latencies_ms.len(), 3);
    }

    #[tokio::test]
    async fn gate_bounds_in_flight_exchanges() {
        let limit = 2;
        let runner = runner(limit, 16);
        let gate = ConcurrencyGate::new(limit).unwrap();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));
        let aggregate = {
            let in_flight = in_flight.clone();
            let high_water = high_water.clone();
            runner
                .run_batch(gate, move |id| {
                    let in_flight = in_flight.clone();
                    let high_water = high_water.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        high_water.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Outcome::completed(id, Duration::from_millis(5), 200)
                    }
                })
                .await
        };

        assert_eq!(aggregate.total, 16);
        assert!(high_water.load(Ordering::SeqCst) <= limit);
    }

    #[tokio::test]
    async fn worker_panic_does_not_sink_the_batch() {
        let runner = runner(1, 3);
        let gate = ConcurrencyGate::new(1).unwrap();
        let aggregate = runner
            .run_batch(gate, |id| async move {
                if id == 2 {
                    panic!("worker blew up");
                }
                Outcome::completed(id, Duration::from_millis(1), 200)
            })
            .await;

        // With a single permit, finishing at all proves the panicked
        // worker's permit came back.
        assert_eq!(aggregate.total, 2);
        assert_eq!(aggregate.successful, 2);
    }

    #[tokio::test]
    async fn run_rejects_zero_concurrency() {
        let runner = LoadRunner::builder()
            .url(Url::parse("https://localhost:4433/").unwrap())
            .concurrency(0)
            .total_requests(1)
            .build();
        assert!(matches!(runner.run().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn timed_out_outcomes_report_roughly_the_deadline() {
        let runner = runner(2, 2);
        let gate = ConcurrencyGate::new(2).unwrap();
        let aggregate = runner
            .run_batch(gate, |id| async move {
                Outcome::timed_out(id, Duration::from_millis(100))
            })
            .await;

        assert_eq!(aggregate.timeouts, 2);
        assert_eq!(aggregate.successful, 0);
        for latency in &aggregate.latencies_ms {
            assert!((*latency - 100.0).abs() < f64::EPSILON);
        }
    }
}
