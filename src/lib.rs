//! h3load: an HTTP/3 load-testing harness built on quiche, plus the small
//! origin server it tests against.
//!
//! The library drives many concurrent GET exchanges at a target URL over
//! QUIC, folds every per-request outcome into one aggregate, and renders a
//! latency/throughput report. Individual requests never abort a run: every
//! way an exchange can end (a response, a deadline, a dead connection, a
//! protocol violation) becomes a typed [`Outcome`] that the aggregation
//! layer counts.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`LoadRunner`]: configuration object for a run; owns the batch loop
//!   that admits requests through a [`ConcurrencyGate`] and collects their
//!   outcomes over a channel.
//! - [`ExchangeDriver`]: runs one exchange per fresh QUIC session, the
//!   default isolation mode. [`PooledSession`] is the alternative engine
//!   that multiplexes every request onto one shared session.
//! - [`Outcome`]: the smallest unit of result. Exactly one per request,
//!   whatever happened to it.
//! - [`RunAggregate`]: folds outcomes into counts, a latency series, and a
//!   status-code histogram.
//! - [`RunReport`]: derives throughput and latency statistics from a
//!   finished run and renders the human-readable summary.
//! - [`H3Server`]: a self-contained HTTP/3 origin with a fixed route table,
//!   handy as a well-behaved load target.
//!
//! # Design goals
//!
//! - Outcomes over errors: a batch survives anything a single request does.
//! - One deadline per exchange, covering the handshake too; a request that
//!   exceeds it is a timeout no matter how the session dies afterwards.
//! - Small surface: the binaries are thin wrappers over this library.

/// Outcome aggregation
pub mod aggregate;
/// The product catalog served and probed by the demo endpoints
pub mod catalog;
/// Library-level errors
pub mod error;
/// Single HTTP/3 request/response exchanges and the sessions they ride on
pub mod exchange;
/// Concurrency admission
pub mod gate;
/// Per-request results
pub mod outcome;
/// Statistics and rendering for finished runs
pub mod report;
/// The batch loop that glues everything together
pub mod runner;
/// The demo HTTP/3 origin server
pub mod server;

pub use aggregate::RunAggregate;
pub use catalog::{Catalog, Product};
pub use error::Error;
pub use exchange::{ExchangeConfig, ExchangeDriver, PooledSession, RequestSpec, SessionMode};
pub use gate::ConcurrencyGate;
pub use outcome::{FailureKind, Outcome};
pub use report::{RunReport, RunSummary};
pub use runner::LoadRunner;
pub use server::{H3Server, ServerConfig};
