//! Command-line entry point for the load harness.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use url::Url;

use h3load::{ExchangeConfig, LoadRunner, RunReport, SessionMode};

/// HTTP/3 load tester.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Target URL (https://host:port/path)
    #[arg(long)]
    url: Url,

    /// Concurrent in-flight requests
    #[arg(short, long, default_value_t = 10)]
    concurrency: usize,

    /// Total number of requests to send
    #[arg(short, long, default_value_t = 100)]
    requests: usize,

    /// Per-request timeout, in seconds
    #[arg(short, long, default_value_t = 10.0)]
    timeout: f64,

    /// Session reuse strategy
    #[arg(long, value_enum, default_value = "per-request")]
    session: Session,

    /// Verify the server's TLS certificate
    #[arg(long)]
    verify_peer: bool,

    /// Suppress the per-request progress lines
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Session {
    /// One fresh QUIC session per request
    PerRequest,
    /// One shared QUIC session for the whole run
    Pooled,
}

impl From<Session> for SessionMode {
    fn from(session: Session) -> Self {
        match session {
            Session::PerRequest => SessionMode::PerRequest,
            Session::Pooled => SessionMode::Pooled,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    let exchange = ExchangeConfig::builder()
        .timeout(Duration::from_secs_f64(args.timeout))
        .verify_peer(args.verify_peer)
        .session_mode(args.session.into())
        .build();
    let runner = LoadRunner::builder()
        .url(args.url.clone())
        .concurrency(args.concurrency)
        .total_requests(args.requests)
        .exchange(exchange)
        .progress(!args.quiet)
        .build();

    println!("Starting HTTP/3 load test for {}", args.url);
    println!(
        "Concurrency: {}, Total requests: {}",
        args.concurrency, args.requests
    );
    println!("{}", "-".repeat(50));

    let summary = runner.run().await.context("load test failed")?;
    print!("{}", RunReport::from(summary));
    Ok(())
}
