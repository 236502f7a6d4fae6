//! Single-request probe: is the HTTP/3 endpoint up and answering?
//!
//! Exits 0 on a successful response and 1 otherwise, so it slots into
//! health checks and CI gates.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use url::Url;

use h3load::{ExchangeConfig, ExchangeDriver, RequestSpec};

/// HTTP/3 endpoint probe.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// URL to probe
    #[arg(default_value = "https://localhost:4433/products")]
    url: Url,

    /// Probe timeout, in seconds
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,

    /// Verify the server's TLS certificate
    #[arg(long)]
    verify_peer: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    let spec = match RequestSpec::get(&args.url) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("FAIL: {e}");
            return ExitCode::FAILURE;
        }
    };
    let config = ExchangeConfig::builder()
        .timeout(Duration::from_secs(args.timeout))
        .verify_peer(args.verify_peer)
        .build();

    let outcome = ExchangeDriver::new(spec, config).run(1).await;
    if outcome.is_success() {
        println!(
            "OK: {} responded {} in {:.2}ms",
            args.url,
            outcome.status_code.unwrap_or(0),
            outcome.latency_ms().unwrap_or(0.0),
        );
        ExitCode::SUCCESS
    } else {
        let detail = outcome.detail.as_deref().unwrap_or("timed out");
        println!("FAIL: {} did not answer: {detail}", args.url);
        ExitCode::FAILURE
    }
}
