//! Command-line entry point for the demo origin server.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use h3load::{Catalog, H3Server, ServerConfig};

/// Demo HTTP/3 origin server for load test runs.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    listen: SocketAddr,

    /// PEM certificate chain
    #[arg(long, default_value = "cert.pem")]
    cert: PathBuf,

    /// PEM private key
    #[arg(long, default_value = "key.pem")]
    key: PathBuf,

    /// JSON file with the product catalog; built-in products when omitted
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let catalog = match &args.catalog {
        Some(path) => Catalog::from_file(path)
            .with_context(|| format!("failed to load catalog from {}", path.display()))?,
        None => Catalog::builtin(),
    };

    let config = ServerConfig::builder()
        .listen(args.listen)
        .cert(args.cert)
        .key(args.key)
        .catalog(catalog)
        .build();
    let mut server = H3Server::new(config)?;
    server
        .bind()
        .await
        .context("failed to bind listen address")?;

    tokio::select! {
        result = server.run() => result.context("server failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}
