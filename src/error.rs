use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the library's fallible setup and I/O paths.
///
/// Per-request failures during a load run are not errors in this sense: they
/// are converted into typed [`Outcome`](crate::Outcome) records so a single
/// bad exchange can never abort the batch. This type covers everything that
/// happens before or around a batch: configuration validation, URL parsing,
/// socket setup, TLS credentials, and the shared-session handshake.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected configuration, e.g. a concurrency limit of zero.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The target URL cannot be used for an HTTP/3 exchange.
    #[error("invalid target url `{url}`: {reason}")]
    Url { url: String, reason: String },

    /// A TLS certificate or private key is missing or unreadable.
    #[error(
        "cannot load TLS credentials from `{}`: {reason} \
         (generate a self-signed pair with: openssl req -new -x509 -days 365 \
         -nodes -out cert.pem -keyout key.pem -subj \"/CN=localhost\")",
        .path.display()
    )]
    Credentials { path: PathBuf, reason: String },

    /// The concurrency gate was closed while a caller was waiting on it.
    #[error("concurrency gate closed")]
    GateClosed,

    /// A malformed catalog payload.
    #[error("invalid catalog payload: {0}")]
    Catalog(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// QUIC transport failure reported by the underlying stack.
    #[error("quic transport: {0}")]
    Quic(#[from] quiche::Error),

    /// HTTP/3 layer failure reported by the underlying stack.
    #[error("http/3: {0}")]
    Http3(#[from] quiche::h3::Error),
}
