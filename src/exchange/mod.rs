//! Exchange core: one logical HTTP/3 request driven to a terminal outcome.
//!
//! An exchange owns the life of a single request: open a stream, emit the
//! request headers (and body, when present), then pump transport events until
//! the response completes, the deadline elapses, or something breaks. The
//! [`ExchangeDriver`] runs each exchange over a fresh QUIC session; the
//! [`PooledSession`] multiplexes many exchanges over one shared session.
//! Which one a run uses is a configuration choice ([`SessionMode`]).

pub mod driver;
pub mod pool;

pub use driver::ExchangeDriver;
pub use pool::PooledSession;

use std::time::Duration;

use quiche::h3::NameValue;
use tokio::time::Instant;
use typed_builder::TypedBuilder;
use url::Url;

use crate::error::Error;
use crate::outcome::{FailureKind, Outcome};

const USER_AGENT: &str = concat!("h3load/", env!("CARGO_PKG_VERSION"));

/// How exchanges map onto transport sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionMode {
    /// One fresh QUIC session per exchange. Isolation is total (a transport
    /// failure cannot cascade across exchanges) at the cost of a handshake
    /// per request.
    #[default]
    PerRequest,
    /// One shared QUIC session; exchanges multiplex over its streams.
    Pooled,
}

/// Per-exchange tuning knobs.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ExchangeConfig {
    /// Deadline for the whole exchange, handshake included.
    #[builder(default = Duration::from_secs(10))]
    pub timeout: Duration,
    /// How long to wait for inbound datagrams when no event is available.
    #[builder(default = Duration::from_millis(10))]
    pub idle_backoff: Duration,
    /// How often pending outbound data is flushed while the loop is idle.
    /// The default matches the idle backoff, i.e. every idle tick.
    #[builder(default = Duration::from_millis(10))]
    pub retransmit_interval: Duration,
    /// Verify the server certificate. Off by default because the harness
    /// usually targets self-signed demo servers.
    #[builder(default = false)]
    pub verify_peer: bool,
    #[builder(default)]
    pub session_mode: SessionMode,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// What to send: method, target and headers, derived from a validated URL.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: String,
    pub scheme: String,
    /// Host, plus the port when the URL spelled one out.
    pub authority: String,
    /// SNI name for the handshake.
    pub server_name: String,
    /// Port actually dialed (scheme default when the URL has none).
    pub port: u16,
    /// Path plus query, never empty.
    pub path: String,
    /// Ordinary application headers appended after the pseudo-headers.
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl RequestSpec {
    /// A bodyless GET for the given URL. Rejects anything that is not
    /// `https` before any socket work happens.
    pub fn get(url: &Url) -> Result<Self, Error> {
        if url.scheme() != "https" {
            return Err(Error::Url {
                url: url.to_string(),
                reason: "scheme must be https".to_string(),
            });
        }
        let host = url.host_str().ok_or_else(|| Error::Url {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })?;

        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        // IPv6 hosts come bracketed; lookup and SNI want the bare address.
        let server_name = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        Ok(Self {
            method: "GET".to_string(),
            scheme: "https".to_string(),
            authority,
            server_name,
            port: url.port_or_known_default().unwrap_or(443),
            path,
            headers: vec![("user-agent".to_string(), USER_AGENT.to_string())],
            body: None,
        })
    }

    /// The full header block for the wire: pseudo-headers first, then the
    /// application headers.
    pub fn h3_headers(&self) -> Vec<quiche::h3::Header> {
        let mut headers = vec![
            quiche::h3::Header::new(b":method", self.method.as_bytes()),
            quiche::h3::Header::new(b":scheme", self.scheme.as_bytes()),
            quiche::h3::Header::new(b":authority", self.authority.as_bytes()),
            quiche::h3::Header::new(b":path", self.path.as_bytes()),
        ];
        for (name, value) in &self.headers {
            headers.push(quiche::h3::Header::new(name.as_bytes(), value.as_bytes()));
        }
        headers
    }
}

/// Lifecycle of one exchange's response side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExchangeState {
    Pending,
    HeadersSent,
    AwaitingResponse,
    Completed,
    Failed(FailureKind),
    TimedOut,
}

/// Response-side state for a single request stream.
///
/// The surrounding driver owns the transport; this type only tracks what the
/// drained events mean for one stream, which keeps every transition a pure,
/// synchronous step that unit tests can poke directly.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub request_id: u64,
    pub stream_id: u64,
    pub state: ExchangeState,
    pub started_at: Instant,
    pub status_code: Option<u16>,
    pub response_bytes: Vec<u8>,
    failure_detail: Option<String>,
}

impl Exchange {
    pub fn new(request_id: u64, stream_id: u64, started_at: Instant) -> Self {
        Self {
            request_id,
            stream_id,
            state: ExchangeState::Pending,
            started_at,
            status_code: None,
            response_bytes: Vec::new(),
            failure_detail: None,
        }
    }

    /// Request headers (and body, if any) are on the wire.
    pub fn mark_sent(&mut self) {
        if self.state == ExchangeState::Pending {
            self.state = ExchangeState::HeadersSent;
        }
    }

    /// A Headers event arrived for this stream.
    ///
    /// Informational (1xx) statuses are recorded provisionally and stay
    /// overwritable; a final status sticks. Headers after a final status are
    /// trailers and carry no status at all. A status-bearing position without
    /// `:status` is a protocol violation.
    pub fn on_headers(&mut self, list: &[quiche::h3::Header]) {
        if self.is_terminal() {
            return;
        }
        match (self.status_code, status_from_headers(list)) {
            // Trailers after the final response headers.
            (Some(current), _) if current >= 200 => {}
            (_, Some(status)) => {
                self.status_code = Some(status);
                self.state = ExchangeState::AwaitingResponse;
            }
            (_, None) => self.fail(FailureKind::ProtocolError, "headers without a :status"),
        }
    }

    /// Response body bytes arrived for this stream.
    pub fn on_data(&mut self, bytes: &[u8]) {
        if self.is_terminal() {
            return;
        }
        self.response_bytes.extend_from_slice(bytes);
        self.state = ExchangeState::AwaitingResponse;
    }

    /// The peer finished its side of the stream.
    pub fn on_finished(&mut self) {
        if self.is_terminal() {
            return;
        }
        match self.status_code {
            Some(status) if status >= 200 => self.state = ExchangeState::Completed,
            _ => self.fail(
                FailureKind::ProtocolError,
                "stream finished without a final status",
            ),
        }
    }

    /// The peer reset this stream.
    pub fn on_reset(&mut self, error_code: u64) {
        if self.is_terminal() {
            return;
        }
        self.fail(
            FailureKind::ProtocolError,
            format!("stream reset by peer (error code {error_code})"),
        );
    }

    pub fn fail(&mut self, kind: FailureKind, detail: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.state = ExchangeState::Failed(kind);
        self.failure_detail = Some(detail.into());
    }

    /// The deadline elapsed before any terminal event.
    pub fn deadline_expired(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.state = ExchangeState::TimedOut;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ExchangeState::Completed | ExchangeState::Failed(_) | ExchangeState::TimedOut
        )
    }

    /// Convert the terminal state into the exchange's one outcome.
    pub fn into_outcome(self) -> Outcome {
        let elapsed = self.started_at.elapsed();
        let detail = self
            .failure_detail
            .unwrap_or_else(|| "unknown failure".to_string());
        match (self.state, self.status_code) {
            (ExchangeState::Completed, Some(status)) => {
                Outcome::completed(self.request_id, elapsed, status)
            }
            (ExchangeState::Completed, None) => Outcome::protocol_error(
                self.request_id,
                "stream finished without a final status",
            ),
            (ExchangeState::TimedOut, _) => Outcome::timed_out(self.request_id, elapsed),
            (ExchangeState::Failed(FailureKind::ConnectionError), _) => {
                Outcome::connection_error(self.request_id, detail)
            }
            (ExchangeState::Failed(_), _) => Outcome::protocol_error(self.request_id, detail),
            // Non-terminal states never reach here through the drivers.
            _ => Outcome::connection_error(
                self.request_id,
                "exchange ended before a terminal state",
            ),
        }
    }
}

/// Extract and parse the `:status` pseudo-header.
pub(crate) fn status_from_headers(list: &[quiche::h3::Header]) -> Option<u16> {
    list.iter()
        .find(|h| h.name() == b":status")
        .and_then(|h| std::str::from_utf8(h.value()).ok())
        .and_then(|s| s.parse::<u16>().ok())
}

/// Map an HTTP/3-layer error to the failure taxonomy: errors that originate
/// in the transport count as connection failures, everything else is a
/// protocol violation.
pub(crate) fn h3_failure(e: &quiche::h3::Error) -> FailureKind {
    match e {
        quiche::h3::Error::TransportError(_) => FailureKind::ConnectionError,
        _ => FailureKind::ProtocolError,
    }
}

/// Classify a library error produced inside an exchange.
pub(crate) fn classify_error(e: &Error) -> FailureKind {
    match e {
        Error::Http3(h3e) => h3_failure(h3e),
        _ => FailureKind::ConnectionError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<quiche::h3::Header> {
        pairs
            .iter()
            .map(|(name, value)| quiche::h3::Header::new(name.as_bytes(), value.as_bytes()))
            .collect()
    }

    mod request_spec {
        use super::*;

        #[test]
        fn rejects_plain_http() {
            let url = Url::parse("http://localhost:4433/").unwrap();
            assert!(matches!(
                RequestSpec::get(&url),
                Err(Error::Url { .. })
            ));
        }

        #[test]
        fn authority_keeps_an_explicit_port() {
            let url = Url::parse("https://localhost:4433/").unwrap();
            let spec = RequestSpec::get(&url).unwrap();
            assert_eq!(spec.authority, "localhost:4433");
            assert_eq!(spec.port, 4433);
            assert_eq!(spec.path, "/");
        }

        #[test]
        fn default_port_stays_out_of_the_authority() {
            let url = Url::parse("https://example.com/products").unwrap();
            let spec = RequestSpec::get(&url).unwrap();
            assert_eq!(spec.authority, "example.com");
            assert_eq!(spec.port, 443);
            assert_eq!(spec.path, "/products");
        }

        #[test]
        fn query_rides_along_in_the_path() {
            let url = Url::parse("https://example.com/search?q=h3").unwrap();
            let spec = RequestSpec::get(&url).unwrap();
            assert_eq!(spec.path, "/search?q=h3");
        }

        #[test]
        fn header_block_leads_with_pseudo_headers() {
            let url = Url::parse("https://localhost:4433/").unwrap();
            let spec = RequestSpec::get(&url).unwrap();
            let block = spec.h3_headers();
            assert_eq!(block[0].name(), b":method");
            assert_eq!(block[0].value(), b"GET");
            assert_eq!(block[1].name(), b":scheme");
            assert_eq!(block[2].name(), b":authority");
            assert_eq!(block[3].name(), b":path");
            assert_eq!(block[4].name(), b"user-agent");
        }
    }

    mod state_machine {
        use super::*;

        fn fresh() -> Exchange {
            let mut exchange = Exchange::new(1, 0, Instant::now());
            exchange.mark_sent();
            exchange
        }

        #[test]
        fn headers_then_finished_completes() {
            let mut ex = fresh();
            ex.on_headers(&headers(&[(":status", "200")]));
            assert_eq!(ex.state, ExchangeState::AwaitingResponse);
            assert!(!ex.is_terminal());

            ex.on_finished();
            assert_eq!(ex.state, ExchangeState::Completed);
            let outcome = ex.into_outcome();
            assert!(outcome.is_success());
            assert_eq!(outcome.status_code, Some(200));
        }

        #[test]
        fn empty_body_is_a_valid_success() {
            let mut ex = fresh();
            ex.on_headers(&headers(&[(":status", "204")]));
            ex.on_finished();
            assert_eq!(ex.state, ExchangeState::Completed);
            assert!(ex.response_bytes.is_empty());
        }

        #[test]
        fn body_bytes_accumulate() {
            let mut ex = fresh();
            ex.on_headers(&headers(&[(":status", "200")]));
            ex.on_data(b"Hello, ");
            ex.on_data(b"HTTP/3!");
            ex.on_finished();
            assert_eq!(ex.response_bytes, b"Hello, HTTP/3!");
        }

        #[test]
        fn missing_status_is_a_protocol_error() {
            let mut ex = fresh();
            ex.on_headers(&headers(&[("content-type", "text/plain")]));
            assert_eq!(
                ex.state,
                ExchangeState::Failed(FailureKind::ProtocolError)
            );
            let outcome = ex.into_outcome();
            assert_eq!(outcome.failure, Some(FailureKind::ProtocolError));
            assert_eq!(outcome.duration, None);
        }

        #[test]
        fn informational_status_does_not_finalize() {
            let mut ex = fresh();
            ex.on_headers(&headers(&[(":status", "103")]));
            assert_eq!(ex.status_code, Some(103));
            assert!(!ex.is_terminal());

            ex.on_headers(&headers(&[(":status", "200")]));
            assert_eq!(ex.status_code, Some(200));
            ex.on_finished();
            assert_eq!(ex.state, ExchangeState::Completed);
        }

        #[test]
        fn finishing_on_an_informational_status_alone_is_an_error() {
            let mut ex = fresh();
            ex.on_headers(&headers(&[(":status", "103")]));
            ex.on_finished();
            assert_eq!(
                ex.state,
                ExchangeState::Failed(FailureKind::ProtocolError)
            );
        }

        #[test]
        fn trailers_after_a_final_status_are_ignored() {
            let mut ex = fresh();
            ex.on_headers(&headers(&[(":status", "200")]));
            ex.on_data(b"body");
            ex.on_headers(&headers(&[("x-checksum", "abc")]));
            assert_eq!(ex.status_code, Some(200));
            ex.on_finished();
            assert_eq!(ex.state, ExchangeState::Completed);
        }

        #[test]
        fn reset_fails_the_exchange() {
            let mut ex = fresh();
            ex.on_reset(0x10c);
            assert_eq!(
                ex.state,
                ExchangeState::Failed(FailureKind::ProtocolError)
            );
        }

        #[test]
        fn deadline_beats_everything_else_that_never_arrived() {
            let mut ex = fresh();
            ex.deadline_expired();
            assert_eq!(ex.state, ExchangeState::TimedOut);
            let outcome = ex.into_outcome();
            assert_eq!(outcome.failure, Some(FailureKind::Timeout));
            assert!(outcome.duration.is_some());
        }

        #[test]
        fn terminal_states_are_sticky() {
            let mut ex = fresh();
            ex.on_headers(&headers(&[(":status", "200")]));
            ex.on_finished();
            ex.deadline_expired();
            ex.on_reset(1);
            assert_eq!(ex.state, ExchangeState::Completed);
        }
    }

    mod classification {
        use super::*;

        #[test]
        fn transport_wrapped_errors_are_connection_failures() {
            let e = quiche::h3::Error::TransportError(quiche::Error::InvalidState);
            assert_eq!(h3_failure(&e), FailureKind::ConnectionError);
        }

        #[test]
        fn framing_errors_are_protocol_failures() {
            assert_eq!(
                h3_failure(&quiche::h3::Error::FrameError),
                FailureKind::ProtocolError
            );
            assert_eq!(
                h3_failure(&quiche::h3::Error::MissingSettings),
                FailureKind::ProtocolError
            );
        }

        #[test]
        fn io_errors_are_connection_failures() {
            let e = Error::Io(std::io::Error::other("socket gone"));
            assert_eq!(classify_error(&e), FailureKind::ConnectionError);
        }
    }

    #[test]
    fn status_parsing_tolerates_garbage() {
        assert_eq!(status_from_headers(&headers(&[(":status", "200")])), Some(200));
        assert_eq!(status_from_headers(&headers(&[(":status", "abc")])), None);
        assert_eq!(status_from_headers(&headers(&[("x", "y")])), None);
    }
}
