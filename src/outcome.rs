use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Why an exchange failed to produce a successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Transport-level failure: unreachable host, handshake failure, or a
    /// connection that was closed or reset underneath the request.
    ConnectionError,
    /// HTTP/3-layer violation: malformed framing, a reset request stream, or
    /// a response without a final `:status`.
    ProtocolError,
    /// The per-request deadline elapsed before a terminal response event.
    Timeout,
}

/// The immutable record produced exactly once per exchange.
///
/// An `Outcome` is the smallest unit the harness measures. Exchange drivers
/// emit one per logical request, regardless of how the request ended, and the
/// run aggregate consumes them without assuming completion order.
///
/// Field semantics follow the measurement rules of the harness:
/// - `duration` is present for completed and timed-out exchanges (both
///   measured wall time from exchange start to the terminal state); exchanges
///   that failed at the transport or protocol layer carry no sample.
/// - `status_code` is only present on successful exchanges, so a status-code
///   histogram can never count more entries than there were successes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub request_id: u64,
    pub success: bool,
    pub duration: Option<Duration>,
    pub status_code: Option<u16>,
    pub failure: Option<FailureKind>,
    /// Human-readable failure detail for progress output.
    pub detail: Option<String>,
}

impl Outcome {
    /// A response was received and the stream closed cleanly.
    pub fn completed(request_id: u64, duration: Duration, status_code: u16) -> Self {
        Self {
            request_id,
            success: true,
            duration: Some(duration),
            status_code: Some(status_code),
            failure: None,
            detail: None,
        }
    }

    /// The deadline elapsed first. The measured duration is still recorded.
    pub fn timed_out(request_id: u64, duration: Duration) -> Self {
        Self {
            request_id,
            success: false,
            duration: Some(duration),
            status_code: None,
            failure: Some(FailureKind::Timeout),
            detail: None,
        }
    }

    /// The transport failed before or during the exchange.
    pub fn connection_error(request_id: u64, detail: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            duration: None,
            status_code: None,
            failure: Some(FailureKind::ConnectionError),
            detail: Some(detail.into()),
        }
    }

    /// The HTTP/3 layer misbehaved on an otherwise live connection.
    pub fn protocol_error(request_id: u64, detail: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            duration: None,
            status_code: None,
            failure: Some(FailureKind::ProtocolError),
            detail: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Measured latency in milliseconds, if this outcome carries one.
    pub fn latency_ms(&self) -> Option<f64> {
        self.duration.map(|d| d.as_secs_f64() * 1000.0)
    }

    /// One line of real-time progress output, emitted as outcomes complete.
    pub fn progress_line(&self) -> String {
        let detail = self.detail.as_deref().unwrap_or("unknown");
        match self.failure {
            None => format!(
                "Request {}: {} - {:.2}ms",
                self.request_id,
                self.status_code.unwrap_or(0),
                self.latency_ms().unwrap_or(0.0),
            ),
            Some(FailureKind::Timeout) => format!("Request {}: TIMEOUT", self.request_id),
            Some(FailureKind::ProtocolError) => {
                format!("Request {}: ERROR - {detail}", self.request_id)
            }
            Some(FailureKind::ConnectionError) => {
                format!("Request {}: CONNECTION ERROR - {detail}", self.request_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_outcome_carries_status_and_duration() {
        let o = Outcome::completed(7, Duration::from_millis(42), 200);
        assert!(o.is_success());
        assert_eq!(o.status_code, Some(200));
        assert_eq!(o.latency_ms(), Some(42.0));
        assert_eq!(o.failure, None);
    }

    #[test]
    fn timeout_keeps_duration_but_no_status() {
        let o = Outcome::timed_out(1, Duration::from_millis(100));
        assert!(!o.is_success());
        assert_eq!(o.status_code, None);
        assert_eq!(o.failure, Some(FailureKind::Timeout));
        assert_eq!(o.latency_ms(), Some(100.0));
    }

    #[test]
    fn transport_failures_measure_nothing() {
        let o = Outcome::connection_error(2, "connection refused");
        assert_eq!(o.duration, None);
        assert_eq!(o.status_code, None);
        assert_eq!(o.failure, Some(FailureKind::ConnectionError));
    }

    mod progress_line {
        use super::*;

        #[test]
        fn success() {
            let o = Outcome::completed(3, Duration::from_millis(12), 200);
            assert_eq!(o.progress_line(), "Request 3: 200 - 12.00ms");
        }

        #[test]
        fn timeout() {
            let o = Outcome::timed_out(4, Duration::from_secs(10));
            assert_eq!(o.progress_line(), "Request 4: TIMEOUT");
        }

        #[test]
        fn protocol_error() {
            let o = Outcome::protocol_error(5, "missing :status");
            assert_eq!(o.progress_line(), "Request 5: ERROR - missing :status");
        }

        #[test]
        fn connection_error() {
            let o = Outcome::connection_error(6, "refused");
            assert_eq!(o.progress_line(), "Request 6: CONNECTION ERROR - refused");
        }
    }
}
