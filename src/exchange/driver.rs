//! Per-request session driver: a fresh QUIC connection for every exchange.
//!
//! # High-level flow
//!
//! - [`establish`] resolves the peer, binds a UDP socket, and drives the QUIC
//!   handshake until the connection is established, then layers HTTP/3 on
//!   top. The exchange deadline applies here too: a handshake that drags past
//!   it is a timeout, not a connection error.
//! - [`ExchangeDriver::run`] sends the request on a fresh stream and then
//!   pumps a poll loop: flush egress, drain HTTP/3 events into the
//!   [`Exchange`] state machine, wait briefly for inbound datagrams, repeat.
//! - Whatever terminal state the exchange lands in becomes its [`Outcome`];
//!   the session is closed politely afterwards so the peer can reap it.
//!
//! # Tuning knobs
//!
//! - `timeout` bounds the whole exchange, handshake included.
//! - `idle_backoff` is the longest single wait for inbound datagrams; it
//!   keeps deadline checks timely even when the peer goes quiet.
//! - `retransmit_interval` caps how stale pending egress may get while the
//!   loop idles. The default equals the idle backoff, so egress is flushed
//!   every tick.

use std::net::SocketAddr;
use std::time::Duration;

use ring::rand::{SecureRandom, SystemRandom};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::Error;
use crate::exchange::{classify_error, h3_failure, Exchange, ExchangeConfig, RequestSpec};
use crate::outcome::Outcome;

/// Largest UDP payload we send or accept. Conservative enough to clear
/// common tunnel MTUs without fragmenting.
pub(crate) const MAX_DATAGRAM_SIZE: usize = 1350;

const RECV_BUF_SIZE: usize = 65535;

/// Why a session could not be brought up.
#[derive(Debug)]
pub(crate) enum EstablishError {
    /// The deadline elapsed mid-handshake.
    TimedOut,
    /// The transport failed outright.
    Failed(String),
}

impl EstablishError {
    pub(crate) fn into_outcome(self, request_id: u64, started_at: Instant) -> Outcome {
        match self {
            Self::TimedOut => Outcome::timed_out(request_id, started_at.elapsed()),
            Self::Failed(detail) => Outcome::connection_error(request_id, detail),
        }
    }
}

impl From<Error> for EstablishError {
    fn from(e: Error) -> Self {
        Self::Failed(e.to_string())
    }
}

impl From<std::io::Error> for EstablishError {
    fn from(e: std::io::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

impl From<quiche::Error> for EstablishError {
    fn from(e: quiche::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

impl From<quiche::h3::Error> for EstablishError {
    fn from(e: quiche::h3::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

/// An established QUIC+HTTP/3 session and its socket.
///
/// Fields stay visible inside the crate because `h3::Connection` calls
/// borrow the transport connection alongside it.
pub(crate) struct Session {
    socket: UdpSocket,
    pub(crate) conn: quiche::Connection,
    pub(crate) h3: quiche::h3::Connection,
    pub(crate) peer: SocketAddr,
    local: SocketAddr,
    out_buf: Box<[u8]>,
    in_buf: Box<[u8]>,
}

impl Session {
    /// Push everything quiche has queued onto the wire.
    pub(crate) async fn flush_egress(&mut self) -> Result<(), Error> {
        flush_egress(&self.socket, &mut self.conn, &mut self.out_buf).await
    }

    /// Wait up to `max_wait` for inbound datagrams and feed them to quiche.
    ///
    /// Returns the number of bytes taken off the socket; zero means the wait
    /// elapsed quietly (quiche's own timers are serviced in that case).
    pub(crate) async fn recv_tick(&mut self, max_wait: Duration) -> Result<usize, Error> {
        recv_tick(
            &self.socket,
            &mut self.conn,
            self.local,
            &mut self.in_buf,
            max_wait,
        )
        .await
    }
}

async fn flush_egress(
    socket: &UdpSocket,
    conn: &mut quiche::Connection,
    out_buf: &mut [u8],
) -> Result<(), Error> {
    loop {
        let (written, send_info) = match conn.send(out_buf) {
            Ok(v) => v,
            Err(quiche::Error::Done) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        socket.send_to(&out_buf[..written], send_info.to).await?;
    }
}

async fn recv_tick(
    socket: &UdpSocket,
    conn: &mut quiche::Connection,
    local: SocketAddr,
    in_buf: &mut [u8],
    max_wait: Duration,
) -> Result<usize, Error> {
    // Never outsleep quiche's own timers.
    let wait = match conn.timeout() {
        Some(t) => t.min(max_wait),
        None => max_wait,
    };

    let mut received = 0;
    match tokio::time::timeout(wait, socket.recv_from(in_buf)).await {
        Ok(Ok((read, from))) => {
            conn.recv(&mut in_buf[..read], quiche::RecvInfo { from, to: local })?;
            received += read;
            // Drain whatever else already arrived without waiting again.
            loop {
                match socket.try_recv_from(in_buf) {
                    Ok((read, from)) => {
                        conn.recv(&mut in_buf[..read], quiche::RecvInfo { from, to: local })?;
                        received += read;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(Err(e)) => return Err(e.into()),
        // Quiet tick; let quiche fire whatever timer came due.
        Err(_) => conn.on_timeout(),
    }
    Ok(received)
}

/// Human-readable cause for a closed connection.
pub(crate) fn describe_close(conn: &quiche::Connection) -> String {
    if let Some(err) = conn.peer_error() {
        format!(
            "connection closed by peer (code 0x{:x}, reason {:?})",
            err.error_code,
            String::from_utf8_lossy(&err.reason)
        )
    } else if conn.is_timed_out() {
        "connection idle timeout".to_string()
    } else {
        "connection closed".to_string()
    }
}

fn client_config(config: &ExchangeConfig) -> Result<quiche::Config, Error> {
    let mut quic = quiche::Config::new(quiche::PROTOCOL_VERSION)?;
    quic.set_application_protos(quiche::h3::APPLICATION_PROTOCOL)?;
    quic.verify_peer(config.verify_peer);
    // The transport idle timeout sits above the exchange deadline, so the
    // deadline decides when a stalled exchange dies.
    quic.set_max_idle_timeout((config.timeout + Duration::from_secs(1)).as_millis() as u64);
    quic.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
    quic.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
    quic.set_initial_max_data(10_000_000);
    quic.set_initial_max_stream_data_bidi_local(1_000_000);
    quic.set_initial_max_stream_data_bidi_remote(1_000_000);
    quic.set_initial_max_stream_data_uni(1_000_000);
    quic.set_initial_max_streams_bidi(100);
    quic.set_initial_max_streams_uni(100);
    Ok(quic)
}

/// Bring up a QUIC session and its HTTP/3 layer, bounded by `deadline`.
pub(crate) async fn establish(
    spec: &RequestSpec,
    config: &ExchangeConfig,
    deadline: Instant,
) -> Result<Session, EstablishError> {
    let peer = tokio::net::lookup_host((spec.server_name.as_str(), spec.port))
        .await
        .map_err(|e| {
            EstablishError::Failed(format!("failed to resolve {}: {e}", spec.server_name))
        })?
        .next()
        .ok_or_else(|| {
            EstablishError::Failed(format!("no address found for {}", spec.server_name))
        })?;

    let bind_addr: SocketAddr = match peer {
        SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
        SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    let local = socket.local_addr()?;

    let mut scid = [0; quiche::MAX_CONN_ID_LEN];
    SystemRandom::new()
        .fill(&mut scid)
        .map_err(|_| EstablishError::Failed("failed to generate connection id".to_string()))?;
    let scid = quiche::ConnectionId::from_ref(&scid);

    let mut quic = client_config(config)?;
    let mut conn = quiche::connect(Some(&spec.server_name), &scid, local, peer, &mut quic)?;
    trace!(%peer, scid = ?scid, "dialing QUIC session...");

    let mut out_buf = vec![0; MAX_DATAGRAM_SIZE].into_boxed_slice();
    let mut in_buf = vec![0; RECV_BUF_SIZE].into_boxed_slice();

    // Initial flight, then pump until the handshake settles.
    flush_egress(&socket, &mut conn, &mut out_buf).await?;
    while !conn.is_established() {
        if conn.is_closed() {
            return Err(EstablishError::Failed(describe_close(&conn)));
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(EstablishError::TimedOut);
        }
        let wait = config.idle_backoff.min(deadline - now);
        recv_tick(&socket, &mut conn, local, &mut in_buf, wait).await?;
        flush_egress(&socket, &mut conn, &mut out_buf).await?;
    }

    let h3_config = quiche::h3::Config::new().map_err(EstablishError::from)?;
    let h3 = quiche::h3::Connection::with_transport(&mut conn, &h3_config)?;
    debug!(%peer, "QUIC session established");

    Ok(Session {
        socket,
        conn,
        h3,
        peer,
        local,
        out_buf,
        in_buf,
    })
}

/// Runs one exchange per fresh session. This is the [`SessionMode::PerRequest`]
/// engine, and the isolation baseline: nothing survives from one request to
/// the next.
///
/// [`SessionMode::PerRequest`]: crate::exchange::SessionMode::PerRequest
pub struct ExchangeDriver {
    spec: RequestSpec,
    config: ExchangeConfig,
}

impl ExchangeDriver {
    pub fn new(spec: RequestSpec, config: ExchangeConfig) -> Self {
        Self { spec, config }
    }

    /// Drive one request to its terminal outcome. Never returns an error:
    /// every failure mode is an [`Outcome`] so the caller's batch keeps
    /// going regardless.
    pub async fn run(&self, request_id: u64) -> Outcome {
        let started_at = Instant::now();
        let deadline = started_at + self.config.timeout;

        let mut session = match establish(&self.spec, &self.config, deadline).await {
            Ok(session) => session,
            Err(e) => return e.into_outcome(request_id, started_at),
        };

        let mut exchange = Exchange::new(request_id, 0, started_at);
        if let Err(e) = self.pump(&mut session, &mut exchange, deadline).await {
            exchange.fail(classify_error(&e), e.to_string());
        }
        let outcome = exchange.into_outcome();

        // Polite close; best effort, the outcome is already decided.
        let _ = session.conn.close(true, 0x100, b"done");
        let _ = session.flush_egress().await;
        outcome
    }

    /// Send the request and pump the event loop until the exchange is
    /// terminal or the deadline passes.
    async fn pump(
        &self,
        session: &mut Session,
        exchange: &mut Exchange,
        deadline: Instant,
    ) -> Result<(), Error> {
        let headers = self.spec.h3_headers();
        let body_fin = self.spec.body.is_none();
        let stream_id = session
            .h3
            .send_request(&mut session.conn, &headers, body_fin)?;
        exchange.stream_id = stream_id;
        if let Some(body) = &self.spec.body {
            self.send_body(session, stream_id, body, deadline).await?;
        }
        exchange.mark_sent();
        session.flush_egress().await?;
        trace!(request_id = exchange.request_id, stream_id, "request sent");

        let mut last_flush = Instant::now();
        while !exchange.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                exchange.deadline_expired();
                break;
            }

            drain_h3_events(session, exchange);
            if exchange.is_terminal() {
                break;
            }
            if session.conn.is_closed() {
                exchange.fail(
                    crate::outcome::FailureKind::ConnectionError,
                    describe_close(&session.conn),
                );
                break;
            }

            let wait = self.config.idle_backoff.min(deadline - now);
            let received = session.recv_tick(wait).await?;
            if received > 0 || last_flush.elapsed() >= self.config.retransmit_interval {
                session.flush_egress().await?;
                last_flush = Instant::now();
            }
        }
        Ok(())
    }

    /// Write the request body, pumping the transport whenever flow control
    /// pushes back.
    async fn send_body(
        &self,
        session: &mut Session,
        stream_id: u64,
        body: &[u8],
        deadline: Instant,
    ) -> Result<(), Error> {
        let mut offset = 0;
        while offset < body.len() {
            match session
                .h3
                .send_body(&mut session.conn, stream_id, &body[offset..], true)
            {
                Ok(written) => offset += written,
                Err(quiche::h3::Error::Done) | Err(quiche::h3::Error::StreamBlocked) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    session.flush_egress().await?;
                    session
                        .recv_tick(self.config.idle_backoff.min(deadline - now))
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Drain every ready HTTP/3 event into the exchange's state machine.
pub(crate) fn drain_h3_events(session: &mut Session, exchange: &mut Exchange) {
    loop {
        match session.h3.poll(&mut session.conn) {
            Ok((stream_id, event)) => apply_event(session, exchange, stream_id, event),
            Err(quiche::h3::Error::Done) => return,
            Err(e) => {
                let detail = e.to_string();
                exchange.fail(h3_failure(&e), detail);
                return;
            }
        }
        if exchange.is_terminal() {
            return;
        }
    }
}

pub(crate) fn apply_event(
    session: &mut Session,
    exchange: &mut Exchange,
    stream_id: u64,
    event: quiche::h3::Event,
) {
    if stream_id != exchange.stream_id {
        // Stray stream; drain any data so the event queue keeps moving.
        if matches!(event, quiche::h3::Event::Data) {
            let mut sink = [0; 4096];
            while session
                .h3
                .recv_body(&mut session.conn, stream_id, &mut sink)
                .is_ok()
            {}
        }
        return;
    }
    match event {
        quiche::h3::Event::Headers { list, more_frames: _ } => exchange.on_headers(&list),
        quiche::h3::Event::Data => {
            let mut buf = [0; 4096];
            loop {
                match session.h3.recv_body(&mut session.conn, stream_id, &mut buf) {
                    Ok(read) => exchange.on_data(&buf[..read]),
                    Err(quiche::h3::Error::Done) => break,
                    Err(e) => {
                        let detail = e.to_string();
                        exchange.fail(h3_failure(&e), detail);
                        break;
                    }
                }
            }
        }
        quiche::h3::Event::Finished => exchange.on_finished(),
        quiche::h3::Event::Reset(error_code) => exchange.on_reset(error_code),
        quiche::h3::Event::PriorityUpdate => {}
        quiche::h3::Event::GoAway => {}
    }
}
