//! Shared-session engine: many exchanges multiplexed over one QUIC session.
//!
//! # High-level flow
//!
//! - [`PooledSession::connect`] spawns a session task and hands back a cheap
//!   clonable handle. The task dials the peer immediately; bring-up failures
//!   surface through the outcomes of submitted exchanges, never as a batch
//!   abort.
//! - [`PooledSession::submit`] sends a command over a channel and waits for
//!   the exchange's one outcome on a oneshot reply.
//! - The task runs a single poll loop over the shared transport: admit
//!   queued commands onto fresh streams, drain HTTP/3 events into the
//!   per-stream state machines, expire deadlines, reap terminal exchanges.
//! - If the session dies, every in-flight exchange that has not already hit
//!   its deadline fails as a connection error, and so does everything
//!   submitted afterwards. Deadlines always win: an exchange past its
//!   deadline times out even when the session collapses in the same tick.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::exchange::driver::{apply_event, describe_close, establish, EstablishError, Session};
use crate::exchange::{h3_failure, Exchange, ExchangeConfig, RequestSpec};
use crate::outcome::{FailureKind, Outcome};

const COMMAND_BUFFER: usize = 1024;

struct Command {
    request_id: u64,
    started_at: Instant,
    reply: oneshot::Sender<Outcome>,
}

struct InFlight {
    exchange: Exchange,
    deadline: Instant,
    reply: oneshot::Sender<Outcome>,
    /// Offset into the request body still to be written.
    body_sent: usize,
}

/// Handle to a session task. Cloning shares the same underlying session.
#[derive(Clone)]
pub struct PooledSession {
    commands: mpsc::Sender<Command>,
}

impl PooledSession {
    /// Spawn the session task and start connecting right away.
    ///
    /// Never fails: a session that cannot come up reports through the
    /// outcomes of whatever gets submitted, so the caller's batch keeps
    /// going regardless.
    pub fn connect(spec: RequestSpec, config: ExchangeConfig) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(session_task(spec, config, rx));
        Self { commands: tx }
    }

    /// Run one exchange over the shared session.
    pub async fn submit(&self, request_id: u64) -> Outcome {
        let started_at = Instant::now();
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command {
            request_id,
            started_at,
            reply: reply_tx,
        };
        if self.commands.send(command).await.is_err() {
            return Outcome::connection_error(request_id, "session task exited");
        }
        match reply_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::connection_error(request_id, "session task exited"),
        }
    }
}

async fn session_task(
    spec: RequestSpec,
    config: ExchangeConfig,
    mut commands: mpsc::Receiver<Command>,
) {
    // The shared session outlives any single exchange deadline, so its
    // transport idle timeout gets a floor well above it.
    let mut transport_config = config.clone();
    transport_config.timeout = config.timeout.max(Duration::from_secs(30));

    let deadline = Instant::now() + config.timeout;
    let mut session = match establish(&spec, &transport_config, deadline).await {
        Ok(session) => session,
        Err(e) => {
            warn!("shared session failed to come up, draining submissions");
            drain_after_bringup_failure(&mut commands, &config, &e).await;
            return;
        }
    };
    debug!(peer = %session.peer, "shared session up");

    let mut active: HashMap<u64, InFlight> = HashMap::new();
    let mut queued: VecDeque<Command> = VecDeque::new();
    let mut open = true;
    let mut last_flush = Instant::now();

    loop {
        // Park cheaply when idle, while still servicing transport timers.
        if open && active.is_empty() && queued.is_empty() {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => queued.push_back(command),
                    None => break,
                },
                _ = session.recv_tick(Duration::from_secs(1)) => {}
            }
        }
        loop {
            match commands.try_recv() {
                Ok(command) => queued.push_back(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    open = false;
                    break;
                }
            }
        }
        if !open && active.is_empty() && queued.is_empty() {
            break;
        }

        let mut dirty = submit_queued(&mut session, &mut queued, &mut active, &spec, &config);
        dirty |= write_request_bodies(&mut session, &mut active, &spec);
        dirty |= pump_events(&mut session, &mut active);

        // Deadlines first, so a dying session cannot reclassify them.
        let now = Instant::now();
        for flight in active.values_mut() {
            if now >= flight.deadline {
                flight.exchange.deadline_expired();
            }
        }
        reap_terminal(&mut active);

        if session.conn.is_closed() {
            let detail = describe_close(&session.conn);
            warn!(in_flight = active.len(), detail, "shared session closed");
            for (_, mut flight) in active.drain() {
                flight
                    .exchange
                    .fail(FailureKind::ConnectionError, detail.clone());
                let _ = flight.reply.send(flight.exchange.into_outcome());
            }
            for command in queued.drain(..) {
                let _ = command
                    .reply
                    .send(Outcome::connection_error(command.request_id, detail.clone()));
            }
            drain_after_close(&mut commands, detail).await;
            return;
        }

        let wait = match active.values().map(|f| f.deadline).min() {
            Some(earliest) if earliest > now => config.idle_backoff.min(earliest - now),
            Some(_) => Duration::ZERO,
            None => config.idle_backoff,
        };
        let received = match session.recv_tick(wait).await {
            Ok(received) => received,
            Err(e) => {
                warn!("socket receive failed: {e}");
                for flight in active.values_mut() {
                    flight
                        .exchange
                        .fail(FailureKind::ConnectionError, e.to_string());
                }
                reap_terminal(&mut active);
                0
            }
        };
        if dirty || received > 0 || last_flush.elapsed() >= config.retransmit_interval {
            if let Err(e) = session.flush_egress().await {
                warn!("egress flush failed: {e}");
            }
            last_flush = Instant::now();
        }
    }

    debug!("shared session draining...");
    let _ = session.conn.close(true, 0x100, b"done");
    let _ = session.flush_egress().await;
}

/// Move queued commands onto fresh request streams until the transport
/// pushes back. Returns whether anything was put on the wire.
fn submit_queued(
    session: &mut Session,
    queued: &mut VecDeque<Command>,
    active: &mut HashMap<u64, InFlight>,
    spec: &RequestSpec,
    config: &ExchangeConfig,
) -> bool {
    let headers = spec.h3_headers();
    let mut dirty = false;
    while let Some(command) = queued.pop_front() {
        let deadline = command.started_at + config.timeout;
        if Instant::now() >= deadline {
            let _ = command.reply.send(Outcome::timed_out(
                command.request_id,
                command.started_at.elapsed(),
            ));
            continue;
        }
        match session
            .h3
            .send_request(&mut session.conn, &headers, spec.body.is_none())
        {
            Ok(stream_id) => {
                let mut exchange = Exchange::new(command.request_id, stream_id, command.started_at);
                exchange.mark_sent();
                active.insert(
                    stream_id,
                    InFlight {
                        exchange,
                        deadline,
                        reply: command.reply,
                        body_sent: 0,
                    },
                );
                dirty = true;
            }
            Err(quiche::h3::Error::StreamBlocked) | Err(quiche::h3::Error::Done) => {
                // Out of stream credit; retry on a later tick.
                queued.push_front(command);
                break;
            }
            Err(e) => {
                let kind = h3_failure(&e);
                let outcome = match kind {
                    FailureKind::ConnectionError => {
                        Outcome::connection_error(command.request_id, e.to_string())
                    }
                    _ => Outcome::protocol_error(command.request_id, e.to_string()),
                };
                let _ = command.reply.send(outcome);
            }
        }
    }
    dirty
}

/// Push request body bytes for streams that still owe some.
fn write_request_bodies(
    session: &mut Session,
    active: &mut HashMap<u64, InFlight>,
    spec: &RequestSpec,
) -> bool {
    let Some(body) = &spec.body else {
        return false;
    };
    let mut dirty = false;
    for (stream_id, flight) in active.iter_mut() {
        while flight.body_sent < body.len() {
            match session
                .h3
                .send_body(&mut session.conn, *stream_id, &body[flight.body_sent..], true)
            {
                Ok(written) => {
                    flight.body_sent += written;
                    dirty = true;
                }
                Err(quiche::h3::Error::Done) | Err(quiche::h3::Error::StreamBlocked) => break,
                Err(e) => {
                    let detail = e.to_string();
                    flight.exchange.fail(h3_failure(&e), detail);
                    break;
                }
            }
        }
    }
    dirty
}

/// Drain ready HTTP/3 events into their streams' state machines.
fn pump_events(session: &mut Session, active: &mut HashMap<u64, InFlight>) -> bool {
    let mut dirty = false;
    loop {
        match session.h3.poll(&mut session.conn) {
            Ok((stream_id, event)) => {
                dirty = true;
                if let Some(flight) = active.get_mut(&stream_id) {
                    apply_event(session, &mut flight.exchange, stream_id, event);
                } else if matches!(event, quiche::h3::Event::Data) {
                    // Data for a stream already reaped; drop it on the floor.
                    let mut sink = [0; 4096];
                    while session
                        .h3
                        .recv_body(&mut session.conn, stream_id, &mut sink)
                        .is_ok()
                    {}
                }
            }
            Err(quiche::h3::Error::Done) => return dirty,
            Err(e) => {
                // Connection-level HTTP/3 failure: every in-flight exchange
                // pays for it.
                let kind = h3_failure(&e);
                let detail = e.to_string();
                for flight in active.values_mut() {
                    flight.exchange.fail(kind, detail.clone());
                }
                return dirty;
            }
        }
    }
}

/// Reply and drop every exchange that has reached a terminal state.
fn reap_terminal(active: &mut HashMap<u64, InFlight>) {
    let done: Vec<u64> = active
        .iter()
        .filter(|(_, flight)| flight.exchange.is_terminal())
        .map(|(stream_id, _)| *stream_id)
        .collect();
    for stream_id in done {
        if let Some(flight) = active.remove(&stream_id) {
            let _ = flight.reply.send(flight.exchange.into_outcome());
        }
    }
}

/// Reply to everything submitted to a session that never came up.
///
/// A submission that was already waiting when the handshake timed out spent
/// its own budget on that handshake: it times out at its own deadline, like
/// any exchange whose deadline elapses mid-handshake. Submissions arriving
/// after the failure, and every submission when the handshake failed
/// outright, learn immediately that the session is gone.
async fn drain_after_bringup_failure(
    commands: &mut mpsc::Receiver<Command>,
    config: &ExchangeConfig,
    failure: &EstablishError,
) {
    let failed_at = Instant::now();
    while let Some(command) = commands.recv().await {
        let outcome = match failure {
            EstablishError::TimedOut if command.started_at <= failed_at => {
                tokio::time::sleep_until(command.started_at + config.timeout).await;
                Outcome::timed_out(command.request_id, command.started_at.elapsed())
            }
            EstablishError::TimedOut => {
                Outcome::connection_error(command.request_id, "session handshake timed out")
            }
            EstablishError::Failed(detail) => {
                Outcome::connection_error(command.request_id, detail.clone())
            }
        };
        let _ = command.reply.send(outcome);
    }
}

async fn drain_after_close(commands: &mut mpsc::Receiver<Command>, detail: String) {
    while let Some(command) = commands.recv().await {
        let _ = command
            .reply
            .send(Outcome::connection_error(command.request_id, detail.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;
    use url::Url;

    async fn silent_peer() -> (UdpSocket, RequestSpec) {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sink.local_addr().unwrap().port();
        let url = Url::parse(&format!("https://127.0.0.1:{port}/")).unwrap();
        (sink, RequestSpec::get(&url).unwrap())
    }

    #[tokio::test]
    async fn bringup_timeout_times_out_waiting_submissions() {
        let (_sink, spec) = silent_peer().await;
        let config = ExchangeConfig::builder()
            .timeout(Duration::from_millis(150))
            .build();
        let pool = PooledSession::connect(spec, config);

        let (first, second) = tokio::join!(pool.submit(1), pool.submit(2));
        for outcome in [first, second] {
            assert_eq!(outcome.failure, Some(FailureKind::Timeout));
            assert!(outcome.duration.is_some());
        }
    }

    #[tokio::test]
    async fn late_submissions_to_a_dead_session_are_connection_errors() {
        let (_sink, spec) = silent_peer().await;
        let config = ExchangeConfig::builder()
            .timeout(Duration::from_millis(100))
            .build();
        let pool = PooledSession::connect(spec, config);

        // Let the bring-up fail first.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let outcome = pool.submit(3).await;
        assert_eq!(outcome.failure, Some(FailureKind::ConnectionError));
        assert_eq!(outcome.duration, None);
    }
}
