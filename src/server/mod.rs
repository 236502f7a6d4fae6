//! A small HTTP/3 origin server, intended as the target for load runs.
//!
//! The server is a single-task UDP event loop over quiche: wait for a
//! datagram (or the earliest QUIC timer), dispatch it to the owning
//! connection, answer whatever requests completed, then flush egress for
//! every connection and reap the dead ones. Connections are keyed by the
//! connection ID this side issued during the handshake.
//!
//! It serves a fixed route table: a hello page at `/`, a product catalog
//! under `/products`, and an echo of any request that carries a body. That
//! is deliberately simple; the point is a well-behaved peer with
//! predictable responses, not an application framework.

mod handler;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ring::hmac;
use ring::rand::SystemRandom;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};
use typed_builder::TypedBuilder;

use crate::catalog::Catalog;
use crate::error::Error;
use handler::ServerConnection;

const MAX_DATAGRAM_SIZE: usize = 1350;
const RECV_BUF_SIZE: usize = 65535;

/// Loop wakeup interval when no connection has a timer armed.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Server configuration.
///
/// ```
/// use h3load::ServerConfig;
///
/// let config = ServerConfig::builder()
///     .cert("cert.pem")
///     .key("key.pem")
///     .build();
/// assert_eq!(config.listen.port(), 4433);
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct ServerConfig {
    /// Address the UDP socket binds to.
    #[builder(default = SocketAddr::from(([0, 0, 0, 0], 4433)))]
    pub listen: SocketAddr,

    /// PEM-encoded certificate chain presented to clients.
    #[builder(setter(into))]
    pub cert: PathBuf,

    /// PEM-encoded private key matching `cert`.
    #[builder(setter(into))]
    pub key: PathBuf,

    /// Catalog served under `/products`.
    #[builder(default = Catalog::builtin())]
    pub catalog: Catalog,

    /// QUIC idle timeout granted to accepted connections.
    #[builder(default = Duration::from_secs(30))]
    pub idle_timeout: Duration,
}

/// The accept loop and the QUIC listener configuration behind it.
pub struct H3Server {
    config: ServerConfig,
    quic: quiche::Config,
    socket: Option<UdpSocket>,
}

impl H3Server {
    /// Validate credentials and build the QUIC listener configuration.
    ///
    /// Failing here rather than in [`run`](Self::run) keeps credential
    /// problems synchronous and loud at startup.
    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        let quic = listener_config(&config)?;
        Ok(Self {
            config,
            quic,
            socket: None,
        })
    }

    /// Bind the listening socket ahead of [`run`](Self::run) and report the
    /// bound address. This is how callers learn the real port when the
    /// configured one was 0.
    pub async fn bind(&mut self) -> Result<SocketAddr, Error> {
        let socket = UdpSocket::bind(self.config.listen).await?;
        let addr = socket.local_addr()?;
        self.socket = Some(socket);
        Ok(addr)
    }

    /// Serve until the task is cancelled or the socket fails, binding first
    /// if [`bind`](Self::bind) has not run yet.
    pub async fn run(&mut self) -> Result<(), Error> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => UdpSocket::bind(self.config.listen).await?,
        };
        let local = socket.local_addr()?;
        let catalog = Arc::new(self.config.catalog.clone());
        info!(addr = %local, products = catalog.len(), "HTTP/3 server listening...");

        let mut clients: HashMap<quiche::ConnectionId<'static>, ServerConnection> = HashMap::new();
        let mut buf = vec![0; RECV_BUF_SIZE].into_boxed_slice();
        let mut out = vec![0; MAX_DATAGRAM_SIZE].into_boxed_slice();
        let rng = SystemRandom::new();
        let conn_id_seed = hmac::Key::generate(hmac::HMAC_SHA256, &rng)
            .map_err(|_| Error::Io(std::io::Error::other("failed to seed connection ids")))?;

        loop {
            let wait = clients
                .values()
                .filter_map(|client| client.conn.timeout())
                .min()
                .unwrap_or(IDLE_POLL);

            match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    let pkt = &mut buf[..len];
                    let hdr = match quiche::Header::from_slice(pkt, quiche::MAX_CONN_ID_LEN) {
                        Ok(hdr) => hdr,
                        Err(e) => {
                            trace!(%from, "dropping undecodable packet: {e}");
                            continue;
                        }
                    };

                    let conn_id = if clients.contains_key(&hdr.dcid) {
                        hdr.dcid.into_owned()
                    } else {
                        let derived = derive_conn_id(&conn_id_seed, &hdr.dcid);
                        if !clients.contains_key(&derived) {
                            if hdr.ty != quiche::Type::Initial {
                                trace!(%from, "dropping non-initial packet for unknown connection");
                                continue;
                            }
                            let conn = quiche::accept(&derived, None, local, from, &mut self.quic)?;
                            info!(peer = %from, "accepted QUIC connection");
                            clients.insert(
                                derived.clone(),
                                ServerConnection::new(conn, from, Arc::clone(&catalog)),
                            );
                        }
                        derived
                    };

                    if let Some(client) = clients.get_mut(&conn_id) {
                        let recv_info = quiche::RecvInfo { from, to: local };
                        match client.conn.recv(pkt, recv_info) {
                            Ok(_) => {
                                if let Err(e) = client.init_h3() {
                                    warn!(peer = %client.peer, "HTTP/3 setup failed: {e}");
                                    let _ = client.conn.close(false, 0x1, b"h3 setup failure");
                                } else {
                                    client.poll_events();
                                }
                            }
                            Err(e) => {
                                warn!(peer = %client.peer, "quic recv failed: {e}");
                            }
                        }
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    // Quiet tick; fire whatever timers came due.
                    for client in clients.values_mut() {
                        client.conn.on_timeout();
                    }
                }
            }

            // Egress for every connection, then reap the closed ones.
            for client in clients.values_mut() {
                loop {
                    let (written, send_info) = match client.conn.send(&mut out) {
                        Ok(v) => v,
                        Err(quiche::Error::Done) => break,
                        Err(e) => {
                            warn!(peer = %client.peer, "quic send failed: {e}");
                            let _ = client.conn.close(false, 0x1, b"send failure");
                            break;
                        }
                    };
                    if let Err(e) = socket.send_to(&out[..written], send_info.to).await {
                        warn!(peer = %client.peer, "socket send failed: {e}");
                        break;
                    }
                }
            }
            clients.retain(|_, client| {
                if client.conn.is_closed() {
                    debug!(peer = %client.peer, "connection closed");
                    false
                } else {
                    true
                }
            });
        }
    }
}

fn listener_config(config: &ServerConfig) -> Result<quiche::Config, Error> {
    for path in [&config.cert, &config.key] {
        if !path.is_file() {
            return Err(Error::Credentials {
                path: path.clone(),
                reason: "file not found".to_string(),
            });
        }
    }

    let mut quic = quiche::Config::new(quiche::PROTOCOL_VERSION)?;
    quic.load_cert_chain_from_pem_file(&config.cert.to_string_lossy())
        .map_err(|e| Error::Credentials {
            path: config.cert.clone(),
            reason: e.to_string(),
        })?;
    quic.load_priv_key_from_pem_file(&config.key.to_string_lossy())
        .map_err(|e| Error::Credentials {
            path: config.key.clone(),
            reason: e.to_string(),
        })?;
    quic.set_application_protos(quiche::h3::APPLICATION_PROTOCOL)?;
    quic.set_max_idle_timeout(config.idle_timeout.as_millis() as u64);
    quic.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
    quic.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
    quic.set_initial_max_data(10_000_000);
    quic.set_initial_max_stream_data_bidi_local(1_000_000);
    quic.set_initial_max_stream_data_bidi_remote(1_000_000);
    quic.set_initial_max_stream_data_uni(1_000_000);
    quic.set_initial_max_streams_bidi(100);
    quic.set_initial_max_streams_uni(100);
    quic.set_disable_active_migration(true);
    Ok(quic)
}

/// Server-side connection id for a client-chosen one. Deterministic, so a
/// retransmitted Initial maps onto the connection its first copy created
/// instead of accepting a duplicate.
fn derive_conn_id(
    seed: &hmac::Key,
    dcid: &quiche::ConnectionId<'_>,
) -> quiche::ConnectionId<'static> {
    let tag = hmac::sign(seed, dcid);
    quiche::ConnectionId::from_vec(tag.as_ref()[..quiche::MAX_CONN_ID_LEN].to_vec())
}
