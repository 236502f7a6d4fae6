//! Per-connection HTTP/3 state: assembling requests from streams and
//! answering them from the route table.
//!
//! One [`ServerConnection`] pairs a QUIC connection with its HTTP/3 layer
//! for the connection's whole life, so QPACK state survives across
//! requests. Each request stream gets its own [`StreamRequest`] that
//! accumulates headers and body until the request is complete, at which
//! point the route table produces exactly one response for it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use quiche::h3::NameValue;
use tracing::{debug, trace, warn};

use crate::catalog::Catalog;
use crate::error::Error;

const SERVER_NAME: &str = concat!("h3serve/", env!("CARGO_PKG_VERSION"));

/// A request being assembled from one stream's events.
#[derive(Debug, Default)]
struct StreamRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

/// A response that could not be fully written yet. `headers` goes back to
/// `None` once the header frame is on the wire.
struct PartialResponse {
    headers: Option<Vec<quiche::h3::Header>>,
    body: Vec<u8>,
    written: usize,
}

/// What a route produced, before it is framed for the wire.
#[derive(Debug, PartialEq)]
pub(crate) struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl HttpResponse {
    fn text(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    fn json(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.into_bytes(),
        }
    }

    fn not_found() -> Self {
        Self::text(404, "Not Found")
    }
}

/// The demo route table.
///
/// A request that carried a body is echoed back regardless of its path, so
/// client body handling can be exercised against any URL.
pub(crate) fn route(
    method: &str,
    path: &str,
    body: &[u8],
    stream_id: u64,
    catalog: &Catalog,
) -> HttpResponse {
    if !body.is_empty() {
        return HttpResponse::text(
            200,
            format!(
                "Hello HTTP/3!\nMethod: {method}\nPath: {path}\nStream ID: {stream_id}\nBody: {} bytes",
                body.len()
            ),
        );
    }

    match (method, path) {
        ("GET", "/") => HttpResponse::text(200, "Hello, HTTP/3!"),
        ("GET", "/products") => match catalog.to_json() {
            Ok(json) => HttpResponse::json(200, json),
            Err(e) => {
                warn!("catalog serialization failed: {e}");
                HttpResponse::text(500, "Internal Server Error")
            }
        },
        ("GET", p) if p.starts_with("/products/") => {
            let id = p["/products/".len()..].parse::<u64>().ok();
            match id.and_then(|id| catalog.get(id)) {
                Some(product) => match serde_json::to_string(product) {
                    Ok(json) => HttpResponse::json(200, json),
                    Err(e) => {
                        warn!("product serialization failed: {e}");
                        HttpResponse::text(500, "Internal Server Error")
                    }
                },
                None => HttpResponse::not_found(),
            }
        }
        _ => HttpResponse::not_found(),
    }
}

/// One client connection and everything in flight on it.
pub(crate) struct ServerConnection {
    pub(crate) conn: quiche::Connection,
    h3: Option<quiche::h3::Connection>,
    pub(crate) peer: SocketAddr,
    requests: HashMap<u64, StreamRequest>,
    partials: HashMap<u64, PartialResponse>,
    catalog: Arc<Catalog>,
}

impl ServerConnection {
    pub(crate) fn new(conn: quiche::Connection, peer: SocketAddr, catalog: Arc<Catalog>) -> Self {
        Self {
            conn,
            h3: None,
            peer,
            requests: HashMap::new(),
            partials: HashMap::new(),
            catalog,
        }
    }

    /// Bring up the HTTP/3 layer once the QUIC handshake settles.
    pub(crate) fn init_h3(&mut self) -> Result<(), Error> {
        if self.h3.is_none() && self.conn.is_established() {
            let h3_config = quiche::h3::Config::new()?;
            let h3 = quiche::h3::Connection::with_transport(&mut self.conn, &h3_config)?;
            self.h3 = Some(h3);
            debug!(peer = %self.peer, "HTTP/3 connection established");
        }
        Ok(())
    }

    /// Drain HTTP/3 events, answer every request that became complete, and
    /// retry responses that were blocked on earlier ticks.
    pub(crate) fn poll_events(&mut self) {
        let mut ready: Vec<u64> = Vec::new();

        if let Some(h3) = &mut self.h3 {
            loop {
                match h3.poll(&mut self.conn) {
                    Ok((stream_id, quiche::h3::Event::Headers { list, more_frames })) => {
                        let request = self.requests.entry(stream_id).or_default();
                        for header in &list {
                            match header.name() {
                                b":method" => {
                                    request.method =
                                        String::from_utf8_lossy(header.value()).into_owned()
                                }
                                b":path" => {
                                    request.path =
                                        String::from_utf8_lossy(header.value()).into_owned()
                                }
                                _ => {}
                            }
                        }
                        trace!(
                            stream_id,
                            method = %request.method,
                            path = %request.path,
                            "request headers received"
                        );
                        if !more_frames && !ready.contains(&stream_id) {
                            ready.push(stream_id);
                        }
                    }
                    Ok((stream_id, quiche::h3::Event::Data)) => {
                        let request = self.requests.entry(stream_id).or_default();
                        let mut buf = [0; 16384];
                        loop {
                            match h3.recv_body(&mut self.conn, stream_id, &mut buf) {
                                Ok(read) => request.body.extend_from_slice(&buf[..read]),
                                Err(quiche::h3::Error::Done) => break,
                                Err(e) => {
                                    warn!(stream_id, "recv_body failed: {e}");
                                    break;
                                }
                            }
                        }
                    }
                    Ok((stream_id, quiche::h3::Event::Finished)) => {
                        // Only streams that still hold a request owe a
                        // response; everything else already got one.
                        if self.requests.contains_key(&stream_id) && !ready.contains(&stream_id) {
                            ready.push(stream_id);
                        }
                    }
                    Ok((stream_id, quiche::h3::Event::Reset(error_code))) => {
                        debug!(stream_id, error_code, "request stream reset by client");
                        self.requests.remove(&stream_id);
                        self.partials.remove(&stream_id);
                    }
                    Ok((_, quiche::h3::Event::GoAway)) => {}
                    Ok((_, quiche::h3::Event::PriorityUpdate)) => {}
                    Err(quiche::h3::Error::Done) => break,
                    Err(e) => {
                        warn!(peer = %self.peer, "h3 poll failed: {e}");
                        break;
                    }
                }
            }
        }

        for stream_id in ready {
            self.respond(stream_id);
        }
        self.flush_partials();
    }

    /// Route and answer one completed request. The request entry is removed
    /// here, which is what guarantees a stream is answered exactly once.
    fn respond(&mut self, stream_id: u64) {
        let Some(request) = self.requests.remove(&stream_id) else {
            return;
        };
        debug_assert!(
            !self.partials.contains_key(&stream_id),
            "stream answered twice"
        );

        let response = route(
            &request.method,
            &request.path,
            &request.body,
            stream_id,
            &self.catalog,
        );
        debug!(
            stream_id,
            method = %request.method,
            path = %request.path,
            status = response.status,
            "request handled"
        );
        self.send_response(stream_id, response);
    }

    /// Frame and write a response, stashing whatever the transport would
    /// not take yet.
    fn send_response(&mut self, stream_id: u64, response: HttpResponse) {
        let Some(h3) = &mut self.h3 else {
            return;
        };

        let status = response.status.to_string();
        let content_length = response.body.len().to_string();
        let headers = vec![
            quiche::h3::Header::new(b":status", status.as_bytes()),
            quiche::h3::Header::new(b"content-type", response.content_type.as_bytes()),
            quiche::h3::Header::new(b"content-length", content_length.as_bytes()),
            quiche::h3::Header::new(b"server", SERVER_NAME.as_bytes()),
        ];
        let body = response.body;

        match h3.send_response(&mut self.conn, stream_id, &headers, body.is_empty()) {
            Ok(()) => {}
            Err(quiche::h3::Error::StreamBlocked) => {
                self.partials.insert(
                    stream_id,
                    PartialResponse {
                        headers: Some(headers),
                        body,
                        written: 0,
                    },
                );
                return;
            }
            Err(e) => {
                warn!(stream_id, "send_response failed: {e}");
                return;
            }
        }

        if body.is_empty() {
            return;
        }
        let written = match h3.send_body(&mut self.conn, stream_id, &body, true) {
            Ok(written) => written,
            Err(quiche::h3::Error::Done) => 0,
            Err(e) => {
                warn!(stream_id, "send_body failed: {e}");
                return;
            }
        };
        if written < body.len() {
            self.partials.insert(
                stream_id,
                PartialResponse {
                    headers: None,
                    body,
                    written,
                },
            );
        }
    }

    /// Retry responses that were cut short by flow control.
    fn flush_partials(&mut self) {
        let Some(h3) = &mut self.h3 else {
            return;
        };

        let mut completed = Vec::new();
        for (&stream_id, partial) in &mut self.partials {
            if let Some(headers) = &partial.headers {
                match h3.send_response(&mut self.conn, stream_id, headers, partial.body.is_empty())
                {
                    Ok(()) => partial.headers = None,
                    Err(quiche::h3::Error::StreamBlocked) => continue,
                    Err(e) => {
                        warn!(stream_id, "send_response retry failed: {e}");
                        completed.push(stream_id);
                        continue;
                    }
                }
            }

            while partial.written < partial.body.len() {
                match h3.send_body(&mut self.conn, stream_id, &partial.body[partial.written..], true)
                {
                    Ok(sent) => partial.written += sent,
                    Err(quiche::h3::Error::Done) => break,
                    Err(e) => {
                        warn!(stream_id, "send_body retry failed: {e}");
                        partial.written = partial.body.len();
                    }
                }
            }
            if partial.written >= partial.body.len() {
                completed.push(stream_id);
            }
        }
        for stream_id in completed {
            self.partials.remove(&stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Product;

    fn catalog() -> Catalog {
        Catalog::builtin()
    }

    mod route {
        use super::*;

        #[test]
        fn root_says_hello() {
            let response = route("GET", "/", b"", 0, &catalog());
            assert_eq!(response.status, 200);
            assert_eq!(response.content_type, "text/plain; charset=utf-8");
            assert_eq!(response.body, b"Hello, HTTP/3!");
        }

        #[test]
        fn products_lists_the_whole_catalog() {
            let catalog = catalog();
            let response = route("GET", "/products", b"", 0, &catalog);
            assert_eq!(response.status, 200);
            assert_eq!(response.content_type, "application/json");
            let parsed: Vec<Product> = serde_json::from_slice(&response.body).unwrap();
            assert_eq!(parsed.len(), catalog.len());
        }

        #[test]
        fn product_lookup_by_id() {
            let response = route("GET", "/products/1", b"", 0, &catalog());
            assert_eq!(response.status, 200);
            let product: Product = serde_json::from_slice(&response.body).unwrap();
            assert_eq!(product.id, 1);
        }

        #[test]
        fn unknown_product_is_not_found() {
            assert_eq!(route("GET", "/products/999", b"", 0, &catalog()).status, 404);
            assert_eq!(route("GET", "/products/zero", b"", 0, &catalog()).status, 404);
        }

        #[test]
        fn request_bodies_are_echoed() {
            let response = route("POST", "/anything", b"hello", 4, &catalog());
            assert_eq!(response.status, 200);
            let text = String::from_utf8(response.body).unwrap();
            assert!(text.starts_with("Hello HTTP/3!\n"));
            assert!(text.contains("Method: POST"));
            assert!(text.contains("Path: /anything"));
            assert!(text.contains("Stream ID: 4"));
            assert!(text.contains("Body: 5 bytes"));
        }

        #[test]
        fn anything_else_is_not_found() {
            assert_eq!(route("GET", "/nope", b"", 0, &catalog()).status, 404);
            assert_eq!(route("DELETE", "/", b"", 0, &catalog()).status, 404);
        }
    }
}
