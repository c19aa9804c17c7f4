// SPDX-License-Identifier: Apache-2.0

//! The metrics endpoint.
//!
//! A dedicated TCP listener answers `GET /` with the Prometheus text
//! rendering of the registry. Connections are short-lived and rare, so each
//! one is served by an ephemeral thread instead of touching the runtime's
//! pinned cores.

use crate::{Metrics, error::Error};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default port of the metrics endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 1776;

/// Spawns the accept loop on its own (unpinned) thread.
pub fn spawn(metrics: Arc<Metrics>, port: u16) -> Result<std::thread::JoinHandle<()>, Error> {
    let listener =
        TcpListener::bind(("0.0.0.0", port)).map_err(|source| Error::Bind { port, source })?;
    debug!(port, "metrics endpoint listening");
    let handle = std::thread::Builder::new()
        .name("metrics-server".to_owned())
        .spawn(move || accept_loop(&listener, &metrics))
        .map_err(|source| Error::Bind { port, source })?;
    Ok(handle)
}

fn accept_loop(listener: &TcpListener, metrics: &Arc<Metrics>) {
    loop {
        match listener.accept() {
            Ok((stream, _peer)) => {
                let metrics = metrics.clone();
                let spawned = std::thread::Builder::new()
                    .name("metrics-conn".to_owned())
                    .spawn(move || serve_one(stream, &metrics));
                if let Err(e) = spawned {
                    warn!(error = %e, "failed to spawn metrics connection thread");
                }
            }
            Err(e) => {
                warn!(error = %e, "metrics accept failed");
            }
        }
    }
}

fn serve_one(mut stream: TcpStream, metrics: &Metrics) {
    // Drain whatever request line arrived; the endpoint serves exactly one
    // document regardless.
    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf);

    let body = metrics.render();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    if let Err(e) = stream.write_all(response.as_bytes()) {
        debug!(error = %e, "metrics response write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_serves_prometheus_text() {
        let metrics = Arc::new(Metrics::new().expect("fresh registry"));
        metrics.total_requests.inc();

        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("ephemeral port");
        let addr = listener.local_addr().expect("bound");
        let metrics_for_server = metrics.clone();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("one connection");
            serve_one(stream, &metrics_for_server);
        });

        let mut client = TcpStream::connect(addr).expect("connect");
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").expect("request");
        let mut response = String::new();
        client.read_to_string(&mut response).expect("response");
        server.join().expect("server thread");

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("total_requests 1"));
    }
}
