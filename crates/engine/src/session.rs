// SPDX-License-Identifier: Apache-2.0

//! Client sessions.
//!
//! The wire layer is deliberately narrow: parse one request head, buffer the
//! body up to the route cap, hand the bytes to the sandbox, and stream the
//! response back. Sockets are nonblocking throughout; `WouldBlock` surfaces
//! as [`Progress::WouldBlock`] so the caller can park the session on an epoll
//! (the listener while receiving, the sandbox itself while sending).

use crate::error::Error;
use crate::response::ResponseCode;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};

/// Where the session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reading the request head and body.
    ReceivingRequest,
    /// Request fully buffered; not yet executing.
    ReceivedRequest,
    /// A sandbox owns the session.
    Executing,
    /// Writing the serialized response.
    SendingResponse,
    /// Response fully written.
    Sent,
}

/// Outcome of a nonblocking step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The step finished.
    Complete,
    /// The socket would block; retry after an epoll edge.
    WouldBlock,
}

/// The parsed request head.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    /// Request path, used for route matching.
    pub path: String,
    /// Declared body length, zero when absent.
    pub content_length: usize,
}

/// One client connection's buffered request/response exchange.
pub struct HttpSession {
    stream: TcpStream,
    state: SessionState,
    recv_buf: Vec<u8>,
    head_len: usize,
    request: Option<ParsedRequest>,
    response: Vec<u8>,
    response_written: usize,
    /// Cycle timestamp of connection arrival.
    pub request_arrival: u64,
    /// Cycle timestamp when the request finished downloading.
    pub request_downloaded: u64,
    /// Cycle timestamp when the response finished sending.
    pub response_sent_at: u64,
}

impl HttpSession {
    /// Wraps an accepted connection, switching it to nonblocking mode.
    pub fn new(stream: TcpStream, now: u64) -> Result<Self, Error> {
        stream
            .set_nonblocking(true)
            .map_err(|source| Error::ClientSocket { source })?;
        Ok(Self {
            stream,
            state: SessionState::ReceivingRequest,
            recv_buf: Vec::with_capacity(1024),
            head_len: 0,
            request: None,
            response: Vec::new(),
            response_written: 0,
            request_arrival: now,
            request_downloaded: 0,
            response_sent_at: 0,
        })
    }

    /// The underlying descriptor, for epoll registration.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The parsed request head, once receive has completed.
    #[must_use]
    pub fn request(&self) -> Option<&ParsedRequest> {
        self.request.as_ref()
    }

    /// The buffered request body, once receive has completed.
    #[must_use]
    pub fn request_body(&self) -> &[u8] {
        match &self.request {
            Some(req) => {
                let start = self.head_len;
                let end = (start + req.content_length).min(self.recv_buf.len());
                &self.recv_buf[start..end]
            }
            None => &[],
        }
    }

    /// Marks the session as owned by a sandbox.
    pub fn set_executing(&mut self) {
        self.state = SessionState::Executing;
    }

    /// Advances the nonblocking receive: reads available bytes, parses the
    /// head once complete, then waits out the declared body.
    pub fn try_receive(&mut self, max_request: usize, now: u64) -> Result<Progress, Error> {
        assert_eq!(self.state, SessionState::ReceivingRequest);
        let mut chunk = [0u8; 4096];
        loop {
            if self.try_finish_parse(max_request)? {
                self.request_downloaded = now;
                self.state = SessionState::ReceivedRequest;
                return Ok(Progress::Complete);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::ClientSocket {
                        source: std::io::Error::new(
                            ErrorKind::UnexpectedEof,
                            "peer closed mid-request",
                        ),
                    });
                }
                Ok(n) => {
                    if self.recv_buf.len() + n > max_request.saturating_add(4096) {
                        return Err(Error::RequestTooLarge {
                            got: self.recv_buf.len() + n,
                            cap: max_request,
                        });
                    }
                    self.recv_buf.extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Progress::WouldBlock),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => return Err(Error::ClientSocket { source }),
            }
        }
    }

    /// Returns true once head and body are fully buffered.
    fn try_finish_parse(&mut self, max_request: usize) -> Result<bool, Error> {
        if self.request.is_none() {
            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut parsed = httparse::Request::new(&mut headers);
            match parsed.parse(&self.recv_buf) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let path = parsed.path.unwrap_or("/").to_owned();
                    let mut content_length = 0usize;
                    for header in parsed.headers.iter() {
                        if header.name.eq_ignore_ascii_case("content-length") {
                            content_length = std::str::from_utf8(header.value)
                                .ok()
                                .and_then(|v| v.trim().parse().ok())
                                .ok_or_else(|| Error::BadRequest {
                                    detail: "unparseable content-length".to_owned(),
                                })?;
                        }
                    }
                    if content_length > max_request {
                        return Err(Error::RequestTooLarge {
                            got: content_length,
                            cap: max_request,
                        });
                    }
                    self.head_len = head_len;
                    self.request = Some(ParsedRequest {
                        path,
                        content_length,
                    });
                }
                Ok(httparse::Status::Partial) => return Ok(false),
                Err(e) => {
                    return Err(Error::BadRequest {
                        detail: e.to_string(),
                    });
                }
            }
        }
        let req = self.request.as_ref().expect("parsed above");
        Ok(self.recv_buf.len() >= self.head_len + req.content_length)
    }

    /// Serializes the response head and body for sending.
    pub fn set_response(&mut self, code: ResponseCode, content_type: &str, body: &[u8]) {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            code.as_u16(),
            code.reason(),
            content_type,
            body.len(),
        );
        self.response.clear();
        self.response.extend_from_slice(head.as_bytes());
        self.response.extend_from_slice(body);
        self.response_written = 0;
        self.state = SessionState::SendingResponse;
    }

    /// Advances the nonblocking send of the serialized response.
    pub fn try_send(&mut self, now: u64) -> Result<Progress, Error> {
        assert_eq!(self.state, SessionState::SendingResponse);
        while self.response_written < self.response.len() {
            match self.stream.write(&self.response[self.response_written..]) {
                Ok(0) => {
                    return Err(Error::ClientSocket {
                        source: std::io::Error::new(ErrorKind::WriteZero, "peer stopped reading"),
                    });
                }
                Ok(n) => self.response_written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Progress::WouldBlock),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => return Err(Error::ClientSocket { source }),
            }
        }
        self.response_sent_at = now;
        self.state = SessionState::Sent;
        Ok(Progress::Complete)
    }

    /// Best-effort one-shot error reply for paths that cannot park the
    /// session (rejections, teardown). Ignores backpressure.
    pub fn send_error_response(&mut self, code: ResponseCode) {
        self.set_response(code, "text/plain", code.reason().as_bytes());
        let _ = self.try_send(0);
    }
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("state", &self.state)
            .field("fd", &self.raw_fd())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("ephemeral");
        let addr = listener.local_addr().expect("bound");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    #[test]
    fn receives_a_full_request_with_body() {
        let (mut client, server) = pair();
        let mut session = HttpSession::new(server, 1).expect("session");
        client
            .write_all(b"POST /fib HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
            .expect("request");
        loop {
            match session.try_receive(4096, 2).expect("receive") {
                Progress::Complete => break,
                Progress::WouldBlock => std::thread::yield_now(),
            }
        }
        assert_eq!(session.state(), SessionState::ReceivedRequest);
        let req = session.request().expect("parsed");
        assert_eq!(req.path, "/fib");
        assert_eq!(session.request_body(), b"hello");
        assert_eq!(session.request_downloaded, 2);
    }

    #[test]
    fn oversized_bodies_are_rejected() {
        let (mut client, server) = pair();
        let mut session = HttpSession::new(server, 1).expect("session");
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 10000\r\n\r\n")
            .expect("request");
        let err = loop {
            match session.try_receive(64, 2) {
                Ok(Progress::WouldBlock) => std::thread::yield_now(),
                Ok(Progress::Complete) => panic!("should reject"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::RequestTooLarge { .. }));
    }

    #[test]
    fn sends_a_response_round_trip() {
        let (mut client, server) = pair();
        let mut session = HttpSession::new(server, 1).expect("session");
        client
            .write_all(b"GET /fib HTTP/1.1\r\n\r\n")
            .expect("request");
        loop {
            match session.try_receive(4096, 2).expect("receive") {
                Progress::Complete => break,
                Progress::WouldBlock => std::thread::yield_now(),
            }
        }
        session.set_executing();
        session.set_response(ResponseCode::OK, "text/plain", b"42");
        loop {
            match session.try_send(3).expect("send") {
                Progress::Complete => break,
                Progress::WouldBlock => std::thread::yield_now(),
            }
        }
        drop(session);
        let mut reply = String::new();
        client.read_to_string(&mut reply).expect("reply");
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply.ends_with("42"));
    }

    #[test]
    fn garbage_heads_are_bad_requests() {
        let (mut client, server) = pair();
        let mut session = HttpSession::new(server, 1).expect("session");
        client.write_all(b"\0\0\0garbage\r\n\r\n").expect("bytes");
        let err = loop {
            match session.try_receive(4096, 2) {
                Ok(Progress::WouldBlock) => std::thread::yield_now(),
                Ok(Progress::Complete) => panic!("should reject"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::BadRequest { .. }));
    }
}
