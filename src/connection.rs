//! One accepted connection, from the first byte received to the socket being closed.

use std::collections::HashMap;
use std::fs::{metadata, read};
use std::net::{IpAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket;

use crate::log::AccessRecord;
use crate::response::{Response, Status};
use crate::server::Site;
use crate::url::ResolvedPath;

pub const DEFAULT_INDEX_NAME: &str = "index.html";

// To prevent a malformed request from eating up too much memory, give up once the request exceeds
// this many bytes without a blank line:
pub const MAX_REQUEST_LENGTH: usize = 64 * 1024;

/// How long a client gets to send the complete header block.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const RECV_BUFFER_SIZE: usize = 1 << 13;

/// Method, target and headers of a request. Header names keep their case; a repeated name keeps
/// the last value.
#[derive(Debug, Default, PartialEq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: HashMap<String, String>,
}

impl Request {
    /// Parse a header block like "GET / HTTP/1.1\r\nHost: x\r\n\r\n". The version is ignored.
    pub fn parse(raw: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(raw);
        let mut lines = raw.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

        let mut request = Self::default();
        let mut request_line = lines.next().unwrap_or("").split_whitespace();
        request.method = request_line.next().unwrap_or("").to_string();
        request.target = request_line.next().unwrap_or("").to_string();

        for line in lines.take_while(|line| !line.is_empty()) {
            if let Some(colon) = line.find(':') {
                let value = line[colon + 1..].trim_matches(|c| matches!(c, ' ' | '\t'));
                request
                    .headers
                    .insert(line[..colon].to_string(), value.to_string());
            }
        }
        request
    }
}

#[derive(Debug, PartialEq)]
enum ConnectionState {
    ReadingHeaders,
    Parsed,
    Responding,
    Closed,
}

pub struct Connection<'a> {
    socket: TcpStream,
    client: IpAddr,
    site: &'a Site,
    state: ConnectionState,
    buffer: Vec<u8>,
    request: Option<Request>,
    response: Option<Response>,
    http_code: Option<u16>,
    total_sent: usize,
}

impl<'a> Connection<'a> {
    pub fn new(socket: TcpStream, client: IpAddr, site: &'a Site) -> Self {
        Self {
            socket,
            client,
            site,
            state: ConnectionState::ReadingHeaders,
            buffer: Vec::new(),
            request: None,
            response: None,
            http_code: None,
            total_sent: 0,
        }
    }

    /// Serve the connection to completion. The socket is closed when this returns, whatever
    /// happened.
    pub fn run(mut self) {
        loop {
            match self.state {
                ConnectionState::ReadingHeaders => self.recv_request(),
                ConnectionState::Parsed => self.process_request(),
                ConnectionState::Responding => self.send_response(),
                ConnectionState::Closed => break,
            }
        }
        self.log();
    }

    /// Receive until the header block is complete. Anything else (EOF, error, timeout, or an
    /// oversized request) drops the connection without a reply.
    fn recv_request(&mut self) {
        assert_eq!(self.state, ConnectionState::ReadingHeaders);
        let deadline = Instant::now() + REQUEST_TIMEOUT;
        let mut buf = [0; RECV_BUFFER_SIZE];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::from_secs(0) {
                self.state = ConnectionState::Closed;
                return;
            }
            if let Err(e) = self.socket.set_read_timeout(Some(remaining)) {
                eprintln!("warning: failed to set timeout for {}: {}", self.client, e);
                self.state = ConnectionState::Closed;
                return;
            }

            let fd = self.socket.as_raw_fd();
            let recvd = match socket::recv(fd, &mut buf, socket::MsgFlags::empty()) {
                Ok(recvd) if recvd > 0 => recvd,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                _ => {
                    // closure, timeout or other error
                    self.state = ConnectionState::Closed;
                    return;
                }
            };
            self.buffer.extend_from_slice(&buf[..recvd]);

            if has_blank_line(&self.buffer) {
                self.state = ConnectionState::Parsed;
                return;
            }
            if self.buffer.len() > MAX_REQUEST_LENGTH {
                self.state = ConnectionState::Closed;
                return;
            }
        }
    }

    /// Build the reply for a complete header block.
    fn process_request(&mut self) {
        assert_eq!(self.state, ConnectionState::Parsed);
        let request = Request::parse(&self.buffer);
        // request bytes not needed anymore
        self.buffer = Vec::new();

        let response = if request.method == "GET" {
            self.process_get(&request)
        } else {
            Response::not_implemented()
        };
        self.http_code = Some(response.status.code());
        self.request = Some(request);
        self.response = Some(response);
        self.state = ConnectionState::Responding;
    }

    fn process_get(&self, request: &Request) -> Response {
        let path = ResolvedPath::from_target(&request.target).with_index(DEFAULT_INDEX_NAME);
        let target = self.site.file_path(&path);

        match metadata(&target) {
            Ok(metadata) if metadata.is_file() => {}
            _ => return Response::error(Status::NotFound),
        }

        match read(&target) {
            Ok(body) => Response::file(body, self.site.mime_map.content_type(path.extension())),
            Err(e) => {
                eprintln!("warning: failed to read {}: {}", target.display(), e);
                Response::error(Status::InternalServerError)
            }
        }
    }

    /// Write the header block, then the body. A failed write ends the connection.
    fn send_response(&mut self) {
        assert_eq!(self.state, ConnectionState::Responding);
        let response = self.response.take().expect("no response to send");

        let result = self
            .send_all(&response.head())
            .and_then(|()| self.send_all(&response.body));
        if let Err(e) = result {
            eprintln!("warning: failed to send reply to {}: {}", self.client, e);
        }
        self.state = ConnectionState::Closed;
    }

    /// Keep sending until `buf` is gone or a send fails.
    fn send_all(&mut self, mut buf: &[u8]) -> nix::Result<()> {
        while !buf.is_empty() {
            match socket::send(self.socket.as_raw_fd(), buf, socket::MsgFlags::empty()) {
                Ok(sent) if sent > 0 => {
                    self.total_sent += sent;
                    buf = &buf[sent..];
                }
                Err(nix::Error::Sys(Errno::EINTR)) => {}
                Ok(_) => return Err(nix::Error::Sys(Errno::EPIPE)),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Add the exchange to the access log, if a reply was attempted.
    fn log(&self) {
        if let (Some(request), Some(code)) = (&self.request, self.http_code) {
            AccessRecord {
                client: self.client,
                method: &request.method,
                target: &request.target,
                code,
                bytes_sent: self.total_sent,
            }
            .log();
        }
    }
}

/// Does the buffer hold the blank line ending the header block?
fn has_blank_line(buf: &[u8]) -> bool {
    find(b"\r\n\r\n", buf).is_some() || find(b"\n\n", buf).is_some()
}

/// Return index of first occurrence of `needle` in `haystack`.
fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
