#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{create_dir_all, File};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::{tempdir, TempDir};

pub const BINARY: &str = env!("CARGO_BIN_EXE_poolhttpd");

pub fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("localhost", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

/// Wait for a child to exit, giving up after `limit`.
pub fn wait_timeout(child: &mut Child, limit: Duration) -> Option<ExitStatus> {
    let start = Instant::now();
    while start.elapsed() < limit {
        if let Some(status) = child.try_wait().expect("failed to wait for child") {
            return Some(status);
        }
        sleep(Duration::from_millis(10));
    }
    None
}

pub struct Server {
    child: Child,
    port: u16,
    root: TempDir,
}
impl Server {
    pub fn with_threads(threads: usize) -> Self {
        let root = tempdir().expect("failed to create tempdir");

        // Get an unused port. Assumes the port won't be reused before we start the server.
        let port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(BINARY)
            .args(&[
                port.to_string().as_str(),
                root.path().to_str().expect("path is not valid UTF-8"),
                threads.to_string().as_str(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn server");

        // Create server early so it will be dropped if it fails to start.
        let server = Self { child, port, root };

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to server");

        server
    }
    pub fn new() -> Self {
        Self::with_threads(4)
    }
    pub fn root(&self) -> &Path {
        self.root.path()
    }
    pub fn create_file(&self, name: &str, contents: &[u8]) {
        let path = self.root().join(name);
        if let Some(parent) = path.parent() {
            create_dir_all(parent).expect("failed to create directory");
        }
        File::create(path)
            .and_then(|mut file| file.write_all(contents))
            .expect("failed to create file");
    }
    pub fn port(&self) -> u16 {
        self.port
    }
    pub fn stream(&self) -> TcpStream {
        stream(self.port)
    }
    /// Send raw request bytes and return everything the server sends before closing.
    pub fn raw(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = self.stream();
        stream.write_all(request).unwrap();
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .expect("failed to read response");
        buf
    }
    pub fn get(&self, path: &str) -> Response {
        get(self.port, path)
    }
    /// Send SIGINT and wait for the server to exit.
    pub fn interrupt(mut self) -> Option<ExitStatus> {
        kill(Pid::from_raw(self.child.id() as i32), Signal::SIGINT).expect("failed to signal");
        wait_timeout(&mut self.child, Duration::from_secs(10))
    }
}
impl Drop for Server {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

pub fn stream(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("localhost", port)).expect("failed to connect to server");
    // Set timeouts to prevent tests from hanging
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
        .set_write_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

pub fn get(port: u16, path: &str) -> Response {
    let mut stream = stream(port);
    write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).unwrap();
    let response = Response::from_reader(&mut stream).expect("failed to read response");
    // Every reply closes the connection.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "unexpected bytes after response");
    response
}

/// HTTP response from the server.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}
impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = headers
            .get("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }
    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }
    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }
    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }
    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }
    pub fn text(&self) -> Option<&str> {
        self.body
            .as_ref()
            .map(|body| std::str::from_utf8(body).expect("body is not valid UTF-8"))
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
