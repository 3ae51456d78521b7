//! Configuration, the accept loop, and shutdown signaling.

use std::ffi::OsString;
use std::fs::metadata;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;

use crate::connection::Connection;
use crate::pool::WorkerPool;
use crate::response::MimeMap;
use crate::url::ResolvedPath;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_THREADS: usize = 4;

/// How often a waiting accept loop looks at its cancel token, in microseconds.
const ACCEPT_POLL_USEC: libc::suseconds_t = 200_000;
/// Pause after a failed accept so a persistent failure (e.g. EMFILE) does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bindaddr: IpAddr,
    pub bindport: u16,
    pub wwwroot: String,
    pub threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bindaddr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bindport: DEFAULT_PORT,
            wwwroot: ".".to_string(),
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_THREADS),
        }
    }
}

impl Config {
    pub fn from_command_line() -> Result<Self> {
        let mut args = std::env::args();
        let name = args.next().expect("expected at least one argument");
        Self::from_args(&name, args)
    }

    /// Parse `[port] [doc_root] [threads]`.
    pub fn from_args<I>(name: &str, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter();

        if let Some(port) = args.next() {
            if port == "--help" {
                config.usage(name);
                std::process::exit(0);
            }
            config.bindport = port
                .parse()
                .with_context(|| format!("port number {} is invalid", port))?;
        }
        if let Some(wwwroot) = args.next() {
            config.wwwroot = wwwroot;
        }
        if let Some(threads) = args.next() {
            config.threads = threads
                .parse()
                .with_context(|| format!("thread count {} is invalid", threads))?;
            if config.threads == 0 {
                bail!("thread count must be at least 1");
            }
        }
        if let Some(arg) = args.next() {
            return Err(anyhow!("unknown argument `{}'", arg));
        }

        // Strip ending slash, but keep "/" itself meaningful.
        while config.wwwroot.len() > 1 && config.wwwroot.ends_with('/') {
            config.wwwroot.pop();
        }
        Ok(config)
    }

    fn usage(&self, argv0: &str) {
        print!(
            "usage:\t{} [port] [doc_root] [threads]\n\n\
            \tport (default: {})\n\
            \t\tWhich port to listen on. Pass 0 to let the system choose.\n\n\
            \tdoc_root (default: {})\n\
            \t\tDirectory to serve files from.\n\n\
            \tthreads (default: {})\n\
            \t\tNumber of worker threads handling connections.\n\n",
            argv0, DEFAULT_PORT, self.wwwroot, self.threads,
        );
    }
}

/// What every worker needs to serve a request. Built once, never modified.
#[derive(Debug)]
pub struct Site {
    wwwroot: OsString,
    pub mime_map: MimeMap,
}

impl Site {
    pub fn new(wwwroot: &Path) -> Self {
        let mut wwwroot = wwwroot.as_os_str().as_bytes().to_vec();
        // The resolved path brings its own leading slash.
        while wwwroot.ends_with(b"/") {
            wwwroot.pop();
        }
        Self {
            wwwroot: OsString::from_vec(wwwroot),
            mime_map: MimeMap::default(),
        }
    }

    /// Filesystem path of a resolved request path. Always inside the document root.
    pub fn file_path(&self, path: &ResolvedPath) -> PathBuf {
        let mut target = self.wwwroot.clone();
        target.push(path.as_os_str());
        PathBuf::from(target)
    }
}

/// Tells a running accept loop to stop. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Initialize the TcpListener. This is the socket that we accept connections from.
    pub fn bind(config: &Config) -> Result<Self> {
        let socket_addr = SocketAddr::new(config.bindaddr, config.bindport);
        // Sets `SO_REUSEADDR` implicitly.
        let listener = TcpListener::bind(socket_addr)
            .with_context(|| format!("failed to create listening socket for {}", socket_addr))?;
        // A connection can vanish between select() and accept(); accept must not block then.
        listener
            .set_nonblocking(true)
            .context("failed to make listening socket non-blocking")?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to get listening address")
    }

    /// Accept connections and hand them to the pool until `cancel` fires. The listening socket
    /// is closed on return.
    pub fn serve(self, pool: &WorkerPool<Site>, cancel: &CancelToken) {
        let fd = self.listener.as_raw_fd();
        while !cancel.is_cancelled() {
            let mut recv_set = FdSet::new();
            recv_set.insert(fd);
            let mut timeout = TimeVal::from(libc::timeval {
                tv_sec: 0,
                tv_usec: ACCEPT_POLL_USEC,
            });
            match select(None, Some(&mut recv_set), None, None, Some(&mut timeout)) {
                Ok(0) => continue, // poll the token again
                Ok(_) => {}
                Err(e) if e.as_errno() == Some(Errno::EINTR) => continue,
                Err(e) => {
                    eprintln!("warning: select() failed: {}", e);
                    sleep(ACCEPT_RETRY_DELAY);
                    continue;
                }
            }

            match self.listener.accept() {
                Ok((stream, addr)) => {
                    // Workers use blocking I/O with timeouts. Some platforms hand out accepted
                    // sockets with the listener's O_NONBLOCK.
                    if let Err(e) = stream.set_nonblocking(false) {
                        eprintln!("warning: failed to set up connection from {}: {}", addr, e);
                        continue;
                    }
                    pool.submit(move |site: &Site| Connection::new(stream, addr.ip(), site).run());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {} // gone again, poll the token
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    eprintln!("warning: accept() failed: {}", e);
                    sleep(ACCEPT_RETRY_DELAY);
                }
            }
        }
    }
}

/// A bound listener plus the workers serving its connections.
pub struct Server {
    listener: Listener,
    pool: WorkerPool<Site>,
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        let root = metadata(&config.wwwroot)
            .with_context(|| format!("failed to open document root {}", config.wwwroot))?;
        if !root.is_dir() {
            bail!("document root {} is not a directory", config.wwwroot);
        }
        let listener = Listener::bind(config)?;
        let site = Arc::new(Site::new(Path::new(&config.wwwroot)));
        let pool = WorkerPool::new(config.threads, site)?;
        Ok(Self { listener, pool })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn threads(&self) -> usize {
        self.pool.size()
    }

    /// Serve until `cancel` fires, then let in-flight and queued connections finish.
    pub fn run(self, cancel: &CancelToken) {
        let Self { listener, pool } = self;
        listener.serve(&pool, cancel);
        println!("shutting down");
        pool.shutdown();
        println!("stopped.");
    }
}
