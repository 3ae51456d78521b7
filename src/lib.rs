//! A static file server: a fixed pool of worker threads answering GET requests with files from a
//! document root.

pub mod connection;
pub mod log;
pub mod pool;
pub mod response;
pub mod server;
pub mod url;
