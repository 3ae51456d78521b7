//! Literal response bytes for every outcome of a request.

use std::collections::HashMap;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/javascript  js",
    "application/json        json",
    "application/pdf         pdf",
    "image/gif               gif",
    "image/jpeg              jpeg jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "image/x-icon            ico",
    "text/css                css",
    "text/html               html htm",
    "text/plain              txt",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    InternalServerError,
    NotImplemented,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::NotFound => 404,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NotFound => "Not Found",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Status, headers and body of a reply, ready to be written out.
#[derive(Debug)]
pub struct Response {
    pub status: Status,
    headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl Response {
    /// A file served with the given content type.
    pub fn file(body: Vec<u8>, mimetype: &str) -> Self {
        let mut response = Self::new(Status::Ok, body);
        response.header("Content-Type", mimetype);
        response.header("Content-Length", response.body.len());
        response.header("Connection", "close");
        response.header("Cache-Control", "no-cache");
        response
    }

    /// A default reply for any (erroneous) occasion: a tiny HTML page naming the status.
    pub fn error(status: Status) -> Self {
        let body = format!("<html><body><h1>{}</h1></body></html>", status).into_bytes();
        let mut response = Self::new(status, body);
        response.header("Content-Type", "text/html");
        response.header("Content-Length", response.body.len());
        response.header("Connection", "close");
        response
    }

    pub fn not_implemented() -> Self {
        let mut response = Self::new(Status::NotImplemented, Vec::new());
        response.header("Content-Length", 0);
        response.header("Connection", "close");
        response
    }

    fn new(status: Status, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    fn header(&mut self, name: &'static str, value: impl ToString) {
        self.headers.push((name, value.to_string()));
    }

    #[cfg(test)]
    fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Status line and headers, terminated by the blank line.
    pub fn head(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {}\r\n", self.status);
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

/// Extension to content type lookup.
#[derive(Debug)]
pub struct MimeMap {
    mimetypes: HashMap<Vec<u8>, String>,
    default_mimetype: String,
}

impl MimeMap {
    /// Add line from an extension map.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c| matches!(c, ' ' | '\t'))
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        for extension in fields {
            self.mimetypes
                .insert(extension.as_bytes().to_vec(), mimetype.to_string());
        }
    }

    /// Content type for an extension, matched case-sensitively.
    pub fn content_type(&self, extension: Option<&[u8]>) -> &str {
        extension
            .and_then(|extension| self.mimetypes.get(extension))
            .unwrap_or(&self.default_mimetype)
    }
}

impl Default for MimeMap {
    /// Create MimeMap using the default extension map.
    fn default() -> Self {
        let mut mime_map = Self {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}
