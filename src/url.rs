//! Turning untrusted request targets into paths under the document root.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

/// A request target reduced to `/`-separated segments with no `.`, `..` or empty segments.
///
/// Always starts with `/`. Appending it to a directory can never escape that directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath(Vec<u8>);

impl ResolvedPath {
    /// Resolve a raw request target.
    ///
    /// The query and fragment are dropped, escapes are decoded, and `..` pops the previous
    /// segment. A `..` at the top level is ignored rather than rejected.
    pub fn from_target(target: &str) -> Self {
        let stripped = match target.find(|c| matches!(c, '?' | '#')) {
            Some(end) => &target[..end],
            None => target,
        };
        let decoded = url_decode(stripped);

        let mut segments: Vec<&[u8]> = Vec::new();
        for segment in decoded.split(|&b| b == b'/') {
            match segment {
                b"" | b"." => {}
                b".." => {
                    segments.pop();
                }
                segment => segments.push(segment),
            }
        }

        if segments.is_empty() {
            return Self(b"/".to_vec());
        }
        let mut path = Vec::with_capacity(decoded.len() + 1);
        for segment in segments {
            path.push(b'/');
            path.extend_from_slice(segment);
        }
        Self(path)
    }

    #[cfg(test)]
    fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_os_str(&self) -> &OsStr {
        OsStr::from_bytes(&self.0)
    }

    /// Append `index` if the path names a directory (ends in a slash).
    pub fn with_index(mut self, index: &str) -> Self {
        if self.0.ends_with(b"/") {
            self.0.extend_from_slice(index.as_bytes());
        }
        self
    }

    /// Text after the last `.` of the final segment, if any.
    pub fn extension(&self) -> Option<&[u8]> {
        let name = self.0.rsplit(|&b| b == b'/').next()?;
        let dot = name.iter().rposition(|&b| b == b'.')?;
        Some(&name[dot + 1..])
    }
}

impl std::fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Decode %XX (where XX are hexadecimal digits) to the byte it represents, and `+` to a space.
///
/// Malformed escapes are kept as they are.
pub fn url_decode(url: &str) -> Vec<u8> {
    let url = url.as_bytes();
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        let c = url[i];
        if c == b'%'
            && i + 2 < url.len()
            && url[i + 1].is_ascii_hexdigit()
            && url[i + 2].is_ascii_hexdigit()
        {
            decoded.push(hex_to_digit(url[i + 1]) * 16 + hex_to_digit(url[i + 2]));
            i += 3;
        } else if c == b'+' {
            decoded.push(b' ');
            i += 1;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    decoded
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}
