//! Access log in Common Log Format.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::time::SystemTime;

use chrono::{DateTime, Local};

/// Common Log Format (CLF) formatted date in local timezone.
pub struct ClfDate(pub SystemTime);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Encode string for logging. Logs should not contain control characters or double quotes.
pub struct LogEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            } else {
                f.write_char(c)?;
            }
        }
        Ok(())
    }
}

/// One finished exchange, as it appears in the access log.
#[derive(Debug)]
pub struct AccessRecord<'a> {
    pub client: IpAddr,
    pub method: &'a str,
    pub target: &'a str,
    pub code: u16,
    pub bytes_sent: usize,
}

impl<'a> AccessRecord<'a> {
    pub fn line(&self, now: SystemTime) -> String {
        format!(
            "{} - - {} \"{} {} HTTP/1.1\" {} {}\n",
            self.client,
            ClfDate(now),
            LogEncoded(self.method),
            LogEncoded(self.target),
            self.code,
            self.bytes_sent,
        )
    }

    /// Print the record to stdout. A single `print!` keeps lines from different workers whole.
    pub fn log(&self) {
        print!("{}", self.line(SystemTime::now()));
    }
}
