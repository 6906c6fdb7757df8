use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;

use crate::error::{Error, Result};
use crate::process::run_streaming;

/// Progress callback: bytes written so far and the total when known.
pub type ProgressFn<'a> = dyn FnMut(u64, Option<u64>) + 'a;

pub trait Transport {
    /// Fetch `url` into `dest`, returning the number of bytes written.
    fn fetch(&self, url: &str, dest: &Path, progress: &mut ProgressFn<'_>) -> Result<u64>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// `timeout` of `None` leaves large downloads unbounded.
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let mut builder =
            Client::builder().user_agent(concat!("blbackup/", env!("CARGO_PKG_VERSION")));
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        let client = builder
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str, dest: &Path, progress: &mut ProgressFn<'_>) -> Result<u64> {
        let mut res = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::msg(format!("Download failed: {e}")))?;
        let status = res.status();
        if !status.is_success() {
            return Err(Error::api(
                "Download failed",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown"),
            ));
        }
        let total = res.content_length();

        let file = File::create(dest)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
        let mut out = BufWriter::new(file);
        let mut buf = vec![0u8; 256 * 1024];
        let mut written = 0u64;
        progress(0, total);
        loop {
            let n = res
                .read(&mut buf)
                .map_err(|e| Error::msg(format!("Download interrupted: {e}")))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            written += n as u64;
            progress(written, total);
        }
        out.flush()?;
        Ok(written)
    }
}

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%").expect("valid percent regex"));

/// Last `NN%` value on a progress line, capped at 100.
pub fn parse_percent(line: &str) -> Option<u8> {
    PERCENT_RE
        .captures_iter(line)
        .last()
        .and_then(|c| c[1].parse::<u16>().ok())
        .map(|p| p.min(100) as u8)
}

/// Lines worth echoing: more than 15 characters after dots and whitespace
/// are stripped. wget's dot rows fall below that.
pub fn is_meaningful(line: &str) -> bool {
    line.chars()
        .filter(|c| !c.is_whitespace() && *c != '.')
        .count()
        > 15
}

pub struct WgetTransport {
    binary: String,
}

impl WgetTransport {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Transport for WgetTransport {
    fn fetch(&self, url: &str, dest: &Path, progress: &mut ProgressFn<'_>) -> Result<u64> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--progress=dot:giga")
            .arg("-O")
            .arg(dest)
            .arg(url);
        let res = run_streaming(cmd, |_, line| {
            if let Some(p) = parse_percent(line) {
                // Bytes are unknown here; report percent against 100.
                progress(u64::from(p), Some(100));
            } else if is_meaningful(line) {
                tracing::debug!(tool = "wget", "{line}");
            }
        })?;
        if !res.success() {
            return Err(Error::msg(format!(
                "Download failed: {}",
                res.error_summary()
            )));
        }
        let size = std::fs::metadata(dest)
            .map_err(|e| Error::msg(format!("download produced no file {}: {e}", dest.display())))?
            .len();
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_taken_from_progress_lines() {
        assert_eq!(
            parse_percent(" 1048576K ........ ........ ........ 37% 98.2M 6s"),
            Some(37)
        );
        assert_eq!(parse_percent("100%[=====>] 2.0G"), Some(100));
        assert_eq!(parse_percent("Saving to: 'x.zst'"), None);
    }

    #[test]
    fn dot_rows_are_noise() {
        assert!(!is_meaningful("  ........ ........ ........"));
        assert!(is_meaningful("Resolving download.binarylane.com.au"));
    }
}
