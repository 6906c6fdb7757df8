use std::io::{BufReader, Read};
use std::process::{Command, ExitStatus, Output, Stdio};
use std::sync::mpsc;

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Result of a streamed command: exit status plus the stderr tail for reporting.
#[derive(Debug)]
pub struct Streamed {
    pub status: ExitStatus,
    pub stderr_tail: Vec<String>,
}

impl Streamed {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn error_summary(&self) -> String {
        if self.stderr_tail.is_empty() {
            format!("status {}", self.status)
        } else {
            self.stderr_tail.join(" | ")
        }
    }
}

pub fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

pub fn run_output(cmd: &mut Command) -> Result<Output> {
    tracing::debug!(cmd = %describe(cmd), "running command");
    cmd.stdin(Stdio::null())
        .output()
        .map_err(|e| Error::msg(format!("failed to run {}: {e}", describe(cmd))))
}

pub fn command_summary(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if !stderr.is_empty() {
        return sanitize_log_line(&stderr);
    }
    if !stdout.is_empty() {
        return sanitize_log_line(&stdout);
    }
    format!("status {}", out.status)
}

pub fn is_not_found_text(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    m.contains("not found")
        || m.contains("no such")
        || m.contains("does not exist")
        || m.contains("could not be found")
}

/// Run a command, handing every output line (split on `\n` or `\r`) to
/// `on_line` as it arrives. Tools that redraw progress with `\r` therefore
/// produce one line per redraw.
pub fn run_streaming<F>(mut cmd: Command, mut on_line: F) -> Result<Streamed>
where
    F: FnMut(Stream, &str),
{
    const STDERR_TAIL: usize = 8;

    tracing::debug!(cmd = %describe(&cmd), "running streamed command");
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("failed to spawn {}: {e}", describe(&cmd))))?;

    let (tx, rx) = mpsc::channel::<(Stream, String)>();
    if let Some(out) = child.stdout.take() {
        let tx = tx.clone();
        std::thread::spawn(move || read_output_stream(out, Stream::Stdout, tx));
    }
    if let Some(err) = child.stderr.take() {
        let tx = tx.clone();
        std::thread::spawn(move || read_output_stream(err, Stream::Stderr, tx));
    }
    drop(tx);

    let mut stderr_tail = Vec::new();
    for (stream, line) in rx {
        let line = sanitize_log_line(&line);
        if line.trim().is_empty() {
            continue;
        }
        if stream == Stream::Stderr {
            if stderr_tail.len() >= STDERR_TAIL {
                stderr_tail.remove(0);
            }
            stderr_tail.push(line.clone());
        }
        on_line(stream, &line);
    }

    let status = child
        .wait()
        .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
    Ok(Streamed {
        status,
        stderr_tail,
    })
}

fn read_output_stream<R: Read>(reader: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        if pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        let _ = tx.send((stream, line));
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn streaming_splits_carriage_returns() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf '10%%\\r20%%\\r30%%\\n'; echo oops >&2; exit 3");
        let mut seen = Vec::new();
        let res = run_streaming(cmd, |s, l| seen.push((s, l.to_string()))).expect("run");
        assert!(!res.success());
        assert_eq!(res.stderr_tail, vec!["oops".to_string()]);
        let stdout: Vec<_> = seen
            .iter()
            .filter(|(s, _)| *s == Stream::Stdout)
            .map(|(_, l)| l.as_str())
            .collect();
        assert_eq!(stdout, vec!["10%", "20%", "30%"]);
    }

    #[test]
    fn summary_prefers_stderr() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo 'directory not found' >&2; exit 1");
        let out = run_output(&mut cmd).expect("run");
        let msg = command_summary(&out);
        assert_eq!(msg, "directory not found");
        assert!(is_not_found_text(&msg));
    }
}
