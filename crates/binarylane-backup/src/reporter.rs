use std::io::{IsTerminal, Write};
use std::sync::{Arc, Mutex};

use crossterm::{
    cursor::MoveToColumn,
    queue,
    terminal::{Clear, ClearType},
};

use crate::log_sanitize::sanitize_log_line;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportEvent {
    Section { title: String },
    Line { level: Level, message: String },
    ProgressStart { label: String },
    Progress { percent: u8, detail: Option<String> },
    ProgressFinish,
}

pub trait Reporter: Send + Sync {
    fn emit(&self, ev: ReportEvent);
}

/// Terminal verbosity, mirroring `-q` / (none) / `-v` / `-vv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    Debug,
}

impl Verbosity {
    pub fn from_flags(verbose: u8, quiet: bool) -> Self {
        if quiet {
            return Verbosity::Quiet;
        }
        match verbose {
            0 => Verbosity::Normal,
            1 => Verbosity::Verbose,
            _ => Verbosity::Debug,
        }
    }

    fn shows(&self, level: Level) -> bool {
        let min = match self {
            Verbosity::Quiet => Level::Error,
            Verbosity::Normal => Level::Notice,
            Verbosity::Verbose => Level::Info,
            Verbosity::Debug => Level::Debug,
        };
        level >= min
    }
}

pub struct StdoutReporter {
    verbosity: Verbosity,
    tty: bool,
    state: Mutex<ProgressState>,
}

#[derive(Default)]
struct ProgressState {
    active: bool,
    last_percent: Option<u8>,
}

impl StdoutReporter {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            tty: std::io::stdout().is_terminal(),
            state: Mutex::new(ProgressState::default()),
        }
    }

    fn end_progress_line(&self, st: &mut ProgressState) {
        if st.active && self.tty {
            println!();
        }
    }
}

impl Reporter for StdoutReporter {
    fn emit(&self, ev: ReportEvent) {
        let Ok(mut st) = self.state.lock() else {
            return;
        };
        match ev {
            ReportEvent::Section { title } => {
                if self.verbosity.shows(Level::Notice) {
                    self.end_progress_line(&mut st);
                    println!();
                    println!("{title}");
                    println!("{}", "-".repeat(title.chars().count()));
                    println!();
                }
            }
            ReportEvent::Line { level, message } => {
                if !self.verbosity.shows(level) {
                    return;
                }
                let line = sanitize_log_line(&message);
                if st.active && self.tty {
                    // Keep the bar on its own line.
                    let mut out = std::io::stdout();
                    let _ = queue!(out, MoveToColumn(0), Clear(ClearType::CurrentLine));
                    let _ = out.flush();
                }
                match level {
                    Level::Error => eprintln!("ERROR: {line}"),
                    Level::Warning => println!("WARN: {line}"),
                    _ => println!("{line}"),
                }
                st.last_percent = None;
            }
            ReportEvent::ProgressStart { label } => {
                st.active = true;
                st.last_percent = None;
                if self.verbosity.shows(Level::Notice) && !label.is_empty() {
                    println!("{label}");
                }
            }
            ReportEvent::Progress { percent, detail } => {
                if !self.verbosity.shows(Level::Notice) {
                    return;
                }
                let percent = percent.min(100);
                let detail = detail.map(|d| sanitize_log_line(&d)).unwrap_or_default();
                if self.tty {
                    let mut out = std::io::stdout();
                    let _ = queue!(out, MoveToColumn(0), Clear(ClearType::CurrentLine));
                    let _ = write!(out, "{} {detail}", render_bar(percent, 28));
                    let _ = out.flush();
                    st.last_percent = Some(percent);
                } else {
                    // One line per ten percent when the output is captured.
                    let bucket = percent / 10;
                    if st.last_percent.map(|p| p / 10) != Some(bucket) {
                        println!("{:>3}% {detail}", percent);
                        st.last_percent = Some(percent);
                    }
                }
            }
            ReportEvent::ProgressFinish => {
                self.end_progress_line(&mut st);
                st.active = false;
                st.last_percent = None;
            }
        }
    }
}

pub fn render_bar(percent: u8, width: usize) -> String {
    let percent = percent.min(100) as usize;
    let filled = percent * width / 100;
    format!(
        "[{}{}] {:>3}%",
        "=".repeat(filled),
        " ".repeat(width - filled),
        percent
    )
}

/// Records everything it is given; used by tests and embedding callers.
#[derive(Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<ReportEvent>>,
}

impl MemoryReporter {
    pub fn events(&self) -> Vec<ReportEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<(Level, String)> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                ReportEvent::Line { level, message } => Some((level, message)),
                _ => None,
            })
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|(_, m)| m.contains(needle))
    }

    pub fn progress_values(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                ReportEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect()
    }
}

impl Reporter for MemoryReporter {
    fn emit(&self, ev: ReportEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(ev);
        }
    }
}

/// Per-command context threaded through every component.
///
/// Every message goes to the reporter for the operator and to `tracing`
/// with the command name attached as a structured field.
#[derive(Clone)]
pub struct CommandCtx {
    pub command: &'static str,
    pub reporter: Arc<dyn Reporter>,
}

impl CommandCtx {
    pub fn new(command: &'static str, reporter: Arc<dyn Reporter>) -> Self {
        Self { command, reporter }
    }

    pub fn section(&self, title: impl Into<String>) {
        self.reporter.emit(ReportEvent::Section {
            title: title.into(),
        });
    }

    /// Operator output without a log record (tables, listings).
    pub fn line(&self, message: impl Into<String>) {
        self.reporter.emit(ReportEvent::Line {
            level: Level::Notice,
            message: message.into(),
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(command = self.command, "{message}");
        self.emit_line(Level::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(command = self.command, "{message}");
        self.emit_line(Level::Info, message);
    }

    pub fn notice(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(command = self.command, notice = true, "{message}");
        self.emit_line(Level::Notice, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(command = self.command, "{message}");
        self.emit_line(Level::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(command = self.command, "{message}");
        self.emit_line(Level::Error, message);
    }

    pub fn progress_start(&self, label: impl Into<String>) {
        self.reporter.emit(ReportEvent::ProgressStart {
            label: label.into(),
        });
    }

    pub fn progress(&self, percent: u8, detail: Option<&str>) {
        self.reporter.emit(ReportEvent::Progress {
            percent: percent.min(100),
            detail: detail.map(ToOwned::to_owned),
        });
    }

    pub fn progress_finish(&self) {
        self.reporter.emit(ReportEvent::ProgressFinish);
    }

    fn emit_line(&self, level: Level, message: String) {
        self.reporter.emit(ReportEvent::Line { level, message });
    }
}
