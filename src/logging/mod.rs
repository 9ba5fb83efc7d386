//! Output control and diagnostics
//!
//! This module provides the [`Logger`] for everything the user is meant to read: plan and
//! phase listings, `info:`/`warning:`/`error:` lines on the error stream, and one result line
//! per pushed manifest on the output stream. The sinks are injectable so tests can capture
//! what a run printed.
//!
//! Verbosity-gated diagnostics go through `tracing`; [`init_tracing`] installs the subscriber.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Logger responsible for all user-visible output
#[derive(Clone)]
pub struct Logger {
    pub verbose: bool,
    pub quiet: bool,
    pub start_time: Option<Instant>,
    out: Sink,
    err_out: Sink,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("verbose", &self.verbose)
            .field("quiet", &self.quiet)
            .finish()
    }
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self::with_writers(verbose, Box::new(io::stdout()), Box::new(io::stderr()))
    }

    pub fn new_quiet() -> Self {
        let mut logger = Self::new(false);
        logger.quiet = true;
        logger
    }

    pub fn with_writers(verbose: bool, out: Box<dyn Write + Send>, err_out: Box<dyn Write + Send>) -> Self {
        Self {
            verbose,
            quiet: false,
            start_time: Some(Instant::now()),
            out: Arc::new(Mutex::new(out)),
            err_out: Arc::new(Mutex::new(err_out)),
        }
    }

    /// Logger writing into in-memory buffers, returned as `(logger, out, err_out)`
    pub fn capture() -> (Self, SharedBuffer, SharedBuffer) {
        let out = SharedBuffer::default();
        let err_out = SharedBuffer::default();
        let logger = Self::with_writers(false, Box::new(out.clone()), Box::new(err_out.clone()));
        (logger, out, err_out)
    }

    /// Information message
    pub fn info(&self, message: &str) {
        if !self.quiet {
            self.write_err(&format!("info: {}", message));
        }
    }

    /// Warning message
    pub fn warning(&self, message: &str) {
        if !self.quiet {
            self.write_err(&format!("warning: {}", message));
        }
    }

    /// Error message, printed even in quiet mode
    pub fn error(&self, message: &str) {
        self.write_err(&format!("error: {}", message));
    }

    /// Unprefixed line on the error stream (plan listings, transfer notices)
    pub fn line(&self, message: &str) {
        if !self.quiet {
            self.write_err(message);
        }
    }

    /// Detailed information (only shown in verbose mode)
    pub fn detail(&self, message: &str) {
        if self.verbose && !self.quiet {
            self.write_err(&format!("   {}", message));
        }
    }

    /// Result line on the output stream
    pub fn result(&self, message: &str) {
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{}", message);
            let _ = out.flush();
        }
    }

    fn write_err(&self, message: &str) {
        if let Ok(mut err_out) = self.err_out.lock() {
            let _ = writeln!(err_out, "{}", message);
            let _ = err_out.flush();
        }
    }

    /// Format a byte count in human-readable units
    pub fn format_size(&self, bytes: u64) -> String {
        format_size(bytes)
    }

    /// Format duration in human-readable format
    pub fn format_duration(&self, duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", (millis / 10) * 10)
        } else if duration.as_secs() < 60 {
            format!("{:.2}s", duration.as_secs_f64())
        } else if duration.as_secs() < 3600 {
            let secs = duration.as_secs();
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            let secs = duration.as_secs();
            format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }

    /// Format transfer speed in human-readable format
    pub fn format_speed(&self, bytes: u64, elapsed: Duration) -> String {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return format!("{}/s", format_size(0));
        }
        format!("{}/s", format_size((bytes as f64 / secs) as u64))
    }

    pub fn elapsed_time(&self) -> Duration {
        self.start_time.map(|s| s.elapsed()).unwrap_or_default()
    }
}

/// Format a byte count in binary units (`KiB`, `MiB`, ...)
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        let fixed = format!("{:.3}", size);
        format!("{}{}", fixed.trim_end_matches('0').trim_end_matches('.'), UNITS[unit])
    }
}

/// Cloneable in-memory writer used to capture logger output
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn contents(&self) -> String {
        self.inner
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("output buffer poisoned"))?;
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Install the diagnostics subscriber. `RUST_LOG` takes precedence; otherwise each `-v`
/// raises this crate's level from warn through info and debug to trace.
pub fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,image_mirror={}", level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}
