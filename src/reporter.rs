//! Console sink for human-readable report lines.
//!
//! The stats engine and the session drivers never print directly; every
//! interval line, summary and peer result goes through a [`ReportSink`].
//! Diagnostics go through the `log` macros instead.

use parking_lot::Mutex;
use std::sync::Arc;

/// Destination for report lines.
///
/// The trait is implemented for any `Fn(&str) + Send + Sync` closure.
///
/// # Examples
///
/// ## Using a Closure
///
/// ```
/// use nperf3::reporter::{ReportSink, SinkRef};
/// use std::sync::Arc;
///
/// let sink: SinkRef = Arc::new(|line: &str| eprintln!("{}", line));
/// sink.report("[ ID] Interval           Transfer     Bitrate");
/// ```
///
/// ## Custom Implementation
///
/// ```
/// use nperf3::reporter::ReportSink;
///
/// struct Silent;
///
/// impl ReportSink for Silent {
///     fn report(&self, _line: &str) {}
/// }
/// ```
pub trait ReportSink: Send + Sync {
    /// Emits one line, without trailing newline.
    fn report(&self, line: &str);
}

impl<F> ReportSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn report(&self, line: &str) {
        self(line)
    }
}

pub type SinkRef = Arc<dyn ReportSink>;

/// Prints every line to standard output.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl ReportSink for StdoutSink {
    fn report(&self, line: &str) {
        println!("{}", line);
    }
}

/// Keeps every line in memory.
///
/// Clones share the same buffer, so one handle can be given to a session
/// while another inspects the output afterwards.
///
/// # Examples
///
/// ```
/// use nperf3::reporter::{CaptureSink, ReportSink};
///
/// let capture = CaptureSink::new();
/// capture.report("hello");
/// assert_eq!(capture.lines(), vec!["hello".to_string()]);
/// ```
#[derive(Debug, Default, Clone)]
pub struct CaptureSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Lines containing `needle`.
    pub fn matching(&self, needle: &str) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.contains(needle))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl ReportSink for CaptureSink {
    fn report(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}
