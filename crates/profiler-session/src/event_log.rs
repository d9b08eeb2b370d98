//! Captured runner output

use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::Instant;

/// Interval between scans while waiting for a line
pub const POLL_INTERVAL: Duration = Duration::from_millis(40);

/// How long to keep draining a stream after the process has exited
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Producer side of an [`EventLog`].
///
/// Appending never blocks, so it is safe to call from reader tasks and
/// from plain threads alike.
#[derive(Debug, Clone)]
pub struct LineSink {
    tx: mpsc::UnboundedSender<String>,
}

impl LineSink {
    /// Append a line; returns `false` once the log has been dropped
    pub fn append(&self, line: impl Into<String>) -> bool {
        self.tx.send(line.into()).is_ok()
    }
}

/// Result of waiting for a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The first line that matched
    Matched(String),
    /// The process exited before any line matched
    Exited,
    /// The timeout elapsed first
    TimedOut,
}

impl MatchOutcome {
    pub fn matched(&self) -> Option<&str> {
        match self {
            Self::Matched(line) => Some(line),
            _ => None,
        }
    }
}

/// Ordered log of the lines one output stream produced
#[derive(Debug)]
pub struct EventLog {
    rx: mpsc::UnboundedReceiver<String>,
    lines: Vec<String>,
    closed: bool,
}

impl EventLog {
    /// Create an empty log and the sink that feeds it
    pub fn new() -> (Self, LineSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Self {
            rx,
            lines: Vec::new(),
            closed: false,
        };
        (log, LineSink { tx })
    }

    /// Pull every delivered line into the buffer
    fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(line) => self.lines.push(line),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }

    /// Keep draining until every producer is gone or the grace period ends
    async fn settle(&mut self, grace: Duration) {
        let deadline = Instant::now().checked_add(grace);
        loop {
            self.drain();
            if self.closed || deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn scan(&self, cursor: &mut usize, pattern: &Regex) -> Option<String> {
        let found = self
            .lines
            .get(*cursor..)
            .and_then(|fresh| fresh.iter().find(|line| pattern.is_match(line)))
            .cloned();
        *cursor = self.lines.len();
        found
    }

    /// All lines received so far, in emission order
    pub fn lines(&mut self) -> &[String] {
        self.drain();
        &self.lines
    }

    /// All lines received so far joined with newlines
    pub fn contents(&mut self) -> String {
        self.drain();
        self.lines.join("\n")
    }

    /// Whether every producer has finished
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Wait for a line matching `pattern`.
    ///
    /// Only lines not yet taken into the log when the call starts are
    /// scanned. `has_exited` is polled between scans; `timeout` of `None`
    /// waits forever.
    pub async fn await_match<F>(
        &mut self,
        pattern: &Regex,
        timeout: Option<Duration>,
        mut has_exited: F,
    ) -> MatchOutcome
    where
        F: FnMut() -> bool,
    {
        let mut cursor = self.lines.len();
        // A deadline past the clock's range never arrives.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        loop {
            self.drain();
            if let Some(line) = self.scan(&mut cursor, pattern) {
                return MatchOutcome::Matched(line);
            }

            if has_exited() {
                // The reader may still hold lines written just before exit.
                self.settle(EXIT_DRAIN_GRACE).await;
                return match self.scan(&mut cursor, pattern) {
                    Some(line) => MatchOutcome::Matched(line),
                    None => MatchOutcome::Exited,
                };
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return MatchOutcome::TimedOut;
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait (bounded) until every producer has dropped its sink
    pub async fn wait_closed(&mut self, grace: Duration) {
        self.settle(grace).await;
    }
}
