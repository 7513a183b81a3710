//! Worker side of the bridge - owns the compute module.
//!
//! The client side (spawning, request correlation, timeouts) is in client.rs.
//!
//! Architecture:
//! - One framed command stream in, one framed event stream out
//! - Engine output and command replies funnel through a single queue, so a
//!   run's stdout/stderr always precede its terminal event
//! - The engine occupies a blocking thread for the whole invocation; the
//!   router keeps serving and defers or rejects what it cannot satisfy

mod adapter;
mod router;

pub use router::run_worker;

use std::time::Duration;

use tokio::sync::mpsc;

use crate::bridge::protocol::{ErrorKind, Event, RequestId};

/// How long the worker waits before flagging a stuck initialization.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WorkerConfig {
    /// Deadline for the init diagnostic. Advisory only - a load that
    /// finishes later still makes the session ready.
    pub init_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}

/// Handle for emitting events from anywhere in the worker.
///
/// Engine callbacks fire on a blocking thread, so sends are synchronous and
/// queued; a pump task drains the queue to the framed writer in order.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    pub(crate) fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event channel closed, dropping event");
        }
    }

    pub(crate) fn stdout(&self, line: &str) {
        self.emit(Event::Stdout {
            line: line.to_string(),
        });
    }

    pub(crate) fn stderr(&self, line: &str) {
        self.emit(Event::Stderr {
            line: line.to_string(),
        });
    }

    pub(crate) fn error(&self, id: Option<RequestId>, kind: ErrorKind, message: impl Into<String>) {
        self.emit(Event::Error {
            id,
            kind,
            message: message.into(),
        });
    }
}
