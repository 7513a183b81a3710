//! Client-side bridge: the host half of the worker transport.
//!
//! [`LammpsClient`] owns the command writer and a background event loop that
//! reads worker events off the transport. Request/await methods mint a
//! monotonic [`RequestId`], park a oneshot sender in a pending map, and
//! resolve when the correlated terminal event arrives. Engine output never
//! queues up client-side: stdout/stderr/unattributed-error events go straight
//! to the hooks supplied at construction.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, oneshot, watch};

use crate::bridge::protocol::{Command, ErrorKind, Event, RequestId, SIM_ROOT};
use crate::bridge::transport::{self, CommandWriter, EventReader, HostEndpoint};
use crate::engine::ModuleLoader;
use crate::worker::{self, WorkerConfig};

/// How long a pending file read waits before it is abandoned.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

type OutputHook = Arc<dyn Fn(&str) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(ErrorKind, &str) + Send + Sync>;

/// Configuration for a [`LammpsClient`].
///
/// The default hooks forward engine output to `tracing` under the
/// `lammps::engine` target.
#[derive(Clone)]
pub struct ClientConfig {
    module_path: PathBuf,
    read_timeout: Duration,
    on_stdout: OutputHook,
    on_stderr: OutputHook,
    on_error: ErrorHook,
}

impl ClientConfig {
    /// Configuration for a worker that loads the module at `module_path`.
    pub fn new(module_path: impl Into<PathBuf>) -> Self {
        Self {
            module_path: module_path.into(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            on_stdout: Arc::new(|line| {
                tracing::info!(target: "lammps::engine", "{}", line);
            }),
            on_stderr: Arc::new(|line| {
                tracing::warn!(target: "lammps::engine", "{}", line);
            }),
            on_error: Arc::new(|kind, message| {
                tracing::error!(target: "lammps::engine", %kind, "{}", message);
            }),
        }
    }

    /// Set how long [`LammpsClient::read_file`] waits for the worker.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Receive every engine stdout line.
    pub fn on_stdout(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_stdout = Arc::new(hook);
        self
    }

    /// Receive every engine stderr line.
    pub fn on_stderr(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_stderr = Arc::new(hook);
        self
    }

    /// Receive worker errors that resolve no pending request, such as the
    /// init watchdog diagnostic or an engine abort.
    pub fn on_error(mut self, hook: impl Fn(ErrorKind, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(hook);
        self
    }
}

/// Errors surfaced by [`LammpsClient`] methods.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The session has not reached ready; nothing was sent.
    #[error("session is not ready")]
    NotReady,

    /// A pending file read outlived the configured timeout.
    #[error("timed out after {0:?} waiting for the worker")]
    Timeout(Duration),

    /// The worker answered the request with an error event.
    #[error("worker replied {kind}: {message}")]
    Worker { kind: ErrorKind, message: String },

    /// The session is torn down; the worker is gone.
    #[error("session closed")]
    Closed,

    /// File content was requested as text but is not UTF-8.
    #[error("file content is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Writing to the transport failed.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
}

/// A request awaiting its terminal event.
enum PendingReply {
    Run(oneshot::Sender<Result<i32, ClientError>>),
    Read(oneshot::Sender<Result<Vec<u8>, ClientError>>),
}

/// Async handle to a worker session.
///
/// Dropping the client (and every outstanding method future) closes the
/// command stream; the worker observes EOF and exits.
pub struct LammpsClient {
    writer: Arc<Mutex<CommandWriter>>,
    pending: Arc<DashMap<RequestId, PendingReply>>,
    ready_rx: watch::Receiver<bool>,
    next_id: AtomicU64,
    read_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl LammpsClient {
    /// Spawn a worker for `loader` on this runtime and connect to it.
    ///
    /// The worker runs with [`WorkerConfig::default`]; use
    /// [`LammpsClient::connect`] with a hand-built transport pair when the
    /// worker needs custom configuration.
    pub async fn launch(
        loader: Arc<dyn ModuleLoader>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let (host, worker_end) = transport::pair();
        tokio::spawn(worker::run_worker(loader, worker_end, WorkerConfig::default()));
        Self::connect(host, config).await
    }

    /// Attach to the host end of an existing worker transport.
    ///
    /// Starts the event loop and immediately sends `init` for the configured
    /// module path. Readiness starts false; await it with
    /// [`LammpsClient::wait_until_ready`].
    pub async fn connect(endpoint: HostEndpoint, config: ClientConfig) -> Result<Self, ClientError> {
        let (writer, events) = endpoint.into_split();
        let (ready_tx, ready_rx) = watch::channel(false);
        let pending = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_event_loop(
            events,
            EventContext {
                pending: Arc::clone(&pending),
                ready_tx,
                closed: Arc::clone(&closed),
                on_stdout: config.on_stdout,
                on_stderr: config.on_stderr,
                on_error: config.on_error,
            },
        ));

        let client = Self {
            writer: Arc::new(Mutex::new(writer)),
            pending,
            ready_rx,
            next_id: AtomicU64::new(1),
            read_timeout: config.read_timeout,
            closed,
        };

        let id = client.mint_id();
        client
            .send(Command::Init {
                id,
                module_path: config.module_path,
            })
            .await?;
        Ok(client)
    }

    /// Whether the worker has reported ready.
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Suspend until the worker reports ready; immediate if it already has.
    ///
    /// There is no timeout here: the worker's own init watchdog reports a
    /// slow load through the error hook, and the caller owns any overall
    /// deadline. Fails only when the session is torn down.
    pub async fn wait_until_ready(&self) -> Result<(), ClientError> {
        let mut ready_rx = self.ready_rx.clone();
        ready_rx
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(())
    }

    /// Run the engine on an inline input script; resolves to the exit code.
    ///
    /// Fails fast with [`ClientError::NotReady`] before ready: nothing is
    /// sent. Engine output streams through the hooks while the run is in
    /// flight.
    pub async fn run_from_string(&self, input: &str) -> Result<i32, ClientError> {
        self.submit_run(Some(input.to_string()), None).await
    }

    /// Run a previously uploaded input script by name.
    pub async fn run_file(&self, filename: &str) -> Result<i32, ClientError> {
        self.submit_run(None, Some(strip_root_prefix(filename).to_string()))
            .await
    }

    /// Read a file from the simulation root; resolves to its bytes.
    ///
    /// Waits at most the configured read timeout. On timeout the request is
    /// forgotten, so a late worker reply resolves nothing.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        let filename = strip_root_prefix(path).to_string();
        let id = self.mint_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, PendingReply::Read(tx));

        if let Err(e) = self.send(Command::GetFile { id, filename }).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.read_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(ClientError::Timeout(self.read_timeout))
            }
        }
    }

    /// Read a file from the simulation root as UTF-8 text.
    pub async fn read_file_to_string(&self, path: &str) -> Result<String, ClientError> {
        let bytes = self.read_file(path).await?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Write bytes into the simulation root. Fire-and-forget: resolves once
    /// the command is on the wire, before the worker acts on it.
    pub async fn write_file(
        &self,
        path: &str,
        content: impl AsRef<[u8]>,
    ) -> Result<(), ClientError> {
        let id = self.mint_id();
        self.send(Command::UploadFile {
            id,
            name: strip_root_prefix(path).to_string(),
            content: content.as_ref().to_vec(),
        })
        .await
    }

    /// Delete a file from the simulation root. Fire-and-forget; deleting a
    /// missing file is a silent no-op on the worker side.
    pub async fn delete_file(&self, path: &str) -> Result<(), ClientError> {
        let id = self.mint_id();
        self.send(Command::DeleteFile {
            id,
            filename: strip_root_prefix(path).to_string(),
        })
        .await
    }

    /// Delete every file in the simulation root. Fire-and-forget.
    pub async fn cleanup(&self) -> Result<(), ClientError> {
        let id = self.mint_id();
        self.send(Command::Cleanup { id }).await
    }

    /// Ask the worker to stop, consuming the client.
    pub async fn shutdown(self) -> Result<(), ClientError> {
        self.send(Command::Shutdown).await
    }

    async fn submit_run(
        &self,
        input_content: Option<String>,
        input_file: Option<String>,
    ) -> Result<i32, ClientError> {
        if !self.is_ready() {
            return Err(ClientError::NotReady);
        }

        let id = self.mint_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, PendingReply::Run(tx));

        if let Err(e) = self
            .send(Command::RunLammps {
                id,
                input_content,
                input_file,
            })
            .await
        {
            self.pending.remove(&id);
            return Err(e);
        }

        // Runs are unbounded; only the worker decides when one is over.
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::Closed),
        }
    }

    fn mint_id(&self) -> RequestId {
        RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn send(&self, cmd: Command) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(cmd).await?;
        Ok(())
    }
}

/// Normalize a caller-supplied path to a name relative to the simulation
/// root. A leading `/sim/` is accepted and stripped; everything else,
/// including traversal segments, passes through to the worker unchecked.
fn strip_root_prefix(path: &str) -> &str {
    path.strip_prefix(SIM_ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(path)
}

/// State shared between the client handle and its event loop task.
struct EventContext {
    pending: Arc<DashMap<RequestId, PendingReply>>,
    ready_tx: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
    on_stdout: OutputHook,
    on_stderr: OutputHook,
    on_error: ErrorHook,
}

async fn run_event_loop(mut events: EventReader, ctx: EventContext) {
    while let Some(frame) = events.next().await {
        match frame {
            Ok(event) => ctx.handle(event),
            Err(e) => {
                tracing::error!(error = %e, "Event channel error");
                break;
            }
        }
    }

    ctx.closed.store(true, Ordering::Release);
    // Dropping the parked senders fails every in-flight request with Closed.
    ctx.pending.clear();
    tracing::debug!("Client event loop exiting");
}

impl EventContext {
    fn handle(&self, event: Event) {
        match event {
            Event::Ready { id } => {
                tracing::debug!(request = %id, "Worker ready");
                self.ready_tx.send_replace(true);
            }
            Event::Stdout { line } => (self.on_stdout)(&line),
            Event::Stderr { line } => (self.on_stderr)(&line),
            Event::Completed { id, exit_code } => match self.pending.remove(&id) {
                Some((_, PendingReply::Run(tx))) => {
                    if tx.send(Ok(exit_code)).is_err() {
                        tracing::warn!(request = %id, "Run caller went away before completion");
                    }
                }
                Some(_) => tracing::warn!(request = %id, "Completed did not match a pending run"),
                None => tracing::debug!(request = %id, "Completed with no pending request"),
            },
            Event::FileContent { id, content, .. } => match self.pending.remove(&id) {
                Some((_, PendingReply::Read(tx))) => {
                    let _ = tx.send(Ok(content));
                }
                Some(_) => tracing::warn!(request = %id, "File content did not match a pending read"),
                // The read most likely timed out already.
                None => tracing::debug!(request = %id, "Late file content dropped"),
            },
            Event::Error { id, kind, message } => {
                match id.and_then(|id| self.pending.remove(&id)) {
                    Some((_, PendingReply::Run(tx))) => {
                        let _ = tx.send(Err(ClientError::Worker { kind, message }));
                    }
                    Some((_, PendingReply::Read(tx))) => {
                        let _ = tx.send(Err(ClientError::Worker { kind, message }));
                    }
                    None => (self.on_error)(kind, &message),
                }
            }
            Event::FileUploaded { id, filename } => {
                tracing::debug!(request = %id, file = %filename, "File uploaded");
            }
            Event::FileDeleted { id, filename } => {
                tracing::debug!(request = %id, file = %filename, "File deleted");
            }
        }
    }
}
