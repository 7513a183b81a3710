//! Worker-side message router.
//!
//! Owns the session state machine: commands arrive framed, get dispatched
//! against the current phase, and every reply leaves through the single
//! ordered event queue. Blocking work (module load, engine run) happens on
//! spawn_blocking threads and reports back over a completion channel, so the
//! router keeps serving while the engine is occupied.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::bridge::codec::DecodedCommand;
use crate::bridge::protocol::{COMMAND_KINDS, Command, ErrorKind, Event, RequestId};
use crate::bridge::transport::WorkerEndpoint;
use crate::engine::{EngineCallbacks, EngineFault, ModuleLoader};

use super::adapter::{EngineAdapter, RunInput};
use super::{EventSender, WorkerConfig};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No init received yet.
    Unknown,
    /// Module load in flight.
    Loading,
    Ready,
    /// An invocation is occupying the engine.
    Busy,
    /// Load or bootstrap failed. Permanent.
    InitFailed,
    /// The module was lost to a panic. Permanent.
    Defunct,
}

/// Completion of a blocking task, reported back to the router loop.
enum TaskDone {
    Loaded {
        id: RequestId,
        outcome: Result<EngineAdapter, String>,
    },
    RunFinished {
        id: RequestId,
        adapter: EngineAdapter,
        result: Result<i32, EngineFault>,
    },
    /// The blocking run never returned the module.
    RunLost { id: RequestId, message: String },
}

/// Run the worker loop until the peer disconnects or asks for shutdown.
///
/// `loader` produces the compute module when init arrives; `endpoint` is the
/// worker end of a transport pair. Returns once in-flight work has settled
/// and every queued event has been written out.
pub async fn run_worker(
    loader: Arc<dyn ModuleLoader>,
    endpoint: WorkerEndpoint,
    config: WorkerConfig,
) -> io::Result<()> {
    let (mut commands, mut event_writer) = endpoint.into_split();

    // Single writer task keeps the event stream ordered end to end.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let events = EventSender::new(event_tx);
    let pump = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Err(e) = event_writer.send(event).await {
                tracing::warn!(error = %e, "Failed to write event, stopping pump");
                break;
            }
        }
    });

    let (done_tx, mut done_rx) = mpsc::channel(1);
    let mut session = WorkerSession::new(loader, config, events, done_tx);
    let session_id = session.session;

    tracing::info!(session = %session_id, "Worker started");

    loop {
        tokio::select! {
            biased;

            frame = commands.next() => {
                match frame {
                    Some(Ok(DecodedCommand::Command(Command::Shutdown))) => {
                        tracing::info!(session = %session_id, "Shutdown requested");
                        break;
                    }
                    Some(Ok(DecodedCommand::Command(cmd))) => session.handle_command(cmd),
                    Some(Ok(DecodedCommand::Invalid { kind, id, detail })) => {
                        session.handle_invalid(kind, id, detail);
                    }
                    Some(Err(e)) => {
                        tracing::error!(session = %session_id, error = %e, "Command channel error");
                        break;
                    }
                    None => {
                        tracing::info!(session = %session_id, "Command channel closed, exiting");
                        break;
                    }
                }
            }

            Some(done) = done_rx.recv() => {
                session.handle_task_done(done);
            }
        }
    }

    // Let in-flight work settle and flush the queue: the pump exits once
    // every EventSender clone (session, engine callbacks) is gone.
    drop(session);
    drop(done_rx);
    let _ = pump.await;

    tracing::info!(session = %session_id, "Worker exiting");
    Ok(())
}

/// Wire the engine's output hooks straight into the outbound event queue.
fn engine_callbacks(events: &EventSender) -> EngineCallbacks {
    let print = events.clone();
    let print_err = events.clone();
    let abort = events.clone();
    let exit = events.clone();
    EngineCallbacks {
        print: Arc::new(move |line| print.stdout(line)),
        print_err: Arc::new(move |line| print_err.stderr(line)),
        on_abort: Arc::new(move |what| {
            abort.error(None, ErrorKind::Runtime, format!("engine aborted: {what}"));
        }),
        on_exit: Arc::new(move |status| {
            exit.stdout(&format!("engine exited with status: {status}"));
        }),
    }
}

/// One worker session: phase machine, the adapter once loaded, and the
/// commands parked while a run occupies the engine.
struct WorkerSession {
    session: Uuid,
    loader: Arc<dyn ModuleLoader>,
    config: WorkerConfig,
    events: EventSender,
    done_tx: mpsc::Sender<TaskDone>,
    phase: Phase,
    phase_tx: watch::Sender<Phase>,
    adapter: Option<EngineAdapter>,
    deferred: VecDeque<Command>,
}

impl WorkerSession {
    fn new(
        loader: Arc<dyn ModuleLoader>,
        config: WorkerConfig,
        events: EventSender,
        done_tx: mpsc::Sender<TaskDone>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Unknown);
        Self {
            session: Uuid::new_v4(),
            loader,
            config,
            events,
            done_tx,
            phase: Phase::Unknown,
            phase_tx,
            adapter: None,
            deferred: VecDeque::new(),
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        tracing::debug!(session = %self.session, ?phase, "Phase transition");
        self.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    fn handle_command(&mut self, cmd: Command) {
        if self.phase != Phase::Busy {
            self.dispatch(cmd);
            return;
        }

        match cmd {
            Command::RunLammps { id, .. } => {
                self.events.error(
                    Some(id),
                    ErrorKind::Busy,
                    "run-lammps: a run is already in progress",
                );
            }
            Command::Init { id, .. } => {
                self.events.error(
                    Some(id),
                    ErrorKind::Protocol,
                    "init: session already initialized",
                );
            }
            cmd => {
                tracing::debug!(
                    session = %self.session,
                    kind = cmd.kind(),
                    "Run in progress, deferring command"
                );
                self.deferred.push_back(cmd);
            }
        }
    }

    fn dispatch(&mut self, cmd: Command) {
        match cmd {
            // The event loop breaks on shutdown before dispatch.
            Command::Shutdown => {}
            Command::Init { id, module_path } => self.handle_init(id, module_path),
            cmd => self.dispatch_to_engine(cmd),
        }
    }

    /// Commands that require a live engine.
    fn dispatch_to_engine(&mut self, cmd: Command) {
        let kind = cmd.kind();
        let Some(id) = cmd.id() else {
            return;
        };

        match self.phase {
            Phase::Unknown | Phase::Loading | Phase::InitFailed => {
                self.events.error(
                    Some(id),
                    ErrorKind::NotReady,
                    format!("{kind}: worker not initialized yet"),
                );
                return;
            }
            Phase::Defunct => {
                self.events.error(
                    Some(id),
                    ErrorKind::Runtime,
                    format!("{kind}: engine lost, session is defunct"),
                );
                return;
            }
            Phase::Ready | Phase::Busy => {}
        }

        match cmd {
            Command::UploadFile { id, name, content } => self.handle_upload(id, name, content),
            Command::RunLammps {
                id,
                input_content,
                input_file,
            } => self.handle_run(id, input_content, input_file),
            Command::GetFile { id, filename } => self.handle_get(id, filename),
            Command::DeleteFile { id, filename } => self.handle_delete(id, filename),
            Command::Cleanup { id } => self.handle_cleanup(id),
            Command::Init { .. } | Command::Shutdown => {}
        }
    }

    fn handle_init(&mut self, id: RequestId, module_path: PathBuf) {
        match self.phase {
            Phase::Unknown => {}
            Phase::Loading => {
                self.events.error(
                    Some(id),
                    ErrorKind::Protocol,
                    "init: initialization already in progress",
                );
                return;
            }
            Phase::InitFailed => {
                self.events.error(
                    Some(id),
                    ErrorKind::Protocol,
                    "init: initialization already failed",
                );
                return;
            }
            Phase::Defunct => {
                self.events.error(
                    Some(id),
                    ErrorKind::Runtime,
                    "init: engine lost, session is defunct",
                );
                return;
            }
            Phase::Ready | Phase::Busy => {
                self.events.error(
                    Some(id),
                    ErrorKind::Protocol,
                    "init: session already initialized",
                );
                return;
            }
        }

        tracing::info!(session = %self.session, module = %module_path.display(), "Loading module");
        self.set_phase(Phase::Loading);

        let callbacks = engine_callbacks(&self.events);
        let loader = Arc::clone(&self.loader);
        let done_tx = self.done_tx.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let module = loader
                .load(&module_path, callbacks)
                .map_err(|e| e.to_string())?;
            EngineAdapter::bootstrap(module).map_err(|e| format!("Failed to initialize: {e}"))
        });
        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(_) => Err("module load panicked".to_string()),
            };
            let _ = done_tx.send(TaskDone::Loaded { id, outcome }).await;
        });

        self.spawn_watchdog();
    }

    /// Diagnostic only: flags a load that is still pending past the deadline
    /// without cancelling it.
    ///
    /// The task must not outlive the load it watches: it holds an event
    /// sender, and the worker cannot finish flushing while one is alive.
    fn spawn_watchdog(&self) {
        let events = self.events.clone();
        let mut phase_rx = self.phase_tx.subscribe();
        let deadline = self.config.init_timeout;
        let session = self.session;
        tokio::spawn(async move {
            let timer = tokio::time::sleep(deadline);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    _ = &mut timer => {
                        if *phase_rx.borrow() == Phase::Loading {
                            tracing::warn!(%session, "Module load still pending past deadline");
                            events.error(
                                None,
                                ErrorKind::Init,
                                format!("module initialization timeout after {deadline:?}"),
                            );
                        }
                        break;
                    }
                    changed = phase_rx.changed() => {
                        if changed.is_err() || *phase_rx.borrow() != Phase::Loading {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn handle_upload(&mut self, id: RequestId, name: String, content: Vec<u8>) {
        let Some(adapter) = self.adapter.as_mut() else {
            return self.engine_missing(id, "upload-file");
        };
        match adapter.upload(&name, &content) {
            Ok(()) => self.events.emit(Event::FileUploaded { id, filename: name }),
            Err(e) => self.events.error(
                Some(id),
                ErrorKind::Runtime,
                format!("Failed to upload {name}: {e}"),
            ),
        }
    }

    fn handle_run(
        &mut self,
        id: RequestId,
        input_content: Option<String>,
        input_file: Option<String>,
    ) {
        let Some(input) = RunInput::from_command(input_content, input_file) else {
            self.events.error(
                Some(id),
                ErrorKind::Protocol,
                "run-lammps: neither input_content nor input_file given",
            );
            return;
        };
        let Some(mut adapter) = self.adapter.take() else {
            return self.engine_missing(id, "run-lammps");
        };

        self.events.stdout("=== Starting LAMMPS run ===");

        let input_file = match adapter.stage_input(input) {
            Ok(file) => file,
            Err(e) => {
                self.adapter = Some(adapter);
                self.events.error(
                    Some(id),
                    ErrorKind::Runtime,
                    format!("Execution error: {e}"),
                );
                return;
            }
        };

        self.events.stdout(&format!("> lmp -in {input_file}"));
        tracing::debug!(
            session = %self.session,
            request = %id,
            input = %input_file,
            "Starting engine run"
        );
        self.set_phase(Phase::Busy);

        let done_tx = self.done_tx.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let result = adapter.run(&input_file);
            (adapter, result)
        });
        tokio::spawn(async move {
            let done = match handle.await {
                Ok((adapter, result)) => TaskDone::RunFinished {
                    id,
                    adapter,
                    result,
                },
                Err(e) if e.is_panic() => TaskDone::RunLost {
                    id,
                    message: "engine panicked during run".to_string(),
                },
                Err(_) => TaskDone::RunLost {
                    id,
                    message: "engine run cancelled".to_string(),
                },
            };
            let _ = done_tx.send(done).await;
        });
    }

    fn handle_get(&mut self, id: RequestId, filename: String) {
        let Some(adapter) = self.adapter.as_mut() else {
            return self.engine_missing(id, "get-file");
        };
        match adapter.read(&filename) {
            Ok(content) => self.events.emit(Event::FileContent {
                id,
                filename,
                content,
            }),
            Err(e) => self.events.error(
                Some(id),
                ErrorKind::Runtime,
                format!("Failed to read {filename}: {e}"),
            ),
        }
    }

    fn handle_delete(&mut self, id: RequestId, filename: String) {
        let Some(adapter) = self.adapter.as_mut() else {
            return;
        };
        match adapter.delete(&filename) {
            Ok(()) => self.events.emit(Event::FileDeleted { id, filename }),
            // The file may simply not exist; stay silent either way.
            Err(e) => tracing::debug!(
                session = %self.session,
                file = %filename,
                error = %e,
                "Delete failed, ignoring"
            ),
        }
    }

    fn handle_cleanup(&mut self, id: RequestId) {
        let Some(adapter) = self.adapter.as_mut() else {
            return self.engine_missing(id, "cleanup");
        };
        match adapter.cleanup() {
            Ok(()) => self.events.stdout("Simulation files cleaned up"),
            Err(e) => {
                self.events
                    .error(Some(id), ErrorKind::Runtime, format!("Cleanup error: {e}"))
            }
        }
    }

    fn handle_invalid(&mut self, kind: Option<String>, id: Option<RequestId>, detail: String) {
        tracing::warn!(
            session = %self.session,
            kind = kind.as_deref().unwrap_or("<none>"),
            error = %detail,
            "Unparseable command"
        );
        let message = match kind.as_deref() {
            Some(t) if COMMAND_KINDS.contains(&t) => format!("malformed {t} command: {detail}"),
            Some(t) => format!("Unknown message type: {t}"),
            None => format!("malformed command: {detail}"),
        };
        self.events.error(id, ErrorKind::Protocol, message);
    }

    fn handle_task_done(&mut self, done: TaskDone) {
        match done {
            TaskDone::Loaded { id, outcome } => match outcome {
                Ok(adapter) => {
                    self.adapter = Some(adapter);
                    self.set_phase(Phase::Ready);
                    tracing::info!(session = %self.session, "Module ready");
                    self.events.emit(Event::Ready { id });
                }
                Err(message) => {
                    self.set_phase(Phase::InitFailed);
                    tracing::error!(session = %self.session, error = %message, "Module load failed");
                    self.events.error(Some(id), ErrorKind::Init, message);
                }
            },
            TaskDone::RunFinished {
                id,
                adapter,
                result,
            } => {
                self.adapter = Some(adapter);
                self.set_phase(Phase::Ready);
                match result {
                    Ok(exit_code) => {
                        tracing::debug!(session = %self.session, request = %id, exit_code, "Run completed");
                        self.events.emit(Event::Completed { id, exit_code });
                    }
                    Err(fault) => {
                        tracing::warn!(session = %self.session, request = %id, error = %fault, "Run failed");
                        self.events.error(
                            Some(id),
                            ErrorKind::Runtime,
                            format!("Execution error: {fault}"),
                        );
                    }
                }
                self.drain_deferred();
            }
            TaskDone::RunLost { id, message } => {
                self.set_phase(Phase::Defunct);
                tracing::error!(session = %self.session, request = %id, "Engine lost during run");
                self.events.error(Some(id), ErrorKind::Runtime, message);
                self.drain_deferred();
            }
        }
    }

    /// Replay commands parked during the run, after its terminal event.
    fn drain_deferred(&mut self) {
        // Runs are never deferred, so draining cannot re-enter Busy.
        while let Some(cmd) = self.deferred.pop_front() {
            self.dispatch(cmd);
        }
    }

    fn engine_missing(&mut self, id: RequestId, kind: &str) {
        self.events.error(
            Some(id),
            ErrorKind::Runtime,
            format!("{kind}: engine unavailable"),
        );
    }
}
