//! Wire protocol types for client-worker communication.
//!
//! One bidirectional channel: [`Command`] flows client → worker, [`Event`]
//! flows worker → client. Every command carries a [`RequestId`]; the worker
//! echoes it in the command's terminal event so replies correlate exactly
//! instead of by filename.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root of the simulation directory inside the module's virtual filesystem.
pub const SIM_ROOT: &str = "/sim";

/// Script name used when a run supplies inline input content.
pub const DEFAULT_INPUT_FILE: &str = "input.lmp";

/// Monotonic identifier minted by the client for each command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Machine-readable category carried on every error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// A command other than init arrived before the session was ready.
    NotReady,
    /// Module load or session bootstrap failed - the session will never be ready.
    Init,
    /// The engine faulted, aborted, or was lost to a panic.
    Runtime,
    /// A run was already in flight.
    Busy,
    /// Unrecognized or malformed command.
    Protocol,
}

impl ErrorKind {
    /// Wire spelling, identical to the serde rename.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotReady => "not-ready",
            Self::Init => "init",
            Self::Runtime => "runtime",
            Self::Busy => "busy",
            Self::Protocol => "protocol",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands from the client to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Command {
    /// Load the compute module (must be the first command of a session).
    ///
    /// Terminal event: `ready`, or `error(init)`.
    Init { id: RequestId, module_path: PathBuf },

    /// Write bytes into the simulation directory.
    ///
    /// Terminal event: `file-uploaded`, or `error`.
    UploadFile {
        id: RequestId,
        name: String,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },

    /// Invoke the engine on an input script.
    ///
    /// Exactly one of `input_content` (inline script, written to
    /// [`DEFAULT_INPUT_FILE`]) or `input_file` (a previously uploaded name)
    /// must be set. Terminal event: `completed`, or `error`; any `stdout`/
    /// `stderr` produced by the run precedes the terminal event.
    RunLammps {
        id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_file: Option<String>,
    },

    /// Read a file back out of the simulation directory.
    ///
    /// Terminal event: `file-content`, or `error`.
    GetFile { id: RequestId, filename: String },

    /// Unlink a file. Failure (including a missing file) is silent.
    ///
    /// Terminal event: `file-deleted`, or nothing.
    DeleteFile { id: RequestId, filename: String },

    /// Remove every file under the simulation root, best effort.
    ///
    /// Terminal event: `stdout` summary, or `error`.
    Cleanup { id: RequestId },

    /// Stop the worker loop. No reply.
    Shutdown,
}

/// Every command kind in wire spelling, for classifying unparseable frames.
pub const COMMAND_KINDS: &[&str] = &[
    "init",
    "upload-file",
    "run-lammps",
    "get-file",
    "delete-file",
    "cleanup",
    "shutdown",
];

impl Command {
    /// Wire name of the command, as it appears in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::UploadFile { .. } => "upload-file",
            Self::RunLammps { .. } => "run-lammps",
            Self::GetFile { .. } => "get-file",
            Self::DeleteFile { .. } => "delete-file",
            Self::Cleanup { .. } => "cleanup",
            Self::Shutdown => "shutdown",
        }
    }

    /// Identifier the worker echoes in this command's terminal event.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Self::Init { id, .. }
            | Self::UploadFile { id, .. }
            | Self::RunLammps { id, .. }
            | Self::GetFile { id, .. }
            | Self::DeleteFile { id, .. }
            | Self::Cleanup { id } => Some(*id),
            Self::Shutdown => None,
        }
    }
}

/// Events from the worker to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    /// Module loaded and the simulation root exists. Sent exactly once per
    /// session, echoing the init command's id.
    Ready { id: RequestId },

    /// A line of engine print output.
    Stdout { line: String },

    /// A line of engine diagnostic output.
    Stderr { line: String },

    /// Command failure or worker diagnostic.
    ///
    /// `id` is present whenever a specific command caused the error; the init
    /// watchdog and engine abort diagnostics carry none.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        kind: ErrorKind,
        message: String,
    },

    /// Terminal event of a successful run.
    Completed { id: RequestId, exit_code: i32 },

    FileUploaded { id: RequestId, filename: String },

    FileDeleted { id: RequestId, filename: String },

    FileContent {
        id: RequestId,
        filename: String,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
}

impl Event {
    /// Wire name of the event, as it appears in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Stdout { .. } => "stdout",
            Self::Stderr { .. } => "stderr",
            Self::Error { .. } => "error",
            Self::Completed { .. } => "completed",
            Self::FileUploaded { .. } => "file-uploaded",
            Self::FileDeleted { .. } => "file-deleted",
            Self::FileContent { .. } => "file-content",
        }
    }
}

/// File content crosses the wire base64-encoded (JSON-safe binary).
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
