//! Lifecycle wrapper around the compute module.
//!
//! Translates bridge operations into virtual-filesystem calls and the
//! engine's `main`-style invoke. Everything here is synchronous; the router
//! decides what runs on a blocking thread.

use crate::bridge::protocol::{DEFAULT_INPUT_FILE, SIM_ROOT};
use crate::engine::{ComputeModule, EngineFault, FsError};

/// The input a run was asked to execute.
pub(crate) enum RunInput {
    /// Script text supplied inline; staged to [`DEFAULT_INPUT_FILE`].
    Inline(String),
    /// Name of a previously uploaded script.
    Uploaded(String),
}

impl RunInput {
    /// Inline content wins when both fields are set.
    pub(crate) fn from_command(content: Option<String>, file: Option<String>) -> Option<Self> {
        match (content, file) {
            (Some(content), _) => Some(Self::Inline(content)),
            (None, Some(file)) => Some(Self::Uploaded(file)),
            (None, None) => None,
        }
    }
}

/// Owns the loaded module for the lifetime of a session.
pub(crate) struct EngineAdapter {
    module: Box<dyn ComputeModule>,
}

impl EngineAdapter {
    /// Wrap a freshly loaded module and create the simulation root.
    pub(crate) fn bootstrap(mut module: Box<dyn ComputeModule>) -> Result<Self, FsError> {
        module.fs().mkdir(SIM_ROOT)?;
        Ok(Self { module })
    }

    pub(crate) fn upload(&mut self, name: &str, content: &[u8]) -> Result<(), FsError> {
        self.module.fs().write_file(&sim_path(name), content)
    }

    pub(crate) fn read(&mut self, filename: &str) -> Result<Vec<u8>, FsError> {
        self.module.fs().read_file(&sim_path(filename))
    }

    pub(crate) fn delete(&mut self, filename: &str) -> Result<(), FsError> {
        self.module.fs().unlink(&sim_path(filename))
    }

    /// Unlink every file under the simulation root, best effort.
    pub(crate) fn cleanup(&mut self) -> Result<(), FsError> {
        for entry in self.module.fs().readdir(SIM_ROOT)? {
            if entry == "." || entry == ".." {
                continue;
            }
            if let Err(e) = self.module.fs().unlink(&sim_path(&entry)) {
                tracing::debug!(file = %entry, error = %e, "Cleanup unlink failed, skipping");
            }
        }
        Ok(())
    }

    /// Stage the input script, returning the filename the engine will run.
    pub(crate) fn stage_input(&mut self, input: RunInput) -> Result<String, FsError> {
        match input {
            RunInput::Inline(content) => {
                self.upload(DEFAULT_INPUT_FILE, content.as_bytes())?;
                Ok(DEFAULT_INPUT_FILE.to_string())
            }
            RunInput::Uploaded(file) => Ok(file),
        }
    }

    /// Blocking engine run; call on a blocking thread.
    pub(crate) fn run(&mut self, input_file: &str) -> Result<i32, EngineFault> {
        self.module
            .fs()
            .chdir(SIM_ROOT)
            .map_err(|e| EngineFault::new(format!("chdir {SIM_ROOT} failed: {e}")))?;
        self.module
            .invoke(&["-in".to_string(), input_file.to_string()])
    }
}

fn sim_path(name: &str) -> String {
    format!("{SIM_ROOT}/{name}")
}
