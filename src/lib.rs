//! lammps-bridge: drive a blocking LAMMPS compute module from async Rust.

pub mod bridge;
pub mod client;
pub mod engine;
pub mod worker;

/// Crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use bridge::protocol::{Command, DEFAULT_INPUT_FILE, ErrorKind, Event, RequestId, SIM_ROOT};
pub use bridge::transport::{HostEndpoint, WorkerEndpoint};
pub use client::{ClientConfig, ClientError, DEFAULT_READ_TIMEOUT, LammpsClient};
pub use engine::{
    ComputeModule, EngineCallbacks, EngineFault, FsError, LoadError, ModuleLoader, VirtualFs,
};
pub use worker::{DEFAULT_INIT_TIMEOUT, WorkerConfig, run_worker};
