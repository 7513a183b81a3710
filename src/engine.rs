//! Seams around the compute module.
//!
//! The bridge never links the engine directly. The worker is handed a
//! [`ModuleLoader`] and drives whatever [`ComputeModule`] it produces; the
//! traits mirror the engine's actual surface, a synchronous `main`-style
//! invoke plus a private virtual filesystem.

use std::path::Path;
use std::sync::Arc;

/// Errors from the module's virtual filesystem.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory: {path}")]
    NotFound { path: String },

    #[error("{message}")]
    Other { message: String },
}

impl FsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A failed engine invocation, reported as a value.
///
/// The engine never unwinds across the bridge; anything it would have
/// aborted with arrives here.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct EngineFault {
    pub message: String,
}

impl EngineFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Module load failures.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The module path does not point at a loadable module.
    #[error("module not found: {path}")]
    NotFound { path: String },

    /// The module was found but could not be instantiated.
    #[error("failed to instantiate module: {message}")]
    Instantiate { message: String },
}

impl LoadError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn instantiate(message: impl Into<String>) -> Self {
        Self::Instantiate {
            message: message.into(),
        }
    }
}

/// Output and termination hooks handed to the loader.
///
/// The engine calls these from its own blocking thread during load and
/// invoke; implementations must be cheap and must not block.
#[derive(Clone)]
pub struct EngineCallbacks {
    /// One line of engine stdout.
    pub print: Arc<dyn Fn(&str) + Send + Sync>,
    /// One line of engine stderr.
    pub print_err: Arc<dyn Fn(&str) + Send + Sync>,
    /// Abnormal engine termination, with the engine's reason.
    pub on_abort: Arc<dyn Fn(&str) + Send + Sync>,
    /// Engine-requested exit with a status code.
    pub on_exit: Arc<dyn Fn(i32) + Send + Sync>,
}

/// The module's private filesystem.
///
/// Paths are engine-side strings, absolute (`/sim/...`) or relative to the
/// current virtual directory.
pub trait VirtualFs {
    fn mkdir(&mut self, path: &str) -> Result<(), FsError>;
    fn write_file(&mut self, path: &str, content: &[u8]) -> Result<(), FsError>;
    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FsError>;
    fn unlink(&mut self, path: &str) -> Result<(), FsError>;
    fn chdir(&mut self, path: &str) -> Result<(), FsError>;
    fn readdir(&mut self, path: &str) -> Result<Vec<String>, FsError>;
}

/// A loaded engine instance.
pub trait ComputeModule: Send {
    /// Run the engine's `main` with the given argv, blocking until the run
    /// finishes. A fault comes back as a value, never a panic.
    fn invoke(&mut self, args: &[String]) -> Result<i32, EngineFault>;

    /// The module's private filesystem. Must not be touched while an invoke
    /// is in flight.
    fn fs(&mut self) -> &mut dyn VirtualFs;
}

/// Produces a live module from a path.
///
/// Called once per session on a blocking thread; loading a large module may
/// take seconds.
pub trait ModuleLoader: Send + Sync + 'static {
    fn load(
        &self,
        module_path: &Path,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn ComputeModule>, LoadError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory engine doubles shared by the worker and client tests.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    /// Gates block at most this long, so a test that forgets to release one
    /// fails instead of hanging the runtime.
    const GATE_LIMIT: Duration = Duration::from_secs(5);

    pub(crate) fn sink_callbacks() -> EngineCallbacks {
        EngineCallbacks {
            print: Arc::new(|_| {}),
            print_err: Arc::new(|_| {}),
            on_abort: Arc::new(|_| {}),
            on_exit: Arc::new(|_| {}),
        }
    }

    /// Callbacks that record every print line for later assertions.
    pub(crate) fn capture_callbacks() -> (
        EngineCallbacks,
        Arc<Mutex<Vec<String>>>,
        Arc<Mutex<Vec<String>>>,
    ) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let err = Arc::new(Mutex::new(Vec::new()));
        let out_sink = Arc::clone(&out);
        let err_sink = Arc::clone(&err);
        let callbacks = EngineCallbacks {
            print: Arc::new(move |line| out_sink.lock().unwrap().push(line.to_string())),
            print_err: Arc::new(move |line| err_sink.lock().unwrap().push(line.to_string())),
            on_abort: Arc::new(|_| {}),
            on_exit: Arc::new(|_| {}),
        };
        (callbacks, out, err)
    }

    /// In-memory stand-in for the module's filesystem.
    pub(crate) struct MemoryFs {
        files: HashMap<String, Vec<u8>>,
        dirs: HashSet<String>,
        cwd: String,
        mkdir_denied: bool,
    }

    impl MemoryFs {
        pub(crate) fn new() -> Self {
            Self {
                files: HashMap::new(),
                dirs: HashSet::from(["/".to_string()]),
                cwd: "/".to_string(),
                mkdir_denied: false,
            }
        }

        pub(crate) fn with_mkdir_denied(mut self) -> Self {
            self.mkdir_denied = true;
            self
        }

        fn resolve(&self, path: &str) -> String {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("{}/{}", self.cwd.trim_end_matches('/'), path)
            }
        }

        fn parent_of(path: &str) -> &str {
            match path.rfind('/') {
                Some(0) | None => "/",
                Some(i) => &path[..i],
            }
        }
    }

    impl VirtualFs for MemoryFs {
        fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
            if self.mkdir_denied {
                return Err(FsError::other(format!("mkdir denied: {path}")));
            }
            let path = self.resolve(path);
            self.dirs.insert(path);
            Ok(())
        }

        fn write_file(&mut self, path: &str, content: &[u8]) -> Result<(), FsError> {
            let path = self.resolve(path);
            if !self.dirs.contains(Self::parent_of(&path)) {
                return Err(FsError::not_found(Self::parent_of(&path)));
            }
            self.files.insert(path, content.to_vec());
            Ok(())
        }

        fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FsError> {
            let path = self.resolve(path);
            self.files
                .get(&path)
                .cloned()
                .ok_or_else(|| FsError::not_found(path))
        }

        fn unlink(&mut self, path: &str) -> Result<(), FsError> {
            let path = self.resolve(path);
            self.files
                .remove(&path)
                .map(|_| ())
                .ok_or_else(|| FsError::not_found(path))
        }

        fn chdir(&mut self, path: &str) -> Result<(), FsError> {
            let path = self.resolve(path);
            if !self.dirs.contains(&path) {
                return Err(FsError::not_found(path));
            }
            self.cwd = path;
            Ok(())
        }

        fn readdir(&mut self, path: &str) -> Result<Vec<String>, FsError> {
            let dir = self.resolve(path);
            if !self.dirs.contains(&dir) {
                return Err(FsError::not_found(dir));
            }
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            let mut entries = vec![".".to_string(), "..".to_string()];
            for name in self.files.keys() {
                if let Some(rest) = name.strip_prefix(&prefix)
                    && !rest.contains('/')
                {
                    entries.push(rest.to_string());
                }
            }
            entries.sort();
            Ok(entries)
        }
    }

    /// Scripted engine: reads the `-in` input, prints its lines, then
    /// finishes however the builder configured it.
    pub(crate) struct StubModule {
        fs: MemoryFs,
        callbacks: EngineCallbacks,
        behavior: Behavior,
        gate: Option<Receiver<()>>,
        invocations: Arc<Mutex<Vec<Vec<String>>>>,
    }

    #[derive(Clone)]
    enum Behavior {
        Exit(i32),
        Fault(String),
        Abort(String),
        Panic,
    }

    impl ComputeModule for StubModule {
        fn invoke(&mut self, args: &[String]) -> Result<i32, EngineFault> {
            self.invocations.lock().unwrap().push(args.to_vec());

            if let Some(gate) = &self.gate {
                let _ = gate.recv_timeout(GATE_LIMIT);
            }

            let code = match &self.behavior {
                Behavior::Panic => panic!("engine blew up"),
                Behavior::Abort(what) => {
                    (self.callbacks.on_abort)(what);
                    return Err(EngineFault::new(format!("aborted({what})")));
                }
                Behavior::Fault(message) => return Err(EngineFault::new(message.clone())),
                Behavior::Exit(code) => *code,
            };

            let input = args
                .iter()
                .position(|a| a == "-in")
                .and_then(|i| args.get(i + 1));
            match input {
                Some(file) => match self.fs.read_file(file) {
                    Ok(content) => {
                        for line in String::from_utf8_lossy(&content).lines() {
                            (self.callbacks.print)(line);
                        }
                    }
                    Err(e) => {
                        (self.callbacks.print_err)(&format!("cannot open input script: {e}"));
                        return Ok(1);
                    }
                },
                None => (self.callbacks.print_err)("no input script given"),
            }

            (self.callbacks.on_exit)(code);
            Ok(code)
        }

        fn fs(&mut self) -> &mut dyn VirtualFs {
            &mut self.fs
        }
    }

    /// Builder-style loader producing [`StubModule`]s.
    pub(crate) struct StubLoader {
        behavior: Behavior,
        load_error: Option<String>,
        mkdir_denied: bool,
        invoke_gate: Mutex<Option<Receiver<()>>>,
        load_gate: Mutex<Option<Receiver<()>>>,
        pub(crate) loads: Arc<Mutex<Vec<PathBuf>>>,
        pub(crate) invocations: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl StubLoader {
        pub(crate) fn new() -> Self {
            Self {
                behavior: Behavior::Exit(0),
                load_error: None,
                mkdir_denied: false,
                invoke_gate: Mutex::new(None),
                load_gate: Mutex::new(None),
                loads: Arc::new(Mutex::new(Vec::new())),
                invocations: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn with_exit_code(mut self, code: i32) -> Self {
            self.behavior = Behavior::Exit(code);
            self
        }

        pub(crate) fn with_fault(mut self, message: impl Into<String>) -> Self {
            self.behavior = Behavior::Fault(message.into());
            self
        }

        pub(crate) fn with_abort(mut self, what: impl Into<String>) -> Self {
            self.behavior = Behavior::Abort(what.into());
            self
        }

        pub(crate) fn with_panic(mut self) -> Self {
            self.behavior = Behavior::Panic;
            self
        }

        pub(crate) fn with_load_error(mut self, message: impl Into<String>) -> Self {
            self.load_error = Some(message.into());
            self
        }

        pub(crate) fn with_mkdir_denied(mut self) -> Self {
            self.mkdir_denied = true;
            self
        }

        /// The first invoke blocks until the receiver yields (or 5 s pass).
        pub(crate) fn with_invoke_gate(self, gate: Receiver<()>) -> Self {
            *self.invoke_gate.lock().unwrap() = Some(gate);
            self
        }

        /// The load blocks until the receiver yields (or 5 s pass).
        pub(crate) fn with_load_gate(self, gate: Receiver<()>) -> Self {
            *self.load_gate.lock().unwrap() = Some(gate);
            self
        }
    }

    impl ModuleLoader for StubLoader {
        fn load(
            &self,
            module_path: &Path,
            callbacks: EngineCallbacks,
        ) -> Result<Box<dyn ComputeModule>, LoadError> {
            self.loads.lock().unwrap().push(module_path.to_path_buf());

            if let Some(gate) = self.load_gate.lock().unwrap().take() {
                let _ = gate.recv_timeout(GATE_LIMIT);
            }
            if let Some(message) = &self.load_error {
                return Err(LoadError::instantiate(message.clone()));
            }

            let mut fs = MemoryFs::new();
            if self.mkdir_denied {
                fs = fs.with_mkdir_denied();
            }
            Ok(Box::new(StubModule {
                fs,
                callbacks,
                behavior: self.behavior.clone(),
                gate: self.invoke_gate.lock().unwrap().take(),
                invocations: Arc::clone(&self.invocations),
            }))
        }
    }

    mod tests {
        use super::*;

        #[test]
        fn memory_fs_write_read_unlink() {
            let mut fs = MemoryFs::new();
            fs.mkdir("/sim").unwrap();
            fs.write_file("/sim/a.txt", b"hello").unwrap();
            assert_eq!(fs.read_file("/sim/a.txt").unwrap(), b"hello");

            fs.unlink("/sim/a.txt").unwrap();
            assert!(fs.read_file("/sim/a.txt").unwrap_err().is_not_found());
            assert!(fs.unlink("/sim/a.txt").unwrap_err().is_not_found());
        }

        #[test]
        fn memory_fs_resolves_against_cwd() {
            let mut fs = MemoryFs::new();
            fs.mkdir("/sim").unwrap();
            fs.write_file("/sim/in.lmp", b"x").unwrap();
            fs.chdir("/sim").unwrap();
            assert_eq!(fs.read_file("in.lmp").unwrap(), b"x");
        }

        #[test]
        fn memory_fs_readdir_lists_dot_entries_and_files() {
            let mut fs = MemoryFs::new();
            fs.mkdir("/sim").unwrap();
            fs.write_file("/sim/a", b"").unwrap();
            fs.write_file("/sim/b", b"").unwrap();
            assert_eq!(fs.readdir("/sim").unwrap(), vec![".", "..", "a", "b"]);
        }

        #[test]
        fn stub_module_prints_input_lines() {
            let (callbacks, out, _err) = capture_callbacks();
            let loader = StubLoader::new();
            let mut module = loader.load(Path::new("/lmp.wasm"), callbacks).unwrap();

            module.fs().mkdir("/sim").unwrap();
            module.fs().write_file("/sim/input.lmp", b"units lj\nrun 0\n").unwrap();
            module.fs().chdir("/sim").unwrap();

            let code = module
                .invoke(&["-in".to_string(), "input.lmp".to_string()])
                .unwrap();
            assert_eq!(code, 0);
            assert_eq!(*out.lock().unwrap(), vec!["units lj", "run 0"]);
        }

        #[test]
        fn stub_module_reports_missing_input_on_stderr() {
            let (callbacks, _out, err) = capture_callbacks();
            let loader = StubLoader::new();
            let mut module = loader.load(Path::new("/lmp.wasm"), callbacks).unwrap();
            module.fs().mkdir("/sim").unwrap();
            module.fs().chdir("/sim").unwrap();

            let code = module
                .invoke(&["-in".to_string(), "missing.lmp".to_string()])
                .unwrap();
            assert_eq!(code, 1);
            assert_eq!(err.lock().unwrap().len(), 1);
        }
    }
}
