//! Node process launcher and supervision.

use courier_types::SetupError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Default wait between SIGTERM and a forced kill.
pub const DEFAULT_GRACE_MS: u64 = 3000;

/// How to build and start an overlay node executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLauncher {
    /// Directory the node is built and run from.
    pub work_dir: PathBuf,
    /// Runtime that must be on `PATH` (checked before anything else runs).
    pub runtime: Option<String>,
    /// Blocking build/dependency step, run once per start. Empty to skip.
    pub fetch_command: Vec<String>,
    /// Executable to spawn. Relative paths resolve against `work_dir` when
    /// such a file exists there, otherwise through `PATH`.
    pub program: PathBuf,
    /// Arguments placed before the env file path.
    pub args: Vec<String>,
}

impl NodeLauncher {
    /// The Go libp2p node: `go build` in `work_dir`, then `./libp2p_node`.
    pub fn libp2p(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            runtime: Some("go".to_string()),
            fetch_command: vec!["go".to_string(), "build".to_string()],
            program: PathBuf::from("libp2p_node"),
            args: Vec::new(),
        }
    }

    /// An already-built node executable with no runtime or build step.
    pub fn prebuilt(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let work_dir = program
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            work_dir,
            runtime: None,
            fetch_command: Vec::new(),
            program,
            args: Vec::new(),
        }
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    pub fn with_fetch_command(mut self, command: Vec<String>) -> Self {
        self.fetch_command = command;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Fail fast if the runtime is missing from `PATH`.
    pub fn check_runtime(&self) -> Result<(), SetupError> {
        let Some(runtime) = &self.runtime else {
            return Ok(());
        };
        match which::which(runtime) {
            Ok(path) => {
                debug!(runtime = %runtime, path = %path.display(), "Found node runtime");
                Ok(())
            }
            Err(_) => Err(SetupError::RuntimeNotInstalled {
                runtime: runtime.clone(),
                hint: runtime_hint(runtime),
            }),
        }
    }

    fn resolved_program(&self) -> PathBuf {
        if self.program.is_relative() {
            let local = self.work_dir.join(&self.program);
            if local.is_file() {
                return local;
            }
        }
        self.program.clone()
    }

    /// Run the build/dependency step.
    ///
    /// This blocks the calling thread until the command finishes. It runs
    /// once per `connect()`, before any pipe or process exists.
    pub fn fetch_dependencies(&self, log: &File) -> Result<(), SetupError> {
        let Some((program, args)) = self.fetch_command.split_first() else {
            return Ok(());
        };
        info!(command = %self.fetch_command.join(" "), dir = %self.work_dir.display(), "Fetching node dependencies");
        let stdout = log
            .try_clone()
            .map_err(|e| SetupError::StartupFiles(e.to_string()))?;
        let stderr = log
            .try_clone()
            .map_err(|e| SetupError::StartupFiles(e.to_string()))?;
        let status = std::process::Command::new(program)
            .args(args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .map_err(|e| SetupError::DependencyFetch(format!("cannot run '{program}': {e}")))?;
        if !status.success() {
            return Err(SetupError::DependencyFetch(format!(
                "'{}' exited with {status}",
                self.fetch_command.join(" ")
            )));
        }
        Ok(())
    }

    /// Spawn the node with `env_file` as its last argument and `vars` in its
    /// environment. Output goes to `log`.
    pub fn spawn(
        &self,
        env_file: &Path,
        vars: &[(&'static str, String)],
        log: &File,
    ) -> Result<Child, SetupError> {
        let program = self.resolved_program();
        let spawn_err = |reason: String| SetupError::Spawn {
            program: program.display().to_string(),
            reason,
        };
        let stdout = log.try_clone().map_err(|e| spawn_err(e.to_string()))?;
        let stderr = log.try_clone().map_err(|e| spawn_err(e.to_string()))?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.args)
            .arg(env_file)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        for (key, value) in vars {
            cmd.env(key, value);
        }
        let child = cmd.spawn().map_err(|e| spawn_err(e.to_string()))?;
        info!(program = %program.display(), pid = ?child.id(), "Started node process");
        Ok(child)
    }
}

fn runtime_hint(runtime: &str) -> String {
    match runtime {
        "go" => "Install Go from https://go.dev/doc/install and make sure `go` is on PATH.".into(),
        other => format!("Install '{other}' and make sure it is on PATH."),
    }
}

/// Stop a child: SIGTERM, wait up to `grace`, then kill.
///
/// A child that already exited is only reaped. Errors are logged, never
/// returned, so this is safe on any cleanup path.
pub async fn terminate(child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(%status, "Node process already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => debug!(error = %e, "Could not poll node process"),
    }

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM failed");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(pid, %status, "Node process stopped"),
        Ok(Err(e)) => debug!(pid, error = %e, "Wait on node process failed"),
        Err(_) => {
            warn!(pid, grace_ms = grace.as_millis() as u64, "Node ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                debug!(pid, error = %e, "Kill failed");
            }
        }
    }
}

/// Open the node log in append mode, creating parent directories.
pub fn open_log(path: &Path) -> Result<File, SetupError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| SetupError::StartupFiles(format!("{}: {e}", parent.display())))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SetupError::StartupFiles(format!("{}: {e}", path.display())))
}
