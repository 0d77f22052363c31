//! Command execution inside the sandbox namespaces.
//!
//! # Process layout
//!
//! ```text
//! cowrun (caller)
//!   └─ holder      new user/mount namespaces; builds layers and /dev,
//!                  then unshares the PID namespace
//!        └─ command  PID 1 of the new PID namespace; mounts /proc,
//!                    chroots into the merged root, execs the shell
//! ```
//!
//! The holder owns every mount of the run and removes them again before it
//! reports back, so the workspace is valid again once the caller reads the
//! report. The report travels as JSON over a socket pair. Forked processes
//! never unwind into the caller's stack: they leave through `_exit`.
//!
//! No new session or process group is created: the command stays in the
//! terminal's foreground group and receives keyboard signals itself. The
//! caller and the holder only act on `SIGTERM` and `SIGHUP`, which they turn
//! into killing the command.

#![allow(unsafe_code)]

use std::ffi::{CString, OsString};
use std::fs::{self, File};
use std::io::{self, IsTerminal};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::symlink;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{SigHandler, Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, chdir, chroot, execve, fork};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use super::host::{HostOps, NamespaceOptions};
use super::layers::{LayerBuilder, LayerReport, MountPoint};
use crate::error::{Error, ExecError, WorkspaceError};
use crate::signal;
use crate::workspace::WorkspacePaths;

/// Host devices bind-mounted into the sandbox's `/dev`.
pub const DEVICES: &[&str] = &["tty", "null", "zero", "full", "random", "urandom"];

/// Symlinks created in the sandbox's `/dev`.
pub const FD_LINKS: &[(&str, &str)] = &[
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
    ("fd", "/proc/self/fd"),
];

/// Exit status when the command process fails before `exec`.
const EXIT_SETUP_FAILED: i32 = 126;

/// Exit status when the shell cannot be executed.
const EXIT_EXEC_FAILED: i32 = 127;

/// What to run in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Shell executable (absolute path).
    pub shell: PathBuf,
    /// Script passed to `shell -c`; `None` starts an interactive shell.
    pub script: Option<String>,
    /// Working directory inside the sandbox.
    pub working_dir: PathBuf,
    /// Environment of the command. Values are arbitrary bytes.
    pub env: Vec<(OsString, OsString)>,
    pub namespaces: NamespaceOptions,
}

impl ExecutionRequest {
    /// Creates a request for an interactive `shell` started in `working_dir`.
    #[must_use]
    pub fn new(shell: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            script: None,
            working_dir: working_dir.into(),
            env: Vec::new(),
            namespaces: NamespaceOptions::default(),
        }
    }

    /// Runs `words` joined by spaces as `shell -c`.
    #[must_use]
    pub fn with_command<S: AsRef<str>>(mut self, words: &[S]) -> Self {
        let script = words
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(" ");
        self.script = Some(script);
        self
    }

    #[must_use]
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    #[must_use]
    pub fn with_network_isolation(mut self, isolate: bool) -> Self {
        self.namespaces.isolate_network = isolate;
        self
    }

    /// The shell's argument vector.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.shell.to_string_lossy().into_owned()];
        if let Some(script) = &self.script {
            argv.push("-c".to_string());
            argv.push(script.clone());
        }
        argv
    }

    /// Writes the request as JSON.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), WorkspaceError> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| WorkspaceError::IoError {
            context: "failed to serialize execution request".to_string(),
            source: e.into(),
        })?;
        fs::write(path, json).map_err(|e| WorkspaceError::IoError {
            context: format!("failed to write {}", path.display()),
            source: e,
        })
    }
}

/// Outcome of a sandboxed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit status of the command; `128 + N` if killed by signal N.
    pub exit_code: i32,
    /// Mount points that could not be overlaid.
    pub degraded: Vec<PathBuf>,
    /// Termination signal that stopped the run, if any.
    pub interrupted: Option<i32>,
}

/// Holder-to-caller message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum HolderReport {
    Finished {
        exit_code: i32,
        degraded: Vec<PathBuf>,
        interrupted: Option<i32>,
    },
    Failed {
        message: String,
    },
}

/// Device targets and fd symlinks placed in the sandbox's `/dev`.
#[derive(Debug, Default)]
pub struct DeviceSet {
    mounted: Vec<PathBuf>,
    created: Vec<PathBuf>,
}

impl DeviceSet {
    /// Bind-mounts the host devices and creates the fd symlinks below
    /// `merged/dev`. Devices the host lacks (no controlling terminal, for
    /// instance) are skipped with a warning.
    pub fn populate<H: HostOps + ?Sized>(host: &H, merged: &Path) -> Self {
        let dev = merged.join("dev");
        let mut set = Self::default();

        if let Err(e) = fs::create_dir_all(&dev) {
            warn!(error = %e, "Failed to create sandbox /dev");
            return set;
        }

        for name in DEVICES {
            let target = dev.join(name);
            if let Err(e) = File::create(&target) {
                warn!(device = name, error = %e, "Failed to create device target");
                continue;
            }
            set.created.push(target.clone());

            match host.bind_mount(&Path::new("/dev").join(name), &target) {
                Ok(()) => set.mounted.push(target),
                Err(e) => warn!(device = name, error = %e, "Device not available in sandbox"),
            }
        }

        for (name, destination) in FD_LINKS {
            let link = dev.join(name);
            match symlink(destination, &link) {
                Ok(()) => set.created.push(link),
                Err(e) => warn!(link = name, error = %e, "Failed to create fd symlink"),
            }
        }

        trace!(mounted = set.mounted.len(), "Devices populated");
        set
    }

    /// Unmounts the devices and removes every created entry.
    pub fn remove<H: HostOps + ?Sized>(self, host: &H) {
        for target in self.mounted.iter().rev() {
            if let Err(e) = host.unmount(target) {
                warn!(error = %e, "Failed to unmount device");
            }
        }
        for entry in &self.created {
            if let Err(e) = fs::remove_file(entry) {
                warn!(entry = %entry.display(), error = %e, "Failed to remove device entry");
            }
        }
    }
}

/// What the holder mounted and created for one run.
#[derive(Debug)]
struct Sandbox {
    layers: LayerReport,
    devices: DeviceSet,
    proc_dir: PathBuf,
}

/// Runs commands against a workspace's layered root.
pub struct IsolationExecutor<'a, H: HostOps + ?Sized> {
    host: &'a H,
    paths: &'a WorkspacePaths,
    layers: LayerBuilder<'a, H>,
}

impl<'a, H: HostOps + ?Sized> IsolationExecutor<'a, H> {
    #[must_use]
    pub fn new(host: &'a H, paths: &'a WorkspacePaths, layers: LayerBuilder<'a, H>) -> Self {
        Self {
            host,
            paths,
            layers,
        }
    }

    /// Builds the sandbox, runs the request in it and tears it down again.
    ///
    /// The command's own failure is reported through `exit_code`, never as
    /// an error.
    ///
    /// # Errors
    ///
    /// - `ExecError::NamespaceCreation` if the namespaces cannot be created
    /// - `ExecError::Setup` if the layers cannot be built
    /// - `ExecError::Process`/`ExecError::Report` if supervision fails
    #[instrument(skip_all, fields(workspace = %self.paths.root.display(), shell = %request.shell.display()))]
    pub fn run(
        &self,
        mountpoints: &[MountPoint],
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, Error> {
        request.save(&self.paths.request_file)?;

        let (mut ours, theirs) = UnixStream::pair()
            .map_err(|e| ExecError::Process(format!("socketpair: {e}")))?;

        // SAFETY: the process is single-threaded; the child runs the holder
        // and leaves through `_exit` without returning into the caller.
        match unsafe { fork() }.map_err(|e| ExecError::Process(format!("fork(holder): {e}")))? {
            ForkResult::Child => {
                drop(ours);
                let report = panic::catch_unwind(AssertUnwindSafe(|| self.hold(mountpoints, request)))
                    .unwrap_or_else(|_| HolderReport::Failed {
                        message: "sandbox holder panicked".to_string(),
                    });
                let code = match serde_json::to_writer(&theirs, &report) {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                exit_child(code)
            }
            ForkResult::Parent { child } => {
                drop(theirs);
                debug!(holder = %child, "Holder started");

                let (status, interrupted) = wait_forwarding(child, Signal::SIGTERM)?;
                reclaim_foreground();
                trace!(?status, "Holder exited");

                let report: HolderReport = serde_json::from_reader(&mut ours)
                    .map_err(|e| ExecError::Report(format!("{e} (holder {status:?})")))?;

                match report {
                    HolderReport::Finished {
                        exit_code,
                        degraded,
                        interrupted: holder_interrupted,
                    } => Ok(ExecutionResult {
                        exit_code,
                        degraded,
                        interrupted: interrupted.map(|s| s as i32).or(holder_interrupted),
                    }),
                    HolderReport::Failed { message } => Err(classify_failure(message)),
                }
            }
        }
    }

    /// Body of the holder process.
    fn hold(&self, mountpoints: &[MountPoint], request: &ExecutionRequest) -> HolderReport {
        let sandbox = match self.prepare(mountpoints, request) {
            Ok(sandbox) => sandbox,
            Err(message) => return HolderReport::Failed { message },
        };

        let outcome = self.spawn_command(request);
        let degraded = self.release(sandbox, outcome.is_ok());

        match outcome {
            Ok((exit_code, interrupted)) => HolderReport::Finished {
                exit_code,
                degraded,
                interrupted: interrupted.map(|s| s as i32),
            },
            Err(e) => HolderReport::Failed {
                message: e.to_string(),
            },
        }
    }

    /// Enters the namespaces and puts layers, devices and the `/proc` target
    /// in place. The PID namespace comes last, after every helper process the
    /// layers needed, so the command is the first process forked into it.
    fn prepare(&self, mountpoints: &[MountPoint], request: &ExecutionRequest) -> Result<Sandbox, String> {
        self.host
            .enter_namespaces(&request.namespaces)
            .map_err(|e| format!("namespaces: {e}"))?;

        let layers = self.layers.build(mountpoints).map_err(|e| e.to_string())?;
        let sandbox = Sandbox {
            layers,
            devices: DeviceSet::populate(self.host, &self.paths.merged),
            proc_dir: self.paths.merged.join("proc"),
        };

        let ready = fs::create_dir_all(&sandbox.proc_dir)
            .map_err(|e| format!("{}: {e}", sandbox.proc_dir.display()))
            .and_then(|()| {
                self.host
                    .enter_pid_namespace()
                    .map_err(|e| format!("namespaces: {e}"))
            });
        match ready {
            Ok(()) => Ok(sandbox),
            Err(message) => {
                self.release(sandbox, false);
                Err(message)
            }
        }
    }

    /// Removes everything `prepare` put in place and returns the degraded
    /// mount points. `/proc` is only mounted once the command has started.
    fn release(&self, sandbox: Sandbox, command_started: bool) -> Vec<PathBuf> {
        if command_started {
            if let Err(e) = self.host.unmount(&sandbox.proc_dir) {
                debug!(error = %e, "procfs was not mounted");
            }
        }
        sandbox.devices.remove(self.host);
        if let Err(e) = self.layers.teardown(&sandbox.layers) {
            warn!(error = %e, "Layer teardown incomplete");
        }
        sandbox.layers.degraded
    }

    /// Forks the command process and waits for it.
    fn spawn_command(&self, request: &ExecutionRequest) -> Result<(i32, Option<Signal>), ExecError> {
        // SAFETY: as in `run`; the child either execs or leaves through `_exit`.
        match unsafe { fork() }.map_err(|e| ExecError::Process(format!("fork(command): {e}")))? {
            ForkResult::Child => {
                let code = panic::catch_unwind(AssertUnwindSafe(|| self.exec_command(request)))
                    .unwrap_or(EXIT_SETUP_FAILED);
                exit_child(code)
            }
            ForkResult::Parent { child } => {
                debug!(command = %child, "Command started");
                let (status, interrupted) = wait_forwarding(child, Signal::SIGKILL)?;
                Ok((exit_code_of(status), interrupted))
            }
        }
    }

    /// Body of the command process. Returns only if `exec` was not reached.
    fn exec_command(&self, request: &ExecutionRequest) -> i32 {
        if let Err(e) = self.host.mount_proc(&self.paths.merged.join("proc")) {
            warn!(error = %e, "Failed to mount /proc in sandbox");
            return EXIT_SETUP_FAILED;
        }
        if let Err(e) = chroot(&self.paths.merged) {
            warn!(error = %e, "Failed to enter sandbox root");
            return EXIT_SETUP_FAILED;
        }
        if chdir(&request.working_dir).is_err() {
            warn!(
                dir = %request.working_dir.display(),
                "Working directory not available in sandbox, starting in /"
            );
            if let Err(e) = chdir("/") {
                warn!(error = %e, "Failed to change to /");
                return EXIT_SETUP_FAILED;
            }
        }

        let Some((shell, argv, env)) = exec_arguments(request) else {
            warn!("Command contains a NUL byte");
            return EXIT_SETUP_FAILED;
        };

        match execve(&shell, &argv, &env) {
            Ok(never) => match never {},
            Err(e) => {
                warn!(shell = %request.shell.display(), error = %e, "Failed to execute shell");
                EXIT_EXEC_FAILED
            }
        }
    }
}

fn exec_arguments(request: &ExecutionRequest) -> Option<(CString, Vec<CString>, Vec<CString>)> {
    let shell = CString::new(request.shell.as_os_str().as_bytes()).ok()?;
    let argv = request
        .argv()
        .into_iter()
        .map(CString::new)
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    let env = request
        .env
        .iter()
        .map(|(k, v)| {
            let mut entry = Vec::with_capacity(k.len() + v.len() + 1);
            entry.extend_from_slice(k.as_bytes());
            entry.push(b'=');
            entry.extend_from_slice(v.as_bytes());
            CString::new(entry)
        })
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    Some((shell, argv, env))
}

/// Waits for `child`, sending it `forward` when a termination signal arrives.
///
/// Returns the final status and the first termination signal seen.
fn wait_forwarding(child: Pid, forward: Signal) -> Result<(WaitStatus, Option<Signal>), ExecError> {
    let mut interrupted = None;

    loop {
        match waitpid(child, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                return Ok((status, interrupted));
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => {
                let Some(sig) = signal::take() else { continue };
                if signal::is_termination(sig) {
                    debug!(signal = %sig, %child, "Stopping sandboxed process");
                    interrupted.get_or_insert(sig);
                    if let Err(e) = kill(child, forward) {
                        warn!(error = %e, "Failed to signal sandboxed process");
                    }
                } else {
                    trace!(signal = %sig, "Signal left to the command");
                }
            }
            Err(e) => return Err(ExecError::Process(format!("waitpid: {e}"))),
        }
    }
}

/// Maps a wait status to a shell-style exit code.
#[must_use]
pub fn exit_code_of(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        _ => 1,
    }
}

fn classify_failure(message: String) -> Error {
    if message.starts_with("namespaces: ") {
        ExecError::NamespaceCreation(message).into()
    } else {
        ExecError::Setup(message).into()
    }
}

/// Takes the terminal's foreground back for the caller's process group.
///
/// An interactive shell in the sandbox may have moved the foreground to its
/// own job; without this the caller would be stopped on the next read.
fn reclaim_foreground() {
    if !io::stdin().is_terminal() {
        return;
    }

    // SAFETY: SIGTTOU is ignored only around the tcsetpgrp call and restored
    // afterwards; tcsetpgrp/getpgrp take no pointers.
    unsafe {
        let previous = nix::sys::signal::signal(Signal::SIGTTOU, SigHandler::SigIgn);
        if libc::tcsetpgrp(libc::STDIN_FILENO, libc::getpgrp()) != 0 {
            trace!(error = %io::Error::last_os_error(), "tcsetpgrp failed");
        }
        if let Ok(previous) = previous {
            let _ = nix::sys::signal::signal(Signal::SIGTTOU, previous);
        }
    }
}

fn exit_child(code: i32) -> ! {
    // SAFETY: `_exit` skips atexit handlers and stdio flushing that belong to
    // the parent process.
    unsafe { libc::_exit(code) }
}
