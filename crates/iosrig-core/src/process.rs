//! OS process abstraction used by [`ProcessSupervisor`](crate::supervisor::ProcessSupervisor).
//!
//! The supervisor never touches `std::process` directly. Every lifecycle
//! operation goes through the [`ProcessControl`] trait, which mirrors the
//! minimal set of things a supervisor needs from the operating system:
//! spawn, liveness, a termination request, an unconditional kill, and a
//! bounded wait.
//!
//! [`OsProcessControl`] is the production implementation built on
//! [`std::process::Child`] and, on Unix, `nix` signals.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// How often [`OsProcessControl::wait`] re-checks a child for exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Spawn description
// ---------------------------------------------------------------------------

/// Where a child's stdout or stderr goes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Redirect {
    /// Share the parent's stream.
    Inherit,
    /// Discard all output.
    #[default]
    Null,
    /// Truncate and write to a file. Missing parent directories are created
    /// by the supervisor before spawning.
    File(PathBuf),
    /// Forward each line to `tracing`, tagged with the given source label.
    Log(String),
}

impl Redirect {
    /// The file this redirect writes to, if any.
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Redirect::File(path) => Some(path),
            _ => None,
        }
    }
}

/// Everything needed to launch one external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    /// Environment overrides layered on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub stdout: Redirect,
    pub stderr: Redirect,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: BTreeMap::new(),
            stdout: Redirect::Null,
            stderr: Redirect::Null,
        }
    }

    /// Build a spec from a command line whose first token is the program.
    ///
    /// Returns `None` for an empty command.
    pub fn from_command<S: AsRef<str>>(command: &[S]) -> Option<Self> {
        let (program, rest) = command.split_first()?;
        Some(Self::new(program.as_ref()).args(rest.iter().map(|a| a.as_ref())))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdout(mut self, redirect: Redirect) -> Self {
        self.stdout = redirect;
        self
    }

    pub fn stderr(mut self, redirect: Redirect) -> Self {
        self.stderr = redirect;
        self
    }

    /// The command line as a single display string, for logging.
    pub fn display_command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ---------------------------------------------------------------------------
// ProcessControl
// ---------------------------------------------------------------------------

/// The operating-system surface a supervisor relies on.
///
/// `Handle` is an opaque reference to one spawned process. Implementations
/// must make `terminate` and `kill` harmless on a process that already exited.
pub trait ProcessControl: Send {
    type Handle: Send;

    /// Launch the process described by `spec`.
    fn spawn(&self, spec: &ProcessSpec) -> io::Result<Self::Handle>;

    fn pid(&self, handle: &Self::Handle) -> u32;

    /// Non-blocking liveness check.
    fn is_alive(&self, handle: &mut Self::Handle) -> bool;

    /// Ask the process to exit (SIGTERM on Unix).
    fn terminate(&self, handle: &mut Self::Handle) -> io::Result<()>;

    /// Kill the process unconditionally (SIGKILL on Unix).
    fn kill(&self, handle: &mut Self::Handle) -> io::Result<()>;

    /// Block up to `timeout` for the process to exit. Returns whether it did.
    fn wait(&self, handle: &mut Self::Handle, timeout: Duration) -> bool;

    /// Exit code of a finished process, if known.
    fn exit_code(&self, _handle: &mut Self::Handle) -> Option<i32> {
        None
    }
}

/// [`ProcessControl`] backed by real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessControl;

/// A spawned OS process and its exit status once reaped.
#[derive(Debug)]
pub struct OsProcess {
    child: Child,
    status: Option<ExitStatus>,
}

impl OsProcess {
    fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            self.status = match self.child.try_wait() {
                Ok(status) => status,
                Err(e) => {
                    warn!(pid = self.child.id(), error = %e, "Failed to query child status");
                    None
                }
            };
        }
        self.status
    }
}

fn stdio_for(redirect: &Redirect) -> io::Result<Stdio> {
    Ok(match redirect {
        Redirect::Inherit => Stdio::inherit(),
        Redirect::Null => Stdio::null(),
        Redirect::File(path) => Stdio::from(File::create(path)?),
        Redirect::Log(_) => Stdio::piped(),
    })
}

/// Forward every line of `stream` to tracing until the pipe closes.
fn forward_lines<R>(stream: R, source: String, is_stderr: bool)
where
    R: Read + Send + 'static,
{
    let spawned = thread::Builder::new()
        .name(format!("{source}-output"))
        .spawn(move || {
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                if is_stderr {
                    warn!(source = %source, "{line}");
                } else {
                    info!(source = %source, "{line}");
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start output forwarding thread");
    }
}

impl ProcessControl for OsProcessControl {
    type Handle = OsProcess;

    fn spawn(&self, spec: &ProcessSpec) -> io::Result<OsProcess> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(stdio_for(&spec.stdout)?)
            .stderr(stdio_for(&spec.stderr)?);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;

        if let (Redirect::Log(source), Some(out)) = (&spec.stdout, child.stdout.take()) {
            forward_lines(out, source.clone(), false);
        }
        if let (Redirect::Log(source), Some(err)) = (&spec.stderr, child.stderr.take()) {
            forward_lines(err, source.clone(), true);
        }

        Ok(OsProcess {
            child,
            status: None,
        })
    }

    fn pid(&self, handle: &OsProcess) -> u32 {
        handle.child.id()
    }

    fn is_alive(&self, handle: &mut OsProcess) -> bool {
        handle.poll_exit().is_none()
    }

    #[cfg(unix)]
    fn terminate(&self, handle: &mut OsProcess) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if handle.poll_exit().is_some() {
            return Ok(());
        }
        match kill(Pid::from_raw(handle.child.id() as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, handle: &mut OsProcess) -> io::Result<()> {
        // No termination request short of a kill on this platform.
        self.kill(handle)
    }

    fn kill(&self, handle: &mut OsProcess) -> io::Result<()> {
        if handle.poll_exit().is_some() {
            return Ok(());
        }
        match handle.child.kill() {
            Ok(()) => Ok(()),
            Err(_) if handle.poll_exit().is_some() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn wait(&self, handle: &mut OsProcess, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            if handle.poll_exit().is_some() {
                return true;
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return false;
            }
            thread::sleep(WAIT_POLL_INTERVAL.min(timeout - elapsed));
        }
    }

    fn exit_code(&self, handle: &mut OsProcess) -> Option<i32> {
        handle.poll_exit().and_then(|status| status.code())
    }
}
