//! Single-process supervision with graceful-then-forceful shutdown.
//!
//! A [`ProcessSupervisor`] owns at most one live external process at a time.
//! Stopping is escalating and bounded:
//!
//! 1. a termination request, waiting up to the graceful timeout;
//! 2. an unconditional kill, waiting up to the forceful timeout;
//! 3. if the process *still* has not exited, [`SupervisorError::ForcefulStopFailure`].
//!
//! `stop()` is idempotent. Calling it on a supervisor that never started, or
//! whose process already exited, is a no-op.
//!
//! # Example
//!
//! ```no_run
//! use iosrig_core::process::{ProcessSpec, Redirect};
//! use iosrig_core::supervisor::ProcessSupervisor;
//!
//! # fn example() -> Result<(), iosrig_core::supervisor::SupervisorError> {
//! let mut supervisor = ProcessSupervisor::new("iproxy");
//! supervisor.start(
//!     ProcessSpec::new("iproxy")
//!         .args(["8100", "8100", "DEVICE-UDID"])
//!         .stdout(Redirect::Log("iproxy".into())),
//! )?;
//! assert!(supervisor.is_alive());
//! supervisor.stop()?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::process::{OsProcessControl, ProcessControl, ProcessSpec, Redirect};

/// Default bound for each of the graceful and forceful stop phases.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by [`ProcessSupervisor`].
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The OS refused to create the process.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An output directory for a redirect could not be created.
    #[error("failed to create output directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called while the supervised process is still running.
    #[error("process {name} is already running with pid {pid}")]
    AlreadyRunning { name: String, pid: u32 },

    /// The process survived both the termination request and the kill.
    #[error("process {name} (pid {pid}) is still alive after forceful stop")]
    ForcefulStopFailure { name: String, pid: u32 },
}

/// A process owned by a supervisor.
#[derive(Debug)]
pub struct ManagedProcess<H> {
    pid: u32,
    handle: H,
    stdout: Redirect,
    stderr: Redirect,
    started_at: Instant,
}

impl<H> ManagedProcess<H> {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn stdout(&self) -> &Redirect {
        &self.stdout
    }

    pub fn stderr(&self) -> &Redirect {
        &self.stderr
    }

    /// Time since the process was spawned.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Owns zero or one external process.
pub struct ProcessSupervisor<C: ProcessControl = OsProcessControl> {
    name: String,
    control: C,
    process: Option<ManagedProcess<C::Handle>>,
}

impl ProcessSupervisor<OsProcessControl> {
    /// Create a supervisor for real OS processes. `name` is used in logs and
    /// errors.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_control(name, OsProcessControl)
    }
}

impl<C: ProcessControl> ProcessSupervisor<C> {
    pub fn with_control(name: impl Into<String>, control: C) -> Self {
        Self {
            name: name.into(),
            control,
            process: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The currently owned process, if any.
    pub fn process(&self) -> Option<&ManagedProcess<C::Handle>> {
        self.process.as_ref()
    }

    /// Pid of the owned process, if any.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    /// Spawn the process described by `spec`.
    ///
    /// Missing parent directories of file redirects are created first. A
    /// previously owned process that has already exited is released.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::AlreadyRunning`] if the owned process is still alive
    /// - [`SupervisorError::CreateDir`] if an output directory cannot be created
    /// - [`SupervisorError::Spawn`] if the OS cannot create the process
    pub fn start(
        &mut self,
        spec: ProcessSpec,
    ) -> Result<&ManagedProcess<C::Handle>, SupervisorError> {
        if let Some(pid) = self.live_pid() {
            return Err(SupervisorError::AlreadyRunning {
                name: self.name.clone(),
                pid,
            });
        }
        self.process = None;

        for path in [spec.stdout.file_path(), spec.stderr.file_path()]
            .into_iter()
            .flatten()
        {
            ensure_parent_dir(path)?;
        }

        debug!(name = %self.name, command = %spec.display_command(), "Spawning process");
        let handle = self
            .control
            .spawn(&spec)
            .map_err(|source| SupervisorError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        let pid = self.control.pid(&handle);
        info!(name = %self.name, pid, "Process started");

        Ok(self.process.insert(ManagedProcess {
            pid,
            handle,
            stdout: spec.stdout,
            stderr: spec.stderr,
            started_at: Instant::now(),
        }))
    }

    /// Non-blocking liveness query. `false` if never started.
    pub fn is_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(process) => self.control.is_alive(&mut process.handle),
            None => false,
        }
    }

    /// Exit code of the owned process once it has finished.
    pub fn exit_code(&mut self) -> Option<i32> {
        let process = self.process.as_mut()?;
        self.control.exit_code(&mut process.handle)
    }

    /// Send a termination request and wait up to `timeout` for exit.
    ///
    /// Returns whether the process has exited. `true` if nothing is running.
    pub fn stop_graceful(&mut self, timeout: Duration) -> bool {
        let Some(process) = self.process.as_mut() else {
            return true;
        };
        if let Err(e) = self.control.terminate(&mut process.handle) {
            warn!(name = %self.name, pid = process.pid, error = %e, "Termination request failed");
        }
        self.control.wait(&mut process.handle, timeout)
    }

    /// Kill unconditionally and wait up to `timeout` for exit.
    ///
    /// Returns whether the process has exited. `true` if nothing is running.
    pub fn stop_forceful(&mut self, timeout: Duration) -> bool {
        let Some(process) = self.process.as_mut() else {
            return true;
        };
        if let Err(e) = self.control.kill(&mut process.handle) {
            warn!(name = %self.name, pid = process.pid, error = %e, "Kill failed");
        }
        self.control.wait(&mut process.handle, timeout)
    }

    /// Stop with the default 30 s bound for each phase.
    pub fn stop(&mut self) -> Result<(), SupervisorError> {
        self.stop_with(DEFAULT_STOP_TIMEOUT, DEFAULT_STOP_TIMEOUT)
    }

    /// Graceful stop, escalating to a forceful stop if needed.
    ///
    /// Worst-case duration is `graceful + forceful`. The process handle is
    /// released once the process is confirmed gone.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::ForcefulStopFailure`] if the process survives both
    /// phases. The handle is kept so a later call can retry.
    pub fn stop_with(
        &mut self,
        graceful: Duration,
        forceful: Duration,
    ) -> Result<(), SupervisorError> {
        let Some(pid) = self.live_pid() else {
            self.process = None;
            return Ok(());
        };

        info!(name = %self.name, pid, "Stopping process");
        if !self.stop_graceful(graceful) {
            warn!(
                name = %self.name,
                pid,
                timeout_ms = graceful.as_millis() as u64,
                "Process did not exit after termination request, killing"
            );
            if !self.stop_forceful(forceful) {
                return Err(SupervisorError::ForcefulStopFailure {
                    name: self.name.clone(),
                    pid,
                });
            }
        }

        self.process = None;
        info!(name = %self.name, pid, "Process stopped");
        Ok(())
    }

    fn live_pid(&mut self) -> Option<u32> {
        let process = self.process.as_mut()?;
        self.control
            .is_alive(&mut process.handle)
            .then_some(process.pid)
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), SupervisorError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            std::fs::create_dir_all(dir).map_err(|source| SupervisorError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Scripted process: dies after receiving the configured signal.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum DiesOn {
        Terminate,
        Kill,
        Never,
    }

    #[derive(Debug)]
    struct FakeHandle {
        alive: bool,
        dies_on: DiesOn,
    }

    #[derive(Clone)]
    struct FakeControl {
        dies_on: DiesOn,
        fail_spawn: bool,
        terminates: Arc<AtomicU32>,
        kills: Arc<AtomicU32>,
    }

    impl FakeControl {
        fn new(dies_on: DiesOn) -> Self {
            Self {
                dies_on,
                fail_spawn: false,
                terminates: Arc::new(AtomicU32::new(0)),
                kills: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl ProcessControl for FakeControl {
        type Handle = FakeHandle;

        fn spawn(&self, _spec: &ProcessSpec) -> io::Result<FakeHandle> {
            if self.fail_spawn {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
            }
            Ok(FakeHandle {
                alive: true,
                dies_on: self.dies_on,
            })
        }

        fn pid(&self, _handle: &FakeHandle) -> u32 {
            4242
        }

        fn is_alive(&self, handle: &mut FakeHandle) -> bool {
            handle.alive
        }

        fn terminate(&self, handle: &mut FakeHandle) -> io::Result<()> {
            self.terminates.fetch_add(1, Ordering::SeqCst);
            if handle.dies_on == DiesOn::Terminate {
                handle.alive = false;
            }
            Ok(())
        }

        fn kill(&self, handle: &mut FakeHandle) -> io::Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            if handle.dies_on != DiesOn::Never {
                handle.alive = false;
            }
            Ok(())
        }

        fn wait(&self, handle: &mut FakeHandle, _timeout: Duration) -> bool {
            !handle.alive
        }
    }

    fn short() -> Duration {
        Duration::from_millis(10)
    }

    #[test]
    fn stop_before_start_is_noop() {
        let control = FakeControl::new(DiesOn::Terminate);
        let mut supervisor = ProcessSupervisor::with_control("fake", control.clone());
        assert!(!supervisor.is_alive());
        supervisor.stop().unwrap();
        assert_eq!(control.terminates.load(Ordering::SeqCst), 0);
        assert_eq!(control.kills.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn graceful_stop_skips_kill() {
        let control = FakeControl::new(DiesOn::Terminate);
        let mut supervisor = ProcessSupervisor::with_control("fake", control.clone());
        supervisor.start(ProcessSpec::new("fake")).unwrap();
        assert!(supervisor.is_alive());
        assert_eq!(supervisor.pid(), Some(4242));

        supervisor.stop_with(short(), short()).unwrap();
        assert_eq!(control.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(control.kills.load(Ordering::SeqCst), 0);
        assert!(supervisor.process().is_none());
    }

    #[test]
    fn escalates_to_kill_when_terminate_ignored() {
        let control = FakeControl::new(DiesOn::Kill);
        let mut supervisor = ProcessSupervisor::with_control("fake", control.clone());
        supervisor.start(ProcessSpec::new("fake")).unwrap();

        supervisor.stop_with(short(), short()).unwrap();
        assert_eq!(control.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(control.kills.load(Ordering::SeqCst), 1);
        assert!(!supervisor.is_alive());
    }

    #[test]
    fn unkillable_process_is_fatal() {
        let control = FakeControl::new(DiesOn::Never);
        let mut supervisor = ProcessSupervisor::with_control("stubborn", control.clone());
        supervisor.start(ProcessSpec::new("fake")).unwrap();

        let err = supervisor.stop_with(short(), short()).unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::ForcefulStopFailure { pid: 4242, .. }
        ));
        assert!(err.to_string().contains("stubborn"));
        // The handle is retained so the caller can retry.
        assert!(supervisor.is_alive());
    }

    #[test]
    fn stop_is_idempotent() {
        let control = FakeControl::new(DiesOn::Terminate);
        let mut supervisor = ProcessSupervisor::with_control("fake", control.clone());
        supervisor.start(ProcessSpec::new("fake")).unwrap();
        supervisor.stop_with(short(), short()).unwrap();
        supervisor.stop_with(short(), short()).unwrap();
        assert_eq!(control.terminates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_twice_is_rejected_while_alive() {
        let control = FakeControl::new(DiesOn::Terminate);
        let mut supervisor = ProcessSupervisor::with_control("fake", control);
        supervisor.start(ProcessSpec::new("fake")).unwrap();
        let err = supervisor.start(ProcessSpec::new("fake")).unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning { pid: 4242, .. }));
    }

    #[test]
    fn spawn_failure_is_reported() {
        let mut control = FakeControl::new(DiesOn::Terminate);
        control.fail_spawn = true;
        let mut supervisor = ProcessSupervisor::with_control("fake", control);
        let err = supervisor.start(ProcessSpec::new("missing-tool")).unwrap_err();
        match err {
            SupervisorError::Spawn { program, .. } => assert_eq!(program, "missing-tool"),
            other => panic!("expected Spawn, got: {other:?}"),
        }
        assert!(supervisor.process().is_none());
    }

    #[test]
    fn start_creates_redirect_directories() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("logs").join("nested").join("out.txt");
        let control = FakeControl::new(DiesOn::Terminate);
        let mut supervisor = ProcessSupervisor::with_control("fake", control);
        let process = supervisor
            .start(ProcessSpec::new("fake").stdout(Redirect::File(out.clone())))
            .unwrap();
        assert_eq!(process.stdout(), &Redirect::File(out.clone()));
        assert!(out.parent().unwrap().is_dir());
    }

    #[test]
    fn error_display() {
        let err = SupervisorError::Spawn {
            program: "appium".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(err.to_string(), "failed to spawn appium: not found");

        let err = SupervisorError::AlreadyRunning {
            name: "iproxy".into(),
            pid: 7,
        };
        assert_eq!(err.to_string(), "process iproxy is already running with pid 7");
    }

    #[cfg(unix)]
    mod unix_tests {
        use super::*;

        #[test]
        fn stops_real_process_gracefully() {
            let mut supervisor = ProcessSupervisor::new("sleep");
            supervisor
                .start(ProcessSpec::new("sleep").arg("30"))
                .unwrap();
            assert!(supervisor.is_alive());

            supervisor
                .stop_with(Duration::from_secs(5), Duration::from_secs(5))
                .unwrap();
            assert!(!supervisor.is_alive());
            supervisor.stop().unwrap();
        }

        #[test]
        fn ignored_sigterm_escalates_within_bound() {
            let graceful = Duration::from_millis(300);
            let forceful = Duration::from_secs(5);
            let mut supervisor = ProcessSupervisor::new("stubborn");
            supervisor
                .start(ProcessSpec::new("sh").args(["-c", "trap '' TERM; exec sleep 30"]))
                .unwrap();
            // Give the shell time to install the trap before signalling.
            std::thread::sleep(Duration::from_millis(200));

            let started = Instant::now();
            supervisor.stop_with(graceful, forceful).unwrap();
            let elapsed = started.elapsed();

            assert!(!supervisor.is_alive());
            assert!(elapsed >= graceful, "graceful phase was skipped: {elapsed:?}");
            assert!(elapsed <= graceful + forceful, "stop overran: {elapsed:?}");
        }

        #[test]
        fn exited_process_can_be_restarted() {
            let mut supervisor = ProcessSupervisor::new("true");
            supervisor.start(ProcessSpec::new("true")).unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while supervisor.is_alive() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            assert!(!supervisor.is_alive());
            assert_eq!(supervisor.exit_code(), Some(0));

            supervisor.start(ProcessSpec::new("sleep").arg("30")).unwrap();
            assert!(supervisor.is_alive());
            supervisor.stop().unwrap();
        }
    }
}
