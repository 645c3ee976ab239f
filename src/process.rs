//! External engine process lifecycle.
//!
//! [`ProcessHandle`] owns one child process and its three pipes. Streams are
//! handed out with the `take_*` methods so that each one ends up with exactly
//! one owner (the stdout pump, the stderr sink and the input writer).

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::stream::{TIME_FORMAT, TIME_PREFIX};

/// Grace period before a dropped process is killed.
const DROP_GRACE: Duration = Duration::from_millis(500);

// =============================================================================
// Command description
// =============================================================================

/// Everything needed to (re)start an engine process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    argv: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    time_binary: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Run the engine under the `time` wrapper at `time_binary`.
    ///
    /// The wrapper writes a [`TIME_PREFIX`]-tagged line to stderr when the
    /// engine exits.
    pub fn timed(mut self, time_binary: impl Into<PathBuf>) -> Self {
        self.time_binary = Some(time_binary.into());
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        &self.argv
    }

    pub fn is_timed(&self) -> bool {
        self.time_binary.is_some()
    }

    /// The argv actually executed, including the timing prefix.
    pub fn effective_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.argv.len() + 2);
        if let Some(time) = &self.time_binary {
            argv.push(time.to_string_lossy().into_owned());
            argv.push(format!("--format={}{}", TIME_PREFIX, TIME_FORMAT));
        }
        argv.extend(self.argv.iter().cloned());
        argv
    }

    fn to_command(&self) -> EngineResult<Command> {
        let argv = self.effective_argv();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EngineError::Config("empty engine command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        Ok(command)
    }
}

// =============================================================================
// Exit tracking
// =============================================================================

#[derive(Debug)]
struct ExitState {
    child: Option<Child>,
    code: Option<i32>,
}

#[derive(Debug)]
struct ExitShared {
    pid: u32,
    state: Mutex<ExitState>,
    exited: Condvar,
}

/// Exit status of one process run, shared by its handle, a reaper thread
/// and any number of waiters.
///
/// The child is only reaped while the state lock is held, so a kill issued
/// under that lock can never reach a recycled pid.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    shared: Arc<ExitShared>,
}

impl ExitWatch {
    fn new(child: Child) -> Self {
        Self {
            shared: Arc::new(ExitShared {
                pid: child.id(),
                state: Mutex::new(ExitState {
                    child: Some(child),
                    code: None,
                }),
                exited: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExitState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    /// Whether both watches track the same process run.
    pub fn same_process(&self, other: &ExitWatch) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Exit code if the process has exited, reaping it if needed.
    pub fn poll(&self) -> Option<i32> {
        let mut state = self.lock();
        if state.code.is_none() {
            let status = match state.child.as_mut().map(Child::try_wait) {
                Some(Ok(Some(status))) => status,
                Some(Err(e)) => {
                    warn!("Error checking engine process {}: {}", self.pid(), e);
                    return None;
                }
                _ => return None,
            };
            self.record(&mut state, exit_code(status));
        }
        state.code
    }

    /// Block until the process has exited and return its exit code.
    pub fn wait(&self) -> i32 {
        let state = self
            .shared
            .exited
            .wait_while(self.lock(), |s| s.code.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.code.unwrap_or(-1)
    }

    /// Like [`wait`](Self::wait) with a deadline; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        let (state, _) = self
            .shared
            .exited
            .wait_timeout_while(self.lock(), timeout, |s| s.code.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.code
    }

    /// Kill the process unless it already exited, reap it and wake waiters.
    fn kill(&self) -> EngineResult<i32> {
        let mut state = self.lock();
        if let Some(code) = state.code {
            return Ok(code);
        }
        let Some(child) = state.child.as_mut() else {
            return Err(EngineError::NotStarted);
        };
        if let Err(e) = child.kill() {
            // InvalidInput: the process already exited.
            if e.kind() != io::ErrorKind::InvalidInput {
                warn!("Failed to kill engine process {}: {}", self.pid(), e);
            }
        }
        let status = child.wait()?;
        debug!("Engine process {} destroyed ({})", self.pid(), status);
        let code = exit_code(status);
        self.record(&mut state, code);
        Ok(code)
    }

    fn record(&self, state: &mut ExitState, code: i32) {
        state.code = Some(code);
        state.child = None;
        self.shared.exited.notify_all();
    }

    /// Start the thread that notices a natural exit.
    fn spawn_reaper(&self) -> io::Result<()> {
        let watch = self.clone();
        thread::Builder::new()
            .name(format!("reaper-{}", self.pid()))
            .spawn(move || {
                if let Err(e) = block_until_exited(watch.pid()) {
                    debug!("Waiting on engine process {} failed: {}", watch.pid(), e);
                }
                if let Some(code) = watch.poll() {
                    debug!("Engine process {} exited with {}", watch.pid(), code);
                }
            })?;
        Ok(())
    }
}

/// Block until `pid` has exited, leaving it unreaped.
#[cfg(unix)]
fn block_until_exited(pid: u32) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data; waitid only writes into it.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn block_until_exited(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "exit notification needs a unix host",
    ))
}

// =============================================================================
// Process handle
// =============================================================================

/// An engine child process with piped standard streams.
///
/// Dropping a running handle closes its input, gives the process a short
/// grace period to exit and then kills it, so no engine outlives its owner.
#[derive(Debug)]
pub struct ProcessHandle {
    spec: CommandSpec,
    watch: Option<ExitWatch>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl ProcessHandle {
    /// A handle that is not started yet.
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            watch: None,
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Build and start a process in one step.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] if the executable cannot be started.
    pub fn spawn(spec: CommandSpec) -> EngineResult<Self> {
        let mut handle = Self::new(spec);
        handle.start()?;
        Ok(handle)
    }

    /// Start the process described by the spec.
    ///
    /// # Errors
    ///
    /// - [`EngineError::AlreadyRunning`] if a process is still alive
    /// - [`EngineError::Spawn`] if the executable cannot be started
    pub fn start(&mut self) -> EngineResult<()> {
        if let Some(pid) = self.running_pid() {
            return Err(EngineError::AlreadyRunning(pid));
        }

        let mut command = self.spec.to_command()?;
        let program = self.spec.effective_argv().join(" ");
        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            program: program.clone(),
            source,
        })?;

        info!("Started engine process {} (pid {})", program, child.id());
        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take();
        self.stderr = child.stderr.take();

        let watch = ExitWatch::new(child);
        if let Err(e) = watch.spawn_reaper() {
            self.release_streams();
            let _ = watch.kill();
            return Err(e.into());
        }
        self.watch = Some(watch);
        Ok(())
    }

    fn running_pid(&self) -> Option<u32> {
        let watch = self.watch.as_ref()?;
        watch.poll().is_none().then(|| watch.pid())
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn is_started(&self) -> bool {
        self.watch.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.watch.as_ref().map(ExitWatch::pid)
    }

    /// Whether the process has been started and not yet exited.
    pub fn is_alive(&self) -> bool {
        self.running_pid().is_some()
    }

    /// A watch on the current run, for waiting without holding the handle.
    pub fn exit_watch(&self) -> Option<ExitWatch> {
        self.watch.clone()
    }

    // ===== Stream accessors =====

    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    // ===== Termination =====

    /// Kill the process and reap it, returning its exit code.
    ///
    /// Waiters on the run's [`ExitWatch`] are woken. A second call without
    /// an intervening start fails.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotStarted`] if there is no process.
    pub fn destroy(&mut self) -> EngineResult<i32> {
        let watch = self.watch.take().ok_or(EngineError::NotStarted)?;
        self.release_streams();
        watch.kill()
    }

    /// Block until the process exits and return its exit code.
    ///
    /// The handle no longer refers to a process afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotStarted`] if there is no process.
    pub fn wait_for(&mut self) -> EngineResult<i32> {
        let watch = self.watch.as_ref().ok_or(EngineError::NotStarted)?;
        let code = watch.wait();
        self.watch = None;
        Ok(code)
    }

    /// Non-blocking variant of [`wait_for`](Self::wait_for).
    ///
    /// Returns `Some(code)` and forgets the process once it has exited.
    pub fn try_wait(&mut self) -> EngineResult<Option<i32>> {
        let watch = self.watch.as_ref().ok_or(EngineError::NotStarted)?;
        let code = watch.poll();
        if code.is_some() {
            self.watch = None;
        }
        Ok(code)
    }

    /// Destroy the process and start it again with the same command.
    ///
    /// Streams taken from the old process are not reconnected; callers must
    /// take the new ones.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotStarted`] if there is no process to restart,
    /// or a spawn error from the new start.
    pub fn restart(&mut self) -> EngineResult<()> {
        self.destroy()?;
        self.start()
    }

    fn release_streams(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let Some(watch) = self.watch.take() else {
            return;
        };
        // Closing stdin lets well-behaved engines finish on their own
        self.release_streams();

        if let Some(code) = watch.wait_timeout(DROP_GRACE) {
            debug!("Engine process {} exited with {}", watch.pid(), code);
            return;
        }
        warn!("Engine process {} did not exit, killing", watch.pid());
        if let Err(e) = watch.kill() {
            warn!("Failed to reap engine process {}: {}", watch.pid(), e);
        }
    }
}

/// Exit code of a finished process; `-1` when it was ended by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Whether `path` names an executable file.
pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::{Read, Write};

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new(["sh", "-c", script])
    }

    #[test]
    fn test_effective_argv_with_timing() {
        let spec = CommandSpec::new(["/opt/hy/bin/hyp_pd", "-"]).timed("/usr/bin/time");
        assert!(spec.is_timed());
        assert_eq!(
            spec.effective_argv(),
            vec![
                "/usr/bin/time".to_string(),
                "--format=***TIMEReal: %E\tUser: %U\tSys: %S\tCPU: %P".to_string(),
                "/opt/hy/bin/hyp_pd".to_string(),
                "-".to_string(),
            ]
        );
        assert_eq!(spec.program(), Some("/opt/hy/bin/hyp_pd"));
    }

    #[test]
    fn test_empty_command_is_config_error() {
        let result = ProcessHandle::spawn(CommandSpec::default());
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_spawn_missing_binary() {
        let result = ProcessHandle::spawn(CommandSpec::new(["/nonexistent/engine-binary"]));
        match result {
            Err(EngineError::Spawn { program, .. }) => {
                assert_eq!(program, "/nonexistent/engine-binary")
            }
            other => panic!("expected spawn error, got {:?}", other),
        }
    }

    #[test]
    fn test_destroy_before_start_fails() {
        let mut handle = ProcessHandle::new(sh("exit 0"));
        assert!(!handle.is_started());
        assert!(matches!(handle.destroy(), Err(EngineError::NotStarted)));
        assert!(matches!(handle.wait_for(), Err(EngineError::NotStarted)));
    }

    #[test]
    fn test_destroy_twice_fails() {
        let mut handle = ProcessHandle::spawn(sh("sleep 30")).unwrap();
        assert!(handle.is_alive());
        handle.destroy().unwrap();
        assert!(!handle.is_alive());
        assert!(handle.take_stdout().is_none());
        assert!(matches!(handle.destroy(), Err(EngineError::NotStarted)));
    }

    #[test]
    fn test_wait_for_returns_exit_code() {
        let mut handle = ProcessHandle::spawn(sh("exit 3")).unwrap();
        assert_eq!(handle.wait_for().unwrap(), 3);
        assert!(!handle.is_started());
    }

    #[test]
    fn test_streams_are_piped() {
        let mut handle = ProcessHandle::spawn(CommandSpec::new(["cat"])).unwrap();
        let mut stdin = handle.take_stdin().unwrap();
        let mut stdout = handle.take_stdout().unwrap();
        assert!(handle.take_stdin().is_none());

        stdin.write_all(b"(a)\n").unwrap();
        drop(stdin);

        let mut out = String::new();
        stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "(a)\n");
        assert_eq!(handle.wait_for().unwrap(), 0);
    }

    #[test]
    fn test_environment_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("echo \"$ENGINE_FLAG\"; pwd")
            .env("ENGINE_FLAG", "on")
            .working_dir(dir.path());
        let mut handle = ProcessHandle::spawn(spec).unwrap();
        let mut out = String::new();
        handle
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        handle.wait_for().unwrap();

        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("on"));
        let pwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(
            pwd.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_restart_spawns_new_process() {
        let mut handle = ProcessHandle::spawn(sh("sleep 30")).unwrap();
        let first = handle.pid().unwrap();
        handle.restart().unwrap();
        assert!(handle.is_alive());
        assert_ne!(handle.pid().unwrap(), first);
        handle.destroy().unwrap();
    }

    #[test]
    fn test_exit_watch_wakes_on_natural_exit() {
        let handle = ProcessHandle::spawn(sh("sleep 0.2; exit 5")).unwrap();
        let watch = handle.exit_watch().unwrap();
        let waiter = std::thread::spawn(move || watch.wait());
        assert_eq!(waiter.join().unwrap(), 5);
        assert!(!handle.is_alive());
    }

    #[test]
    fn test_destroy_wakes_exit_watchers() {
        let mut handle = ProcessHandle::spawn(sh("exec sleep 30")).unwrap();
        let watch = handle.exit_watch().unwrap();
        assert_eq!(watch.wait_timeout(Duration::from_millis(50)), None);

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let watch = watch.clone();
                std::thread::spawn(move || watch.wait())
            })
            .collect();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(handle.destroy().unwrap(), -1);

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), -1);
        }
        assert_eq!(watch.poll(), Some(-1));
        assert!(handle.exit_watch().is_none());
    }

    #[test]
    fn test_start_while_running_fails() {
        let mut handle = ProcessHandle::spawn(sh("sleep 30")).unwrap();
        assert!(matches!(handle.start(), Err(EngineError::AlreadyRunning(_))));
        handle.destroy().unwrap();
    }
}
