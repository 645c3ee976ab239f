//! The engine façade.
//!
//! An [`Engine`] owns one external process (or one socket in client mode)
//! together with its stdout pump and stderr sink, and offers two ways of
//! talking to it:
//!
//! - **One-shot**: [`Engine::eval`] writes a program followed by the echo
//!   directive and returns a [`LineSink`] that fills until the delimiter comes
//!   back. Replies are read with `next_line`/`next_tuple` or all at once.
//! - **Batched**: [`Engine::enqueue`] collects `(id, program)` pairs and
//!   [`Engine::execute_queue`] pipelines them, returning [`QueryResults`].
//!
//! Sends are serialised per engine: a new send waits until the previous
//! reply is complete before it writes, so replies never interleave.
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::new(Flavor::pdatalog()?, EngineConfig::discover()?);
//! engine.start()?;
//! engine.enqueue("q1", "?- retrieve(D, Q).")?;
//! let results = engine.execute_queue()?;
//! for tuple in results.get("q1") {
//!     println!("{}", tuple);
//! }
//! ```

mod flavor;
mod queue;

pub use flavor::{
    ArgvBuilder, CommandBuilder, Delimiter, EchoStyle, Flavor, CLIENT_END_TOKEN,
    DEFAULT_END_TOKEN,
};
pub use queue::{demultiplex, Query, QueryQueue, QueryResults};

use std::fmt;
use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::process::ProcessHandle;
use crate::stream::{ErrorSink, ErrorSinkOptions, LineSink, StreamPump, TimingReport};
use crate::tuple::Tuple;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where the engine's bytes go.
#[derive(Debug)]
enum Endpoint {
    /// A child process started by this engine.
    Local,
    /// An engine server reached over TCP.
    Remote(TcpStream),
}

/// Everything bound to one run of the process.
#[derive(Debug, Default)]
struct Session {
    process: Option<ProcessHandle>,
    pump: Option<StreamPump>,
    errors: Option<Arc<ErrorSink>>,
    current: Option<LineSink>,
    stdin_closed: bool,
    last_exit: Option<i32>,
}

/// A running (or startable) external engine.
///
/// All methods take `&self`; share an engine between threads with `Arc`.
pub struct Engine {
    flavor: Flavor,
    config: EngineConfig,
    endpoint: Endpoint,
    /// Serialises complete send cycles (wait, submit, write).
    send_lock: Mutex<()>,
    input: Mutex<Option<Box<dyn Write + Send>>>,
    session: Mutex<Session>,
    queue: Mutex<QueryQueue>,
}

impl Engine {
    /// An engine that is not started yet.
    pub fn new(flavor: Flavor, config: EngineConfig) -> Self {
        Self::with_endpoint(flavor, config, Endpoint::Local)
    }

    fn with_endpoint(flavor: Flavor, config: EngineConfig, endpoint: Endpoint) -> Self {
        Self {
            flavor,
            config,
            endpoint,
            send_lock: Mutex::new(()),
            input: Mutex::new(None),
            session: Mutex::new(Session::default()),
            queue: Mutex::new(QueryQueue::new()),
        }
    }

    /// Connect to an engine server (client mode).
    ///
    /// The server ends every reply with [`CLIENT_END_TOKEN`], so the flavour's
    /// delimiter is re-tokenised. Lifecycle operations become no-ops.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the connection fails.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        flavor: Flavor,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let stream = TcpStream::connect(addr)?;
        let peer = stream.peer_addr()?;
        let client_delimiter = flavor
            .delimiter()
            .map(|d| d.with_token(CLIENT_END_TOKEN))
            .transpose()?;
        let flavor = match client_delimiter {
            Some(delimiter) => flavor.with_delimiter(delimiter),
            None => flavor,
        };

        let pump = StreamPump::spawn(flavor.name(), stream.try_clone()?)?;
        let writer: Box<dyn Write + Send> = Box::new(stream.try_clone()?);
        info!("Connected to {} server at {}", flavor.name(), peer);

        let engine = Self::with_endpoint(flavor, config, Endpoint::Remote(stream));
        lock(&engine.session).pump = Some(pump);
        *lock(&engine.input) = Some(writer);
        Ok(engine)
    }

    pub fn name(&self) -> &str {
        self.flavor.name()
    }

    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_client_mode(&self) -> bool {
        matches!(self.endpoint, Endpoint::Remote(_))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the engine process with fresh stdout and stderr readers.
    ///
    /// # Errors
    ///
    /// - [`EngineError::AlreadyRunning`] if the process is still alive
    /// - [`EngineError::Spawn`] if the executable cannot be started
    pub fn start(&self) -> EngineResult<()> {
        if self.is_client_mode() {
            return Ok(());
        }

        let mut session = lock(&self.session);
        if let Some(process) = session.process.as_ref() {
            if process.is_alive() {
                let pid = process.pid().unwrap_or_default();
                return Err(EngineError::AlreadyRunning(pid));
            }
        }

        let argv = self.flavor.build_command(&self.config);
        let mut process = ProcessHandle::spawn(self.config.command_spec(argv))?;
        let stdin = process.take_stdin();
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            return Err(EngineError::IllegalState(
                "engine streams were not captured".to_string(),
            ));
        };

        let pump = StreamPump::spawn(self.name(), stdout)?;
        let errors = ErrorSink::spawn(
            stderr,
            ErrorSinkOptions {
                engine_name: self.name().to_string(),
                capture_timing: self.config.take_time,
                echo: !self.config.suppress_stderr,
                tail_capacity: self.config.stderr_tail,
            },
        )?;

        if let Some(stale) = session.current.take() {
            stale.abort();
        }
        *session = Session {
            process: Some(process),
            pump: Some(pump),
            errors: Some(Arc::new(errors)),
            current: None,
            stdin_closed: false,
            last_exit: None,
        };
        *lock(&self.input) = Some(Box::new(stdin));
        Ok(())
    }

    /// Kill the engine process.
    ///
    /// A reply still being read is finished with whatever arrived so far, so
    /// no waiter hangs on a dead stream.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotStarted`] if there is no process, including
    /// on a second call without an intervening start.
    pub fn destroy(&self) -> EngineResult<()> {
        if self.is_client_mode() {
            return Ok(());
        }

        let (killed, current) = {
            let mut session = lock(&self.session);
            let mut process = session.process.take().ok_or(EngineError::NotStarted)?;
            let killed = process.destroy();
            if let Ok(code) = killed {
                session.last_exit = Some(code);
            }
            session.pump = None;
            session.stdin_closed = true;
            (killed, session.current.clone())
        };
        // Readers are released even when reaping failed.
        if let Some(sink) = current {
            sink.abort();
        }
        // Any write blocked on the pipe has failed by now.
        *lock(&self.input) = None;
        killed?;
        info!("Destroyed engine {}", self.name());
        Ok(())
    }

    /// Destroy the process and start a new one with the same command.
    ///
    /// Sinks handed out for the old process are finished.
    ///
    /// # Errors
    ///
    /// Fails like [`destroy`](Self::destroy) followed by [`start`](Self::start).
    pub fn restart(&self) -> EngineResult<()> {
        if self.is_client_mode() {
            return Ok(());
        }
        self.destroy()?;
        self.start()
    }

    /// Block until the engine process exits and return its exit code.
    ///
    /// Returns `-1` in client mode. A concurrent [`destroy`](Self::destroy)
    /// ends the wait with the exit code of the killed process.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotStarted`] if there is no process.
    pub fn wait_for(&self) -> EngineResult<i32> {
        if self.is_client_mode() {
            return Ok(-1);
        }

        let watch = lock(&self.session)
            .process
            .as_ref()
            .and_then(ProcessHandle::exit_watch)
            .ok_or(EngineError::NotStarted)?;
        let code = watch.wait();
        debug!("Engine {} exited with {}", self.name(), code);

        let mut session = lock(&self.session);
        let current = session.process.as_ref().and_then(ProcessHandle::exit_watch);
        match current {
            Some(running) if running.same_process(&watch) => {
                session.process = None;
                session.last_exit = Some(code);
            }
            // A newer run was started meanwhile; leave its state alone.
            Some(_) => {}
            None => session.last_exit = Some(code),
        }
        Ok(code)
    }

    /// Start the engine and wait for it to exit (analysis tools).
    ///
    /// Input is closed right away since nothing can be sent while waiting.
    ///
    /// # Errors
    ///
    /// Fails if the process cannot be started.
    pub fn run_and_wait(&self) -> EngineResult<i32> {
        self.start()?;
        self.close_stdin()?;
        self.wait_for()
    }

    /// Whether the engine process is running. Always `true` in client mode.
    pub fn is_alive(&self) -> bool {
        if self.is_client_mode() {
            return true;
        }
        lock(&self.session)
            .process
            .as_ref()
            .is_some_and(ProcessHandle::is_alive)
    }

    /// Close the engine's input, signalling end of input.
    ///
    /// Engines that only flush on EOF produce their output after this.
    /// Further sends fail with [`EngineError::StdinClosed`] until restart.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotStarted`] if the engine was never started.
    pub fn close_stdin(&self) -> EngineResult<()> {
        {
            let mut session = lock(&self.session);
            if session.pump.is_none() {
                return Err(EngineError::NotStarted);
            }
            session.stdin_closed = true;
        }
        if let Some(mut writer) = lock(&self.input).take() {
            if let Err(e) = writer.flush() {
                debug!("Flush on close failed: {}", e);
            }
        }
        if let Endpoint::Remote(stream) = &self.endpoint {
            stream.shutdown(Shutdown::Write)?;
        }
        debug!("Closed input of {}", self.name());
        Ok(())
    }

    // =========================================================================
    // One-shot evaluation
    // =========================================================================

    /// Send a program and return the sink that collects its reply.
    ///
    /// Blank input is not sent; the returned sink is already finished and
    /// empty. Without a delimiter the reply ends at end of stream.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotStarted`] / [`EngineError::StdinClosed`]
    /// - [`EngineError::Io`] if writing to the engine fails
    pub fn eval(&self, text: &str) -> EngineResult<LineSink> {
        if text.trim().is_empty() {
            return Ok(LineSink::finished());
        }

        let pattern = self.flavor.delimiter().map(|d| d.pattern().clone());
        let sink = LineSink::single(pattern);
        let _send = lock(&self.send_lock);
        self.begin_send(&sink)?;

        let directive = self.flavor.delimiter().map(Delimiter::directive);
        if let Err(e) = self.write_program(text, directive) {
            sink.abort();
            return Err(e);
        }
        Ok(sink)
    }

    /// Send the contents of a program file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, or like [`eval`](Self::eval).
    pub fn eval_file(&self, path: &Path) -> EngineResult<LineSink> {
        let text = std::fs::read_to_string(path)?;
        self.eval(&text)
    }

    /// Send a program, close the input and return the whole reply.
    ///
    /// Lines are joined with `\n`. The engine accepts no more input
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Fails like [`eval`](Self::eval).
    pub fn send_and_receive(&self, text: &str) -> EngineResult<String> {
        let sink = self.eval(text)?;
        self.close_stdin()?;
        sink.wait_until_finished();
        Ok(sink.joined())
    }

    /// The sink of the latest one-shot send.
    pub fn current(&self) -> Option<LineSink> {
        lock(&self.session).current.clone()
    }

    /// Whether the latest reply has another line; blocks until it is known.
    pub fn has_next(&self) -> bool {
        self.current().is_some_and(|sink| sink.has_next())
    }

    /// Next line of the latest reply, `None` once it is exhausted.
    pub fn next_line(&self) -> Option<String> {
        self.current().and_then(|sink| sink.next_line())
    }

    /// Next tuple of the latest reply, skipping lines that are not tuples.
    pub fn next_tuple(&self) -> Option<Tuple> {
        self.current().and_then(|sink| sink.next_tuple())
    }

    // =========================================================================
    // Batches
    // =========================================================================

    /// Queue a program for the next [`execute_queue`](Self::execute_queue).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateQuery`] if `id` is already queued.
    pub fn enqueue(&self, id: impl Into<String>, text: impl Into<String>) -> EngineResult<()> {
        lock(&self.queue).enqueue(id, text)
    }

    /// Number of queued queries.
    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Drop all queued queries without running them.
    pub fn clear_queue(&self) {
        lock(&self.queue).clear();
    }

    /// Pipeline every queued query and collect the tuples per id.
    ///
    /// All queries are written back to back, each followed by the echo
    /// directive, and the input is closed. If the engine exits early the
    /// unanswered ids map to empty lists (see [`QueryResults::is_partial`]).
    /// This includes an engine that exits while the batch is still being
    /// written: writing stops at the broken pipe and the answers that did
    /// arrive are returned.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Config`] if the flavour has no delimiter
    /// - [`EngineError::NotStarted`] / [`EngineError::StdinClosed`]
    /// - [`EngineError::Io`] if writing to the engine fails for a reason
    ///   other than a closed pipe
    pub fn execute_queue(&self) -> EngineResult<QueryResults> {
        let delimiter = self.flavor.delimiter().cloned().ok_or_else(|| {
            EngineError::Config(format!("engine {} has no delimiter for batches", self.name()))
        })?;
        let queries = lock(&self.queue).take();
        if queries.is_empty() {
            return Ok(QueryResults::default());
        }

        let ids: Vec<String> = queries.iter().map(|q| q.id.clone()).collect();
        let sink = LineSink::for_queue(delimiter.pattern().clone(), ids.clone());
        {
            let _send = lock(&self.send_lock);
            self.begin_send(&sink)?;
            debug!("Executing {} queued queries on {}", ids.len(), self.name());

            let mut broken = false;
            for (written, query) in queries.iter().enumerate() {
                match self.write_program(&query.text, Some(delimiter.directive())) {
                    Ok(()) => {}
                    Err(e) if e.is_broken_pipe() => {
                        warn!(
                            "Engine {} stopped reading after {} of {} queries: {}",
                            self.name(),
                            written,
                            queries.len(),
                            e
                        );
                        broken = true;
                        break;
                    }
                    Err(e) => {
                        sink.abort();
                        return Err(e);
                    }
                }
            }
            match self.close_stdin() {
                Ok(()) => {}
                Err(e) if broken => debug!("Closing input of {} failed: {}", self.name(), e),
                Err(e) => {
                    sink.abort();
                    return Err(e);
                }
            }
        }

        Ok(demultiplex(ids, &sink, delimiter.pattern()))
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Resource usage from the `time` wrapper.
    ///
    /// Blocks until the engine's stderr is closed, i.e. the process exited.
    /// Returns `None` when timing is disabled.
    pub fn timing(&self) -> Option<TimingReport> {
        if !self.config.take_time {
            return None;
        }
        let errors = lock(&self.session).errors.clone()?;
        errors.wait_completed();
        errors.timing()
    }

    /// Most recent lines the engine wrote to stderr.
    pub fn stderr_tail(&self) -> Vec<String> {
        lock(&self.session)
            .errors
            .as_ref()
            .map(|errors| errors.tail())
            .unwrap_or_default()
    }

    /// Exit code recorded by the last `wait_for` or `destroy`.
    pub fn last_exit(&self) -> Option<i32> {
        lock(&self.session).last_exit
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Wait for the previous reply, then hand `sink` to the pump.
    ///
    /// Must be called with `send_lock` held.
    fn begin_send(&self, sink: &LineSink) -> EngineResult<()> {
        if let Some(previous) = self.current() {
            if !previous.is_finished() {
                trace!("Waiting for previous reply of {}", self.name());
                previous.wait_until_finished();
            }
        }

        let mut session = lock(&self.session);
        let pump = session.pump.as_ref().ok_or(EngineError::NotStarted)?;
        if session.stdin_closed {
            return Err(EngineError::StdinClosed);
        }
        pump.submit(sink)?;
        session.current = Some(sink.clone());
        Ok(())
    }

    fn write_program(&self, text: &str, directive: Option<&str>) -> EngineResult<()> {
        let mut input = lock(&self.input);
        let writer = input.as_mut().ok_or(EngineError::StdinClosed)?;

        for line in text.lines() {
            trace!("> {}", line);
        }
        writer.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            writer.write_all(b"\n")?;
        }
        if let Some(directive) = directive {
            trace!("> {}", directive);
            writer.write_all(directive.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush().map_err(|e| {
            warn!("Write to {} failed: {}", self.name(), e);
            EngineError::from(e)
        })
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("flavor", &self.flavor)
            .field("endpoint", &self.endpoint)
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let session = self.session.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(sink) = session.current.take() {
            sink.abort();
        }
        if let Endpoint::Remote(stream) = &self.endpoint {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cat_engine() -> Engine {
        let delimiter =
            Delimiter::new(DEFAULT_END_TOKEN, EchoStyle::Template("{token}".to_string())).unwrap();
        let flavor = Flavor::binary("cat").with_delimiter(delimiter);
        Engine::new(
            flavor,
            EngineConfig {
                suppress_stderr: true,
                ..EngineConfig::default()
            },
        )
    }

    #[test]
    fn test_operations_before_start() {
        let engine = cat_engine();
        assert!(!engine.is_alive());
        assert!(matches!(engine.eval("(a)"), Err(EngineError::NotStarted)));
        assert!(matches!(engine.destroy(), Err(EngineError::NotStarted)));
        assert!(matches!(engine.wait_for(), Err(EngineError::NotStarted)));
        assert!(matches!(engine.close_stdin(), Err(EngineError::NotStarted)));
        assert!(engine.stderr_tail().is_empty());
        assert!(engine.next_line().is_none());
    }

    #[test]
    fn test_blank_eval_is_noop() {
        let engine = cat_engine();
        let sink = engine.eval("   \n").unwrap();
        assert!(sink.is_finished());
        assert!(sink.contents().is_empty());
    }

    #[test]
    fn test_eval_and_next_tuple() {
        let engine = cat_engine();
        engine.start().unwrap();
        assert!(engine.is_alive());

        engine.eval("# comment\n0.5 (a, b)\n(c)").unwrap();
        assert_eq!(engine.next_tuple(), Some(Tuple::new(0.5, ["a", "b"])));
        assert_eq!(engine.next_tuple(), Some(Tuple::certain(["c"])));
        assert_eq!(engine.next_tuple(), None);
        assert!(!engine.has_next());

        engine.destroy().unwrap();
        assert!(matches!(engine.destroy(), Err(EngineError::NotStarted)));
    }

    #[test]
    fn test_start_twice_fails() {
        let engine = cat_engine();
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning(_))));
        engine.destroy().unwrap();
    }

    #[test]
    fn test_execute_queue_without_delimiter() {
        let engine = Engine::new(Flavor::binary("cat"), EngineConfig::default());
        engine.enqueue("q", "(a)").unwrap();
        assert!(matches!(engine.execute_queue(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_empty_queue_returns_empty_results() {
        let engine = cat_engine();
        let results = engine.execute_queue().unwrap();
        assert_eq!(results.submitted(), 0);
        assert!(!results.is_partial());
    }

    #[test]
    fn test_destroy_finishes_pending_reply() {
        let engine = Engine::new(
            Flavor::new("silent", |_: &EngineConfig| {
                vec!["sh".to_string(), "-c".to_string(), "exec sleep 30".to_string()]
            })
            .with_delimiter(Delimiter::datalog().unwrap()),
            EngineConfig {
                suppress_stderr: true,
                ..EngineConfig::default()
            },
        );
        engine.start().unwrap();
        let sink = engine.eval("?- q(X).").unwrap();
        assert!(!sink.wait_until_finished_timeout(std::time::Duration::from_millis(50)));

        engine.destroy().unwrap();
        assert!(sink.is_finished());
        assert!(engine.current().is_some_and(|s| s.is_finished()));
        assert_eq!(engine.last_exit(), Some(-1));
        assert!(matches!(engine.close_stdin(), Err(EngineError::NotStarted)));
    }

    #[test]
    fn test_timing_disabled() {
        let engine = cat_engine();
        assert_eq!(engine.timing(), None);
    }
}
