//! Engine stderr consumer.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::error::EngineResult;

/// Tag that marks the line written by the `time` wrapper.
pub const TIME_PREFIX: &str = "***TIME";

/// Format string passed to `time --format`, after [`TIME_PREFIX`].
pub const TIME_FORMAT: &str = "Real: %E\tUser: %U\tSys: %S\tCPU: %P";

/// Resource usage reported by the `time` wrapper.
///
/// Fields keep the raw text GNU `time` printed (`real` as `[h:]m:ss.ss`,
/// `user`/`sys` in seconds, `cpu` as a percentage such as `97%`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimingReport {
    pub real: String,
    pub user: String,
    pub sys: String,
    pub cpu: String,
}

impl TimingReport {
    /// Parse a tagged timing line. Returns `None` for any other line.
    pub fn parse(line: &str) -> Option<Self> {
        let body = line.strip_prefix(TIME_PREFIX)?;
        let mut fields = body.split('\t').map(|field| {
            // "Real: 0:01.20" -> "0:01.20"
            match field.split_once(':') {
                Some((label, value)) if label.chars().all(char::is_alphabetic) => {
                    value.trim().to_string()
                }
                _ => field.trim().to_string(),
            }
        });
        Some(Self {
            real: fields.next()?,
            user: fields.next()?,
            sys: fields.next()?,
            cpu: fields.next()?,
        })
    }

    /// Wall-clock time parsed from `[hours:]minutes:seconds`.
    pub fn real_duration(&self) -> Option<Duration> {
        let mut parts = self.real.rsplit(':');
        let seconds: f64 = parts.next()?.parse().ok()?;
        let minutes: u64 = parts.next().map_or(Ok(0), str::parse::<u64>).ok()?;
        let hours: u64 = parts.next().map_or(Ok(0), str::parse::<u64>).ok()?;
        if parts.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
            return None;
        }
        Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
    }

    pub fn user_seconds(&self) -> Option<f64> {
        self.user.parse().ok()
    }

    pub fn sys_seconds(&self) -> Option<f64> {
        self.sys.parse().ok()
    }

    /// CPU share in percent (`"97%"` -> `97.0`).
    pub fn cpu_percent(&self) -> Option<f64> {
        self.cpu.trim_end_matches('%').parse().ok()
    }
}

/// Behaviour of an [`ErrorSink`].
#[derive(Debug, Clone)]
pub struct ErrorSinkOptions {
    /// Name used to tag forwarded lines.
    pub engine_name: String,
    /// Extract [`TimingReport`] lines instead of forwarding them.
    pub capture_timing: bool,
    /// Also copy diagnostics to this process's stderr.
    pub echo: bool,
    /// Number of recent diagnostic lines to retain.
    pub tail_capacity: usize,
}

impl Default for ErrorSinkOptions {
    fn default() -> Self {
        Self {
            engine_name: "engine".to_string(),
            capture_timing: false,
            echo: true,
            tail_capacity: 64,
        }
    }
}

#[derive(Debug, Default)]
struct ErrorState {
    completed: bool,
    timing: Option<TimingReport>,
    tail: VecDeque<String>,
    lines: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<ErrorState>,
    done: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ErrorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background reader over an engine's stderr.
///
/// Every line is logged as a warning tagged with the engine name and kept in
/// a bounded tail. With timing capture enabled the `time` wrapper's line is
/// parsed into a [`TimingReport`] instead.
#[derive(Debug)]
pub struct ErrorSink {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl ErrorSink {
    /// Start consuming `reader` on a new thread.
    ///
    /// # Errors
    ///
    /// Fails if the OS refuses to spawn the thread.
    pub fn spawn<R>(reader: R, options: ErrorSinkOptions) -> EngineResult<Self>
    where
        R: Read + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("{}-stderr", options.engine_name))
            .spawn(move || {
                consume(BufReader::new(reader), &options, &worker);
                let mut state = worker.lock();
                state.completed = true;
                worker.done.notify_all();
            })?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Whether stderr reached end of stream.
    pub fn is_completed(&self) -> bool {
        self.shared.lock().completed
    }

    /// Block until stderr reaches end of stream.
    pub fn wait_completed(&self) {
        let state = self.shared.lock();
        let _state = self
            .shared
            .done
            .wait_while(state, |s| !s.completed)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Like [`wait_completed`](Self::wait_completed) with an upper bound.
    /// Returns `true` if stderr completed.
    pub fn wait_completed_timeout(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .done
            .wait_timeout_while(state, timeout, |s| !s.completed)
            .unwrap_or_else(PoisonError::into_inner);
        state.completed
    }

    /// The timing report seen so far, without waiting.
    pub fn timing(&self) -> Option<TimingReport> {
        self.shared.lock().timing.clone()
    }

    /// Most recent diagnostic lines, oldest first.
    pub fn tail(&self) -> Vec<String> {
        self.shared.lock().tail.iter().cloned().collect()
    }

    /// Number of diagnostic lines seen (timing lines excluded).
    pub fn line_count(&self) -> usize {
        self.shared.lock().lines
    }

    /// Wait for the reader thread to exit.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("stderr reader thread panicked");
            }
        }
    }
}

fn consume<R: BufRead>(reader: R, options: &ErrorSinkOptions, shared: &Shared) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("{} stderr read failed: {}", options.engine_name, e);
                break;
            }
        };
        trace!("stderr: {}", line);

        if options.capture_timing {
            if let Some(report) = TimingReport::parse(&line) {
                debug!("{} timing: {:?}", options.engine_name, report);
                shared.lock().timing = Some(report);
                continue;
            }
        }

        if options.echo {
            eprintln!("{}", line);
        }
        warn!("<{}> {}", options.engine_name, line);

        let mut state = shared.lock();
        state.lines += 1;
        if options.tail_capacity > 0 {
            if state.tail.len() == options.tail_capacity {
                state.tail.pop_front();
            }
            state.tail.push_back(line);
        }
    }
}
