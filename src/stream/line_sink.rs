//! Single-use line buffer filled by a stream pump.

use std::collections::VecDeque;
use std::io::{self, BufRead};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, trace};

use crate::error::{EngineError, EngineResult};
use crate::tuple::{is_data_line, Tuple};

/// Lifecycle of a [`LineSink`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkPhase {
    Idle,
    Running,
    Finished,
}

/// Whether the reader should keep feeding a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// The sink finished on a delimiter or was aborted; the stream may have more.
    Stopped,
    /// The stream reached end of file.
    Eof,
}

#[derive(Debug)]
struct SinkState {
    phase: SinkPhase,
    /// Lines of the segment being filled (the whole output in single mode).
    lines: Vec<String>,
    cursor: usize,
    /// Query ids still waiting for their delimiter.
    pending: VecDeque<String>,
    current: Option<String>,
    segments: Vec<(String, Vec<String>)>,
    unattributed: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SinkState>,
    changed: Condvar,
    delimiter: Option<Regex>,
    queue_mode: bool,
}

/// Buffer for one read pass over an engine output stream.
///
/// A sink is filled by exactly one reader (a [`StreamPump`](super::StreamPump)
/// job or [`LineSink::start_on`]) and read by any number of clones. It starts
/// `Idle`, becomes `Running` when a reader takes it, and becomes `Finished`
/// exactly once: on a delimiter in single-segment mode, when the last queued
/// query's delimiter arrives in queue mode, at end of stream, on a read error,
/// or through [`abort`](LineSink::abort). After that the buffer is frozen.
///
/// # Example
///
/// ```ignore
/// let sink = LineSink::single(Some(delimiter));
/// pump.submit(&sink)?;
/// while let Some(tuple) = sink.next_tuple() {
///     println!("{}", tuple);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct LineSink {
    shared: Arc<Shared>,
}

impl LineSink {
    /// A sink collecting one segment, ending at the first delimiter line or
    /// at end of stream when `delimiter` is `None`.
    pub fn single(delimiter: Option<Regex>) -> Self {
        Self::with_state(delimiter, false, VecDeque::new())
    }

    /// A sink that splits the stream into one segment per pending query id,
    /// in FIFO order, finishing once every id has seen its delimiter.
    pub fn for_queue<I, S>(delimiter: Regex, pending: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pending = pending.into_iter().map(Into::into).collect();
        Self::with_state(Some(delimiter), true, pending)
    }

    /// A sink that is already finished and empty.
    pub fn finished() -> Self {
        let sink = Self::single(None);
        sink.lock().phase = SinkPhase::Finished;
        sink
    }

    fn with_state(delimiter: Option<Regex>, queue_mode: bool, pending: VecDeque<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SinkState {
                    phase: SinkPhase::Idle,
                    lines: Vec::new(),
                    cursor: 0,
                    pending,
                    current: None,
                    segments: Vec::new(),
                    unattributed: 0,
                }),
                changed: Condvar::new(),
                delimiter,
                queue_mode,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Reader side =====

    /// Move from `Idle` to `Running`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] if the sink was already started.
    pub(crate) fn begin(&self) -> EngineResult<()> {
        let mut state = self.lock();
        if state.phase != SinkPhase::Idle {
            return Err(EngineError::IllegalState(format!(
                "line sink already {:?}",
                state.phase
            )));
        }
        state.phase = SinkPhase::Running;
        if self.shared.queue_mode {
            state.current = state.pending.pop_front();
        }
        Ok(())
    }

    /// Start a dedicated thread reading `reader` into this sink.
    ///
    /// The thread returns the reader when the sink finishes so the rest of
    /// the stream can be handed to another sink.
    ///
    /// # Errors
    ///
    /// Fails if the sink is not `Idle` or the thread cannot be spawned.
    pub fn start_on<R>(&self, mut reader: R) -> EngineResult<JoinHandle<R>>
    where
        R: BufRead + Send + 'static,
    {
        self.begin()?;
        let sink = self.clone();
        let spawned = thread::Builder::new()
            .name("line-sink".to_string())
            .spawn(move || {
                if let Err(e) = read_into(&mut reader, &sink) {
                    error!("Line sink read failed: {}", e);
                }
                sink.finish();
                reader
            });
        match spawned {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.finish();
                Err(e.into())
            }
        }
    }

    /// Record one line. Returns `false` once the sink wants no more input.
    pub(crate) fn push_line(&self, line: String) -> bool {
        let mut state = self.lock();
        if state.phase == SinkPhase::Finished {
            return false;
        }

        let is_delimiter = self
            .shared
            .delimiter
            .as_ref()
            .is_some_and(|re| re.is_match(&line));

        if !is_delimiter {
            trace!("< {}", line);
            state.lines.push(line);
            self.shared.changed.notify_all();
            return true;
        }

        if !self.shared.queue_mode {
            self.finish_locked(&mut state);
            return false;
        }

        let segment = std::mem::take(&mut state.lines);
        state.cursor = 0;
        match state.current.take() {
            Some(id) => {
                debug!("Segment for query {} closed with {} lines", id, segment.len());
                state.segments.push((id, segment));
            }
            None => state.unattributed += segment.len(),
        }

        match state.pending.pop_front() {
            Some(next) => {
                state.current = Some(next);
                self.shared.changed.notify_all();
                true
            }
            None => {
                self.finish_locked(&mut state);
                false
            }
        }
    }

    /// Transition to `Finished` and wake all waiters. Later calls do nothing.
    pub(crate) fn finish(&self) {
        let mut state = self.lock();
        self.finish_locked(&mut state);
    }

    fn finish_locked(&self, state: &mut SinkState) {
        if state.phase == SinkPhase::Finished {
            return;
        }
        if self.shared.queue_mode {
            // An open segment whose delimiter never arrived belongs to nobody.
            state.unattributed += state.lines.len();
            if let Some(id) = state.current.take() {
                debug!("Query {} ended without a delimiter", id);
            }
        }
        state.phase = SinkPhase::Finished;
        self.shared.changed.notify_all();
    }

    /// Finish the sink early, keeping whatever was buffered.
    ///
    /// Used when the engine is destroyed so that waiters return with a
    /// partial result instead of blocking on a stream that will never end.
    pub fn abort(&self) {
        self.finish();
    }

    // ===== Consumer side =====

    pub fn phase(&self) -> SinkPhase {
        self.lock().phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == SinkPhase::Finished
    }

    /// Block until the sink is `Finished`.
    pub fn wait_until_finished(&self) {
        let state = self.lock();
        let _state = self
            .shared
            .changed
            .wait_while(state, |s| s.phase != SinkPhase::Finished)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Block until the sink is `Finished` or `timeout` elapses.
    ///
    /// Returns `true` if the sink finished.
    pub fn wait_until_finished_timeout(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| s.phase != SinkPhase::Finished)
            .unwrap_or_else(PoisonError::into_inner);
        state.phase == SinkPhase::Finished
    }

    /// Whether [`next_line`](Self::next_line) will return a line.
    ///
    /// Blocks until a line beyond the cursor is buffered or the sink is
    /// finished. Only meaningful in single-segment mode.
    pub fn has_next(&self) -> bool {
        let state = self.wait_for_line();
        state.cursor < state.lines.len()
    }

    /// The next buffered line, blocking until one arrives.
    ///
    /// Returns `None` once the sink is finished and every line was consumed.
    pub fn next_line(&self) -> Option<String> {
        let mut state = self.wait_for_line();
        let line = state.lines.get(state.cursor).cloned()?;
        state.cursor += 1;
        Some(line)
    }

    /// The next line that parses as a tuple, skipping comments, blanks and
    /// malformed lines.
    pub fn next_tuple(&self) -> Option<Tuple> {
        while let Some(line) = self.next_line() {
            if !is_data_line(&line) {
                continue;
            }
            match Tuple::parse(&line) {
                Ok(tuple) => return Some(tuple),
                Err(e) => trace!("Dropping malformed tuple line: {}", e),
            }
        }
        None
    }

    fn wait_for_line(&self) -> MutexGuard<'_, SinkState> {
        let state = self.lock();
        self.shared
            .changed
            .wait_while(state, |s| {
                s.cursor >= s.lines.len() && s.phase != SinkPhase::Finished
            })
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Every buffered line of the current segment, once finished.
    pub fn contents(&self) -> Vec<String> {
        self.wait_until_finished();
        self.lock().lines.clone()
    }

    /// All buffered lines joined with `\n`, once finished.
    pub fn joined(&self) -> String {
        self.contents().join("\n")
    }

    /// Completed segments in delimiter order, once finished (queue mode).
    pub fn segments(&self) -> Vec<(String, Vec<String>)> {
        self.wait_until_finished();
        self.lock().segments.clone()
    }

    /// Lines that could not be attributed to any query (queue mode).
    pub fn unattributed_lines(&self) -> usize {
        self.lock().unattributed
    }
}

/// Feed lines from `reader` into `sink` until it stops or the stream ends.
///
/// Invalid UTF-8 is replaced rather than treated as an error, and line
/// terminators (`\n` or `\r\n`) are stripped.
pub(crate) fn read_into<R: BufRead + ?Sized>(
    reader: &mut R,
    sink: &LineSink,
) -> io::Result<ReadOutcome> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(ReadOutcome::Eof);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        if !sink.push_line(line) {
            return Ok(ReadOutcome::Stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn end() -> Regex {
        Regex::new("^END$").unwrap()
    }

    fn owned(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_mode_stops_at_delimiter() {
        let sink = LineSink::single(Some(end()));
        let mut cursor = Cursor::new("a\nb\nEND\nc\n");

        sink.begin().unwrap();
        let outcome = read_into(&mut cursor, &sink).unwrap();

        assert_eq!(outcome, ReadOutcome::Stopped);
        assert!(sink.is_finished());
        assert_eq!(sink.contents(), owned(&["a", "b"]));

        // The rest of the stream is left for the next reader.
        let mut rest = String::new();
        std::io::Read::read_to_string(&mut cursor, &mut rest).unwrap();
        assert_eq!(rest, "c\n");
    }

    #[test]
    fn test_single_mode_without_delimiter_reads_to_eof() {
        let sink = LineSink::single(None);
        let handle = sink.start_on(Cursor::new("x\r\ny")).unwrap();
        sink.wait_until_finished();
        handle.join().unwrap();
        assert_eq!(sink.contents(), owned(&["x", "y"]));
        assert_eq!(sink.joined(), "x\ny");
    }

    #[test]
    fn test_queue_mode_splits_segments_in_order() {
        let sink = LineSink::for_queue(end(), ["q1", "q2"]);
        sink.start_on(Cursor::new("# note\n0.3 (a)\nEND\n(b)\n(c)\nEND\n"))
            .unwrap();

        let segments = sink.segments();
        assert_eq!(
            segments,
            vec![
                ("q1".to_string(), owned(&["# note", "0.3 (a)"])),
                ("q2".to_string(), owned(&["(b)", "(c)"])),
            ]
        );
        assert_eq!(sink.unattributed_lines(), 0);
    }

    #[test]
    fn test_queue_mode_partial_result_on_eof() {
        let sink = LineSink::for_queue(end(), ["q1", "q2"]);
        sink.start_on(Cursor::new("(a)\nEND\n(half)\n")).unwrap();

        let segments = sink.segments();
        assert_eq!(segments, vec![("q1".to_string(), owned(&["(a)"]))]);
        assert_eq!(sink.unattributed_lines(), 1);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let sink = LineSink::single(None);
        sink.start_on(Cursor::new("")).unwrap();
        let second = sink.start_on(Cursor::new(""));
        assert!(matches!(second, Err(EngineError::IllegalState(_))));
    }

    #[test]
    fn test_next_line_blocks_until_pushed() {
        let sink = LineSink::single(Some(end()));
        sink.begin().unwrap();

        let producer = sink.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push_line("(a)".to_string());
            thread::sleep(Duration::from_millis(20));
            producer.push_line("END".to_string());
        });

        assert!(sink.has_next());
        assert_eq!(sink.next_line(), Some("(a)".to_string()));
        assert_eq!(sink.next_line(), None);
        assert!(!sink.has_next());
        handle.join().unwrap();
    }

    #[test]
    fn test_next_tuple_skips_noise() {
        let sink = LineSink::single(Some(end()));
        sink.start_on(Cursor::new("# c\n\nbroken\n0.5 (x)\nEND\n"))
            .unwrap();
        assert_eq!(sink.next_tuple(), Some(Tuple::new(0.5, ["x"])));
        assert_eq!(sink.next_tuple(), None);
    }

    #[test]
    fn test_abort_wakes_waiters() {
        let sink = LineSink::single(Some(end()));
        sink.begin().unwrap();
        sink.push_line("(partial)".to_string());

        let aborter = sink.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            aborter.abort();
        });

        assert!(sink.wait_until_finished_timeout(Duration::from_secs(5)));
        assert_eq!(sink.contents(), owned(&["(partial)"]));
        assert!(!sink.push_line("late".to_string()));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires_while_running() {
        let sink = LineSink::single(None);
        sink.begin().unwrap();
        assert!(!sink.wait_until_finished_timeout(Duration::from_millis(10)));
        assert_eq!(sink.phase(), SinkPhase::Running);
    }

    #[test]
    fn test_finished_sink_is_empty() {
        let sink = LineSink::finished();
        assert!(sink.is_finished());
        assert!(!sink.has_next());
        assert!(sink.begin().is_err());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let sink = LineSink::single(None);
        sink.start_on(Cursor::new(b"ok\n\xffbad\n".to_vec())).unwrap();
        let lines = sink.contents();
        assert_eq!(lines[0], "ok");
        assert!(lines[1].ends_with("bad"));
    }
}
