//! Long-lived reader thread that owns one output stream.

use std::io::{BufReader, Read};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error};

use super::line_sink::{read_into, LineSink, ReadOutcome};
use crate::error::EngineResult;

/// The only reader of an engine's stdout.
///
/// Sinks are submitted as jobs and filled strictly one after another in
/// submission order, so two read passes can never race on the same pipe.
/// Once the stream ends every later job is finished immediately (empty).
/// The thread exits when the pump is dropped.
#[derive(Debug)]
pub struct StreamPump {
    name: String,
    jobs: Sender<LineSink>,
    handle: Option<JoinHandle<()>>,
}

impl StreamPump {
    /// Spawn the pump thread over `reader`.
    ///
    /// # Errors
    ///
    /// Fails if the OS refuses to spawn the thread.
    pub fn spawn<R>(name: &str, reader: R) -> EngineResult<Self>
    where
        R: Read + Send + 'static,
    {
        let (jobs, rx) = unbounded::<LineSink>();
        let thread_name = format!("{}-stdout", name);
        let label = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || pump_loop(&label, BufReader::new(reader), rx))?;

        debug!("Started stdout pump for {}", name);
        Ok(Self {
            name: name.to_string(),
            jobs,
            handle: Some(handle),
        })
    }

    /// Queue `sink` behind any sink already being filled.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`](crate::error::EngineError::IllegalState)
    /// if the sink was started before.
    pub fn submit(&self, sink: &LineSink) -> EngineResult<()> {
        sink.begin()?;
        if self.jobs.send(sink.clone()).is_err() {
            // Pump thread is gone, so is the stream.
            sink.finish();
        }
        Ok(())
    }

    /// Whether the pump thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn pump_loop<R: Read>(name: &str, mut reader: BufReader<R>, jobs: Receiver<LineSink>) {
    let mut exhausted = false;

    for sink in jobs.iter() {
        if exhausted {
            sink.finish();
            continue;
        }
        match read_into(&mut reader, &sink) {
            Ok(ReadOutcome::Stopped) => {}
            Ok(ReadOutcome::Eof) => {
                debug!("{} stdout reached end of stream", name);
                sink.finish();
                exhausted = true;
            }
            Err(e) => {
                error!("{} stdout read failed: {}", name, e);
                sink.finish();
                exhausted = true;
            }
        }
    }

    debug!("Stdout pump for {} exiting", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use pretty_assertions::assert_eq;
    use regex::Regex;
    use std::io::Cursor;
    use std::time::Duration;

    fn end() -> Regex {
        Regex::new("^END$").unwrap()
    }

    #[test]
    fn test_jobs_are_served_in_order() {
        let pump = StreamPump::spawn("test", Cursor::new("(a)\nEND\n(b)\nEND\n")).unwrap();
        let first = LineSink::single(Some(end()));
        let second = LineSink::single(Some(end()));
        pump.submit(&first).unwrap();
        pump.submit(&second).unwrap();

        assert_eq!(first.contents(), vec!["(a)".to_string()]);
        assert_eq!(second.contents(), vec!["(b)".to_string()]);
        assert_eq!(pump.name(), "test");
    }

    #[test]
    fn test_jobs_after_eof_finish_empty() {
        let pump = StreamPump::spawn("test", Cursor::new("(a)\n")).unwrap();
        let first = LineSink::single(Some(end()));
        pump.submit(&first).unwrap();
        assert!(first.wait_until_finished_timeout(Duration::from_secs(5)));
        assert_eq!(first.contents(), vec!["(a)".to_string()]);

        let late = LineSink::single(Some(end()));
        pump.submit(&late).unwrap();
        assert!(late.wait_until_finished_timeout(Duration::from_secs(5)));
        assert!(late.contents().is_empty());
    }

    #[test]
    fn test_submit_rejects_started_sink() {
        let pump = StreamPump::spawn("test", Cursor::new("")).unwrap();
        let sink = LineSink::single(None);
        pump.submit(&sink).unwrap();
        assert!(matches!(pump.submit(&sink), Err(EngineError::IllegalState(_))));
    }
}
