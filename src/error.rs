//! Error types for engine communication and tuple parsing.
//!
//! [`EngineError`] is fatal to the current operation and always reaches the
//! caller, while [`TupleError`] describes a single bad output line and is
//! normally swallowed by the readers (logged at trace level, line dropped).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-level error types.
///
/// These cover process lifecycle, pipe I/O and batch bookkeeping. Content
/// problems in individual output lines are reported as [`TupleError`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine executable could not be located or started.
    #[error("Failed to start engine `{program}`: {source}")]
    Spawn {
        /// The program that was executed (argv[0])
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The operation requires a started engine process.
    #[error("Engine process not started")]
    NotStarted,

    /// The operation requires an engine that is not already running.
    #[error("Engine process already running (pid {0})")]
    AlreadyRunning(u32),

    /// An operation was called in the wrong lifecycle state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The engine's input stream was closed earlier in this session.
    #[error("Engine input stream is closed; restart the engine to send more input")]
    StdinClosed,

    /// Pipe broken, stream closed mid-write or socket failure.
    #[error("Engine I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// The same query id was enqueued twice in one batch.
    #[error("Query id `{0}` is already queued")]
    DuplicateQuery(String),

    /// A configuration file or value could not be used.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tuple failed to parse where strict parsing was requested.
    #[error(transparent)]
    Tuple(#[from] TupleError),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err)
    }
}

impl EngineError {
    /// Whether this error means the pipe to the engine is gone.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            EngineError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            EngineError::StdinClosed => true,
            _ => false,
        }
    }
}

/// A line that does not follow the tuple grammar (`MalformedTuple`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TupleError {
    /// The leading probability is not a decimal in [0, 1].
    #[error("Malformed probability in tuple: {0}")]
    MalformedProbability(String),

    /// No balanced parenthesised value list was found.
    #[error("Malformed attributes in tuple: missing or unbalanced parentheses in `{0}`")]
    MissingParentheses(String),

    /// A double-quoted value was not closed.
    #[error("Unterminated quoted value in `{0}`")]
    UnterminatedQuote(String),

    /// A character appeared where a separator or the end of the list was expected.
    #[error("Unexpected character `{found}` at offset {offset} in `{line}`")]
    UnexpectedCharacter {
        line: String,
        found: char,
        offset: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        assert_eq!(
            EngineError::NotStarted.to_string(),
            "Engine process not started"
        );
        assert_eq!(
            EngineError::DuplicateQuery("q1".to_string()).to_string(),
            "Query id `q1` is already queued"
        );

        let spawn = EngineError::Spawn {
            program: "/opt/hy/bin/hyp_pd".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(spawn.to_string().contains("/opt/hy/bin/hyp_pd"));
    }

    #[test]
    fn test_engine_error_from_io() {
        let pipe = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken");
        let err: EngineError = pipe.into();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(err.is_broken_pipe());

        let other = std::io::Error::new(std::io::ErrorKind::Other, "other");
        let err: EngineError = other.into();
        assert!(!err.is_broken_pipe());

        assert!(EngineError::StdinClosed.is_broken_pipe());
        assert!(!EngineError::NotStarted.is_broken_pipe());
    }

    #[test]
    fn test_tuple_error_converts() {
        let err: EngineError = TupleError::MalformedProbability("x".to_string()).into();
        assert_eq!(err.to_string(), "Malformed probability in tuple: x");
    }
}
