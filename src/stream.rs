//! Background consumption of the engine's output streams.
//!
//! The engine multiplexes every reply over one stdout pipe, marking the end
//! of each reply only by echoing a delimiter token. Segmentation is therefore
//! owned by a single reader per stream:
//!
//! ```text
//!                    jobs (FIFO)
//!  Engine ──submit──► StreamPump ──push_line──► LineSink (Running → Finished)
//!                       │ owns BufReader<stdout>      ▲
//!                       │                             │ wait / next_line
//!                       ▼                             │
//!                    engine stdout               caller threads
//! ```
//!
//! - [`LineSink`] - single-use buffer for one read pass, in single-segment or
//!   query-queue mode, with blocking waits built on a condition variable
//! - [`StreamPump`] - the one long-lived thread that owns a stream's reader
//!   and serves sinks strictly one after another
//! - [`ErrorSink`] - stderr consumer that logs diagnostics and extracts the
//!   timing line produced by the `time` wrapper

mod error_sink;
mod line_sink;
mod pump;

pub use error_sink::{ErrorSink, ErrorSinkOptions, TimingReport, TIME_FORMAT, TIME_PREFIX};
pub use line_sink::{LineSink, SinkPhase};
pub use pump::StreamPump;
