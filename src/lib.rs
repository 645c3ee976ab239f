//! tuplepipe - process-communication core for text-protocol inference engines.
//!
//! The engines this crate drives are black boxes reached only through their
//! standard streams: program text goes in on stdin, probabilistic tuples come
//! back on stdout one per line, and the end of each reply is marked by a
//! token the engine echoes on request.
//!
//! - `tuple` - tuple line codec (`0.5 ("x,y", z)`), data file filtering
//! - `stream` - stdout pump, line sinks and the stderr sink
//! - `process` - engine process lifecycle
//! - `engine` - the [`Engine`](engine::Engine) façade, flavours and batches
//! - `config` - engine configuration loading
//! - `error` - error types
//!
//! # Example
//!
//! ```ignore
//! use tuplepipe::{Engine, EngineConfig, Flavor};
//!
//! let engine = Engine::new(Flavor::pdatalog()?, EngineConfig::discover()?);
//! engine.start()?;
//! engine.enqueue("q1", "?- retrieve(D, Q).")?;
//! engine.enqueue("q2", "?- qterm(T).")?;
//!
//! let results = engine.execute_queue()?;
//! if results.is_partial() {
//!     eprintln!("engine answered {} of {}", results.observed(), results.submitted());
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod process;
pub mod stream;
pub mod tuple;

pub use config::EngineConfig;
pub use engine::{Delimiter, Engine, Flavor, QueryResults};
pub use error::{EngineError, EngineResult, TupleError};
pub use tuple::Tuple;
