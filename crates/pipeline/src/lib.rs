//! # conveyor-pipeline
//!
//! An in-process dataflow pipeline: ordered stages of work, each run by a
//! configurable pool of concurrent workers, with items flowing stage-to-stage
//! over bounded, back-pressured queues.
//!
//! The framework owns the hard parts — correct shutdown propagation,
//! closable bounded channels that never wedge waiting readers, and
//! termination detection for pools whose size is not known to downstream
//! readers — so callers only write the per-item transformation functions.
//!
//! ```
//! use conveyor_pipeline::prelude::*;
//!
//! async fn run() -> conveyor_shared::Result<i64> {
//!     Pipeline::new()
//!         .from_iter(0..100i64, SourceOptions::default())
//!         .await?
//!         .filter(|x| x % 2 == 1, ChainWorkersOptions::default())
//!         .await?
//!         .map(
//!             |x| async move { Ok(x * 2) },
//!             ExceptionHandler::default(),
//!             ChainWorkersOptions { n_workers: 8, ..Default::default() },
//!         )
//!         .await?
//!         .fold(|a, b| Ok(a + b), 0, FoldOptions { n_workers: 5 })
//!         .await
//! }
//!
//! # fn main() -> conveyor_shared::Result<()> {
//! let sum = tokio::runtime::Runtime::new()
//!     .map_err(|error| {
//!         conveyor_shared::ErrorEnvelope::unexpected(
//!             conveyor_shared::ErrorCode::new("doctest", "runtime"),
//!             error.to_string(),
//!             conveyor_shared::ErrorClass::NonRetriable,
//!         )
//!     })?
//!     .block_on(run())?;
//! assert_eq!(sum, 5000);
//! # Ok(())
//! # }
//! ```
//!
//! No library-level logging is installed — binaries embedding
//! `conveyor-pipeline` are responsible for a `tracing` subscriber; the
//! library only emits `debug`/`warn` events (stage spawn/termination,
//! escalated user-function errors), never item payloads.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod errors;
mod pipeline;
mod queue;
mod terminator;
mod worker;

pub use errors::{
    ClosedForPutError, CloseTwiceError, InvariantViolationError, MisuseError, WouldBlockError,
};
pub use pipeline::{
    ChainWorkersOptions, FoldOptions, Pipeline, SortOptions, SourceOptions, Unstarted,
};
pub use queue::{Cbq, FuzzConfig, Slot};
pub use terminator::StageTerminator;
pub use worker::{ExceptionHandler, run_worker};

/// Common imports for composing pipelines.
pub mod prelude {
    pub use crate::{
        Cbq, ChainWorkersOptions, ExceptionHandler, FoldOptions, Pipeline, Slot, SortOptions,
        SourceOptions,
    };
}
