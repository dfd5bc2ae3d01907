//! The Stage Terminator: closes a stage's output queue once every worker of
//! that stage has signaled done, without leaking an auxiliary helper task or
//! queue into the public contract (`spec.md` §4.B, §9 "Stage termination
//! barrier").

use crate::queue::Cbq;
use conveyor_shared::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Counts a stage's outstanding workers and closes its output queue exactly
/// once the count reaches zero.
///
/// Realized as a shared `AtomicUsize` rather than a pair of auxiliary queues
/// plus a helper task: the worker whose `fetch_sub` observes the count
/// crossing from 1 to 0 closes the output queue itself, inline, before
/// returning. That happens-before relationship (this worker's exit, then the
/// queue close) is what downstream readers rely on to observe `Eos` only
/// after every upstream worker is truly done.
pub struct StageTerminator<T: Send + 'static> {
    remaining: Arc<AtomicUsize>,
    output: Option<Cbq<T>>,
    stage_name: &'static str,
}

impl<T: Send + 'static> Clone for StageTerminator<T> {
    fn clone(&self) -> Self {
        Self {
            remaining: Arc::clone(&self.remaining),
            output: self.output.clone(),
            stage_name: self.stage_name,
        }
    }
}

impl<T: Send + 'static> StageTerminator<T> {
    /// Create a terminator for a stage with `worker_count` workers and the
    /// given (possibly absent, for a terminal sink) output queue.
    ///
    /// A degenerate `worker_count = 0` stage closes its output immediately,
    /// since there is nothing left to wait for.
    pub async fn new(worker_count: usize, output: Option<Cbq<T>>, stage_name: &'static str) -> Result<Self> {
        let terminator = Self {
            remaining: Arc::new(AtomicUsize::new(worker_count)),
            output,
            stage_name,
        };

        if worker_count == 0 {
            terminator.close_output().await?;
        }

        Ok(terminator)
    }

    /// Signal that one worker of this stage has exited (normally or via an
    /// escalated error). Closes the output queue exactly once, the moment
    /// the last worker reports in.
    pub async fn worker_done(&self) -> Result<()> {
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous >= 1, "worker_done called more times than worker_count");

        if previous == 1 {
            self.close_output().await?;
        }

        Ok(())
    }

    async fn close_output(&self) -> Result<()> {
        debug!(stage = self.stage_name, "stage terminated, closing output queue");
        if let Some(output) = &self.output {
            // `once = false`: a degenerate zero-worker stage and the normal
            // last-worker path both call this, and only one of them should
            // ever race to actually flip the flag; either is a legitimate
            // closer, so `CloseTwice` is not an error here.
            output.close(false).await?;
        }
        Ok(())
    }
}
