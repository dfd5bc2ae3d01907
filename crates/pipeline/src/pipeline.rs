//! The Pipeline Orchestrator: chains stages, owns spawned tasks, and wires
//! each stage's input/output through [`Cbq`]s (`spec.md` §4.D).
//!
//! The builder is a type-state chain: [`Pipeline<Unstarted>`] is the only
//! state `from_iter`/`source` are callable on, so "an input queue already
//! exists" (`spec.md`'s first `MisuseError` case) is a compile error rather
//! than a runtime one — mirroring the phantom-typed stage machine in the
//! teacher's `index_codebase` module, generalized from a fixed set of phases
//! to an open set of item types.

use crate::errors::MisuseError;
use crate::queue::{Cbq, Slot};
use crate::terminator::StageTerminator;
use crate::worker::{ExceptionHandler, run_worker};
use conveyor_shared::{ErrorClass, ErrorCode, ErrorEnvelope, Result};
use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Marker type for a pipeline that has no stages yet.
///
/// `Pipeline<Unstarted>` is never actually stored as an item type; it only
/// exists so `from_iter`/`source` can be the sole inherent methods available
/// before the first stage is added.
#[derive(Debug, Clone, Copy)]
pub struct Unstarted;

/// Options shared by `from_iter` and `source`.
#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    /// Used only to size the default output capacity (`2 * n_workers`); the
    /// source stage itself is always a single push task.
    pub n_workers: usize,
    /// Explicit output queue capacity, overriding the `2 * n_workers` default.
    pub maxsize: Option<usize>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self { n_workers: 1, maxsize: None }
    }
}

/// Options for [`Pipeline::chain_workers`].
pub struct ChainWorkersOptions<Out> {
    /// Number of concurrent workers in this stage.
    pub n_workers: usize,
    /// An explicit output queue. Mutually exclusive with `maxsize`.
    pub q_out: Option<Cbq<Out>>,
    /// Output queue capacity when `q_out` is not supplied. Defaults to
    /// `2 * n_workers`.
    pub maxsize: Option<usize>,
}

impl<Out> Default for ChainWorkersOptions<Out> {
    fn default() -> Self {
        Self { n_workers: 1, q_out: None, maxsize: None }
    }
}

/// Options for [`Pipeline::fold`].
#[derive(Debug, Clone, Copy)]
pub struct FoldOptions {
    /// Number of partition workers in the fold's first phase.
    pub n_workers: usize,
}

impl Default for FoldOptions {
    fn default() -> Self {
        Self { n_workers: 1 }
    }
}

/// Options for the `sort*` family.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortOptions {
    /// Output queue capacity for the sorted result.
    pub maxsize: Option<usize>,
}

fn join_panicked(join_error: tokio::task::JoinError) -> ErrorEnvelope {
    ErrorEnvelope::unexpected(
        ErrorCode::new("pipeline", "worker_panicked"),
        join_error.to_string(),
        ErrorClass::NonRetriable,
    )
}

fn misuse(reason: &str) -> ErrorEnvelope {
    MisuseError::new(reason.to_string()).into()
}

/// An in-process dataflow pipeline: an ordered list of stages plus a handle
/// to the current tail output queue (`spec.md` §3 "Pipeline").
///
/// `T` is the item type flowing out of the current tail stage. The pipeline
/// exclusively owns its spawned tasks; builder calls append to that set,
/// `join` drains it.
pub struct Pipeline<T: Send + 'static> {
    tasks: Vec<JoinHandle<Result<()>>>,
    tail: Option<Cbq<T>>,
    draining: Option<Cbq<T>>,
}

impl Pipeline<Unstarted> {
    /// Create an empty, unstarted pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self { tasks: Vec::new(), tail: None, draining: None }
    }

    /// Add a source stage driven by a caller-supplied function that pushes
    /// into the freshly created output queue and exits.
    ///
    /// This is the general primitive `from_iter` is built on.
    pub async fn source<T, F, Fut>(self, f: F, options: SourceOptions) -> Result<Pipeline<T>>
    where
        T: Send + 'static,
        F: FnOnce(Cbq<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let capacity = options.maxsize.unwrap_or_else(|| 2 * options.n_workers.max(1));
        let q_out: Cbq<T> = Cbq::new(capacity);
        let terminator = StageTerminator::new(1, Some(q_out.clone()), "source").await?;

        debug!(stage = "source", capacity, "spawning source stage");

        let task_q_out = q_out.clone();
        let task = tokio::spawn(async move {
            let outcome = f(task_q_out).await;
            terminator.worker_done().await?;
            outcome
        });

        Ok(Pipeline { tasks: vec![task], tail: Some(q_out), draining: None })
    }

    /// Add a source stage that pushes every element of `iter` into a new
    /// queue, then exits. Forbidden (at compile time) if an input queue
    /// already exists, since `from_iter` is only callable on an unstarted
    /// pipeline.
    pub async fn from_iter<T, I>(self, iter: I, options: SourceOptions) -> Result<Pipeline<T>>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T> + Send + 'static,
        I::IntoIter: Send + 'static,
    {
        self.source(
            move |q_out| async move {
                for item in iter {
                    q_out.put(item, true).await?;
                }
                Ok(())
            },
            options,
        )
        .await
    }
}

impl Default for Pipeline<Unstarted> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: Send + 'static> Pipeline<In> {
    fn take_tail(&mut self, caller: &str) -> Result<Cbq<In>> {
        self.tail
            .take()
            .ok_or_else(|| misuse(&format!("{caller}: pipeline tail already consumed or absent")))
    }

    /// Add a stage of `options.n_workers` workers running `f` over every
    /// item of the current tail, honoring the worker protocol described in
    /// `spec.md` §4.C. `Ok(None)` from `f` drops the item.
    pub async fn chain_workers<Out, F, Fut>(
        mut self,
        f: F,
        handler: ExceptionHandler<In, Out>,
        options: ChainWorkersOptions<Out>,
        stage_name: &'static str,
    ) -> Result<Pipeline<Out>>
    where
        In: Clone,
        Out: Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Out>>> + Send + 'static,
    {
        if options.q_out.is_some() && options.maxsize.is_some() {
            return Err(misuse("maxsize and an explicit q_out are mutually exclusive"));
        }

        let q_in = self.take_tail(stage_name)?;
        let n_workers = options.n_workers;

        let q_out = match options.q_out {
            Some(q_out) => q_out,
            None => {
                let capacity = options.maxsize.unwrap_or_else(|| 2 * n_workers.max(1));
                Cbq::new(capacity)
            },
        };

        let terminator = StageTerminator::new(n_workers, Some(q_out.clone()), stage_name).await?;
        let f = Arc::new(f);

        debug!(stage = stage_name, n_workers, capacity = q_out.capacity(), "spawning stage");

        let mut tasks = self.tasks;
        for _ in 0..n_workers {
            let q_in = q_in.clone();
            let q_out = q_out.clone();
            let terminator = terminator.clone();
            let f = Arc::clone(&f);
            let handler = handler.clone();
            tasks.push(tokio::spawn(
                async move { run_worker(q_in, Some(q_out), terminator, f, handler, stage_name).await },
            ));
        }

        Ok(Pipeline { tasks, tail: Some(q_out), draining: None })
    }

    /// Shorthand for [`Pipeline::chain_workers`] with a total `f: In -> Out`.
    pub async fn map<Out, F, Fut>(
        self,
        f: F,
        handler: ExceptionHandler<In, Out>,
        options: ChainWorkersOptions<Out>,
    ) -> Result<Pipeline<Out>>
    where
        In: Clone,
        Out: Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out>> + Send + 'static,
    {
        self.chain_workers(
            move |item| {
                let fut = f(item);
                async move { fut.await.map(Some) }
            },
            handler,
            options,
            "map",
        )
        .await
    }

    /// Add a stage that forwards `x` iff `pred(&x)`.
    pub async fn filter<P>(self, pred: P, options: ChainWorkersOptions<In>) -> Result<Pipeline<In>>
    where
        In: Clone,
        P: Fn(&In) -> bool + Send + Sync + 'static,
    {
        self.chain_workers(
            move |item| {
                let keep = pred(&item);
                async move { Ok(if keep { Some(item) } else { None }) }
            },
            ExceptionHandler::default(),
            options,
            "filter",
        )
        .await
    }

    /// Single-worker barrier stage: drains the entire input into memory,
    /// sorts with `compare`, then emits. Disables streaming; memory use is
    /// bounded by the full stream size (`spec.md` §4.D, §9 "Sort stage").
    pub async fn sort_by<C>(mut self, compare: C, options: SortOptions) -> Result<Pipeline<In>>
    where
        C: Fn(&In, &In) -> Ordering + Send + 'static,
    {
        let q_in = self.take_tail("sort")?;
        let capacity = options.maxsize.unwrap_or(1);
        let q_out: Cbq<In> = Cbq::new(capacity);
        let terminator = StageTerminator::new(1, Some(q_out.clone()), "sort").await?;

        debug!(stage = "sort", "spawning barrier stage");

        let task_q_out = q_out.clone();
        let task = tokio::spawn(async move {
            let outcome = sort_barrier(q_in, &task_q_out, compare).await;
            terminator.worker_done().await?;
            outcome
        });

        let mut tasks = self.tasks;
        tasks.push(task);
        Ok(Pipeline { tasks, tail: Some(q_out), draining: None })
    }

    /// `sort_by` keyed on `key(item)`, ascending unless `reverse`.
    pub async fn sort_by_key<K, F>(self, key: F, reverse: bool, options: SortOptions) -> Result<Pipeline<In>>
    where
        K: Ord,
        F: Fn(&In) -> K + Send + 'static,
    {
        self.sort_by(
            move |a, b| {
                let ordering = key(a).cmp(&key(b));
                if reverse { ordering.reverse() } else { ordering }
            },
            options,
        )
        .await
    }

    /// Terminal two-phase reduction (`spec.md` §4.D "Fold semantics"). `f`
    /// must be associative and commutative and `x0` an identity for the
    /// observed inputs — violating this is a user error, not one the
    /// framework can detect. Blocks until the sole result is available, then
    /// joins every spawned task (this fold's partition workers and every
    /// upstream stage) to surface any escalated error.
    pub async fn fold<F>(mut self, f: F, x0: In, options: FoldOptions) -> Result<In>
    where
        In: Clone,
        F: Fn(In, In) -> Result<In> + Send + Sync + 'static,
    {
        let q_in = self.take_tail("fold")?;
        let n_workers = options.n_workers;
        let f = Arc::new(f);

        let intermediate: Cbq<In> = Cbq::new(n_workers.max(1) + 1);
        intermediate.put(x0, true).await?;

        let partition_terminator = StageTerminator::new(n_workers, Some(intermediate.clone()), "fold_partition").await?;

        let mut tasks = self.tasks;
        for _ in 0..n_workers {
            let q_in = q_in.clone();
            let intermediate = intermediate.clone();
            let terminator = partition_terminator.clone();
            let f = Arc::clone(&f);
            tasks.push(tokio::spawn(async move {
                let outcome = fold_partition(q_in, &intermediate, f.as_ref()).await;
                terminator.worker_done().await?;
                outcome
            }));
        }

        let reduce_terminator: StageTerminator<In> = StageTerminator::new(1, None, "fold_reduce").await?;
        let reduced = fold_reduce(intermediate, f.as_ref()).await;
        reduce_terminator.worker_done().await?;

        for task in tasks.drain(..) {
            match task.await {
                Ok(Ok(())) => {},
                Ok(Err(error)) => return Err(error),
                Err(join_error) => return Err(join_panicked(join_error)),
            }
        }

        reduced
    }
}

impl<T: Send + 'static> Pipeline<T> {
    /// Pull the next item from the tail queue, or `None` at end-of-stream.
    ///
    /// The first call obtains the tail's underlying queue for the rest of
    /// the iteration session; a pipeline whose tail has already been
    /// consumed (by a prior `next`/`collect`, or never populated) fails
    /// with a `MisuseError` rather than racing a second consumer.
    pub async fn next(&mut self) -> Result<Option<T>> {
        if self.draining.is_none() {
            let tail = self.tail.take().ok_or_else(|| misuse("pipeline tail already consumed"))?;
            self.draining = Some(tail);
        }

        let Some(queue) = self.draining.as_ref() else {
            return Err(misuse("pipeline tail already consumed"));
        };

        match queue.get(true).await? {
            Slot::Item(item) => Ok(Some(item)),
            Slot::Eos => Ok(None),
        }
    }

    /// Drain the tail queue into a `Vec`, consuming the pipeline.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Await every spawned task, returning each one's result. Consumes the
    /// pipeline.
    pub async fn join(mut self) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        for task in self.tasks.drain(..) {
            let result = match task.await {
                Ok(result) => result,
                Err(join_error) => Err(join_panicked(join_error)),
            };
            results.push(result);
        }
        results
    }
}

async fn sort_barrier<T, C>(q_in: Cbq<T>, q_out: &Cbq<T>, compare: C) -> Result<()>
where
    T: Send + 'static,
    C: Fn(&T, &T) -> Ordering,
{
    let mut buffer = Vec::new();
    loop {
        match q_in.get(true).await? {
            Slot::Item(item) => buffer.push(item),
            Slot::Eos => break,
        }
    }

    buffer.sort_by(compare);
    for item in buffer {
        q_out.put(item, true).await?;
    }

    Ok(())
}

async fn fold_partition<T, F>(q_in: Cbq<T>, intermediate: &Cbq<T>, f: &F) -> Result<()>
where
    T: Send + 'static,
    F: Fn(T, T) -> Result<T>,
{
    let mut acc: Option<T> = None;
    loop {
        match q_in.get(true).await? {
            Slot::Item(item) => {
                acc = Some(match acc {
                    Some(previous) => f(previous, item)?,
                    None => item,
                });
            },
            Slot::Eos => break,
        }
    }

    if let Some(value) = acc {
        intermediate.put(value, true).await?;
    }

    Ok(())
}

async fn fold_reduce<T, F>(intermediate: Cbq<T>, f: &F) -> Result<T>
where
    T: Send + 'static,
    F: Fn(T, T) -> Result<T>,
{
    let mut acc = match intermediate.get(true).await? {
        Slot::Item(item) => item,
        Slot::Eos => {
            return Err(crate::errors::InvariantViolationError::new(
                "fold intermediate queue produced no items; x0 must always be present",
            )
            .into());
        },
    };

    loop {
        match intermediate.get(true).await? {
            Slot::Item(item) => acc = f(acc, item)?,
            Slot::Eos => return Ok(acc),
        }
    }
}
