//! The Worker Wrapper: adapts a pure per-item function into a stage worker
//! that honors the CBQ protocol (`spec.md` §4.C).

use crate::errors::user_function_error;
use crate::queue::{Cbq, Slot};
use crate::terminator::StageTerminator;
use conveyor_shared::{ErrorEnvelope, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// What to do when a user-supplied stage function returns `Err`.
///
/// `Ok(None)` from `f` itself is the framework's drop marker (unifying
/// `spec.md`'s separate `discard_none` flag with `Option`); these handlers
/// only fire when `f` actually raises.
pub enum ExceptionHandler<In, Out> {
    /// Escalate: the worker exits with this error, observable at `join`.
    /// Sibling stages are not auto-cancelled. The default.
    Raise,
    /// Discard the input and the error; continue with the next item.
    Ignore,
    /// A user-supplied decision: return `Ok(Some(out))` to forward a
    /// substitute value, `Ok(None)` to drop, `Err(_)` to escalate.
    Custom(Arc<dyn Fn(In, ErrorEnvelope) -> Result<Option<Out>> + Send + Sync>),
}

impl<In, Out> Clone for ExceptionHandler<In, Out> {
    fn clone(&self) -> Self {
        match self {
            Self::Raise => Self::Raise,
            Self::Ignore => Self::Ignore,
            Self::Custom(handler) => Self::Custom(Arc::clone(handler)),
        }
    }
}

impl<In, Out> Default for ExceptionHandler<In, Out> {
    fn default() -> Self {
        Self::Raise
    }
}

impl<In, Out> ExceptionHandler<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Build a `Custom` handler from a plain closure.
    pub fn custom(handler: impl Fn(In, ErrorEnvelope) -> Result<Option<Out>> + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(handler))
    }

    /// Forward the original input unchanged, as if it had passed the stage
    /// untouched. Only constructible when `In: Into<Out>` — `spec.md` §4.C's
    /// `forward_input` handler requires the input to actually be a valid
    /// output.
    pub fn forward_input() -> Self
    where
        In: Into<Out> + Clone,
    {
        Self::custom(|input, _error| Ok(Some(input.into())))
    }

    fn handle(&self, input: In, error: ErrorEnvelope, stage_name: &'static str) -> Result<Option<Out>> {
        match self {
            Self::Raise => Err(user_function_error(stage_name, error)),
            Self::Ignore => Ok(None),
            Self::Custom(handler) => handler(input, error),
        }
    }
}

/// Run one worker of a stage: read `q_in` until `Eos`, apply `f` to each
/// item, forward non-dropped results to `q_out`, and report to `terminator`
/// on exit regardless of how the loop ended.
pub async fn run_worker<In, Out, F, Fut>(
    q_in: Cbq<In>,
    q_out: Option<Cbq<Out>>,
    terminator: StageTerminator<Out>,
    f: Arc<F>,
    handler: ExceptionHandler<In, Out>,
    stage_name: &'static str,
) -> Result<()>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Out>>> + Send + 'static,
{
    let outcome = worker_loop(&q_in, q_out.as_ref(), f.as_ref(), &handler, stage_name).await;
    terminator.worker_done().await?;
    outcome
}

async fn worker_loop<In, Out, F, Fut>(
    q_in: &Cbq<In>,
    q_out: Option<&Cbq<Out>>,
    f: &F,
    handler: &ExceptionHandler<In, Out>,
    stage_name: &'static str,
) -> Result<()>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Fut,
    Fut: Future<Output = Result<Option<Out>>>,
{
    loop {
        let item = match q_in.get(true).await? {
            Slot::Eos => return Ok(()),
            Slot::Item(item) => item,
        };

        let original = item.clone();
        let produced = match f(item).await {
            Ok(produced) => produced,
            Err(error) => {
                warn!(stage = stage_name, %error, "user function error, routing to exception handler");
                handler.handle(original, error, stage_name)?
            },
        };

        if let Some(out) = produced {
            if let Some(q_out) = q_out {
                q_out.put(out, true).await?;
            }
        }
    }
}
