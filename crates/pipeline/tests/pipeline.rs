//! End-to-end scenarios for the pipeline orchestrator.

use conveyor_pipeline::prelude::*;
use conveyor_shared::{ErrorClass, ErrorCode, ErrorEnvelope, Result};

#[tokio::test]
async fn filter_map_fold_sums_twice_the_odds() -> Result<()> {
    let sum = Pipeline::new()
        .from_iter(0..100i64, SourceOptions::default())
        .await?
        .filter(|x| x % 2 == 1, ChainWorkersOptions::default())
        .await?
        .map(
            |x| async move { Ok(x * 2) },
            ExceptionHandler::default(),
            ChainWorkersOptions { n_workers: 8, ..ChainWorkersOptions::default() },
        )
        .await?
        .fold(|a, b| Ok(a + b), 0, FoldOptions { n_workers: 5 })
        .await?;

    assert_eq!(sum, 5000);
    Ok(())
}

#[tokio::test]
async fn map_then_sort_produces_ascending_squares() -> Result<()> {
    let squares = Pipeline::new()
        .from_iter(0..10i64, SourceOptions::default())
        .await?
        .map(
            |x| async move { Ok(x * x) },
            ExceptionHandler::default(),
            ChainWorkersOptions { n_workers: 10, ..ChainWorkersOptions::default() },
        )
        .await?
        .sort_by(|a, b| a.cmp(b), SortOptions::default())
        .await?
        .collect()
        .await?;

    assert_eq!(squares, vec![0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);
    Ok(())
}

#[tokio::test]
async fn forward_input_handler_preserves_unprocessable_items() -> Result<()> {
    let tail = Pipeline::new()
        .from_iter(0..100i64, SourceOptions::default())
        .await?
        .map(
            |x| async move {
                if x % 2 == 1 {
                    Err(ErrorEnvelope::unexpected(
                        ErrorCode::internal(),
                        "odd values are not processable",
                        ErrorClass::NonRetriable,
                    ))
                } else {
                    Ok(x * 2)
                }
            },
            ExceptionHandler::forward_input(),
            ChainWorkersOptions::default(),
        )
        .await?
        .collect()
        .await?;

    let sum: i64 = tail.into_iter().sum();
    let expected: i64 = (0..100i64)
        .map(|x| if x % 2 == 1 { x } else { x * 2 })
        .sum();
    assert_eq!(sum, expected);
    Ok(())
}

#[tokio::test]
async fn ignore_handler_drops_failing_items() -> Result<()> {
    let tail = Pipeline::new()
        .from_iter(0..10i64, SourceOptions::default())
        .await?
        .map(
            |x| async move {
                if x == 7 {
                    Err(ErrorEnvelope::unexpected(
                        ErrorCode::internal(),
                        "unlucky",
                        ErrorClass::NonRetriable,
                    ))
                } else {
                    Ok(x)
                }
            },
            ExceptionHandler::Ignore,
            ChainWorkersOptions::default(),
        )
        .await?
        .collect()
        .await?;

    assert_eq!(tail.len(), 9);
    assert!(!tail.contains(&7));
    Ok(())
}

#[tokio::test]
async fn raise_handler_surfaces_error_through_join() -> Result<()> {
    // The source queue is sized to hold every item up front: `join` waits
    // unconditionally and the core provides no auto-cancellation (`spec.md`
    // §6 "Cancellation and timeouts"), so an upstream stage that stays
    // backpressured against a stage that stopped reading after an escalated
    // error would never finish. Sizing the source's own queue past the input
    // length keeps it from ever blocking on this downstream stage.
    let mut pipeline = Pipeline::new()
        .from_iter(0..10i64, SourceOptions { n_workers: 1, maxsize: Some(10) })
        .await?
        .map(
            |x| async move {
                if x == 3 {
                    Err(ErrorEnvelope::unexpected(
                        ErrorCode::internal(),
                        "boom",
                        ErrorClass::NonRetriable,
                    ))
                } else {
                    Ok(x)
                }
            },
            ExceptionHandler::Raise,
            ChainWorkersOptions { n_workers: 1, ..ChainWorkersOptions::default() },
        )
        .await?;

    // Drain the tail so the single worker isn't stuck backpressured on a full
    // output queue while we wait for its error at join.
    while pipeline.next().await.is_ok_and(|item| item.is_some()) {}

    let results = pipeline.join().await;
    assert!(results.iter().any(Result::is_err));
    Ok(())
}

#[tokio::test]
async fn empty_input_fold_returns_identity() -> Result<()> {
    let result = Pipeline::new()
        .from_iter(std::iter::empty::<i64>(), SourceOptions::default())
        .await?
        .fold(|a, b| Ok(a + b), 0, FoldOptions { n_workers: 4 })
        .await?;

    assert_eq!(result, 0);
    Ok(())
}

#[tokio::test]
async fn mutually_exclusive_maxsize_and_q_out_is_misuse() -> Result<()> {
    let explicit_out: Cbq<i64> = Cbq::new(4);
    let result = Pipeline::new()
        .from_iter(0..4i64, SourceOptions::default())
        .await?
        .map(
            |x| async move { Ok(x) },
            ExceptionHandler::default(),
            ChainWorkersOptions { q_out: Some(explicit_out), maxsize: Some(8), ..ChainWorkersOptions::default() },
        )
        .await;

    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn repeated_next_after_eos_keeps_returning_none() -> Result<()> {
    let mut pipeline = Pipeline::new().from_iter(0..4i64, SourceOptions::default()).await?;
    while pipeline.next().await?.is_some() {}

    assert!(pipeline.next().await?.is_none());
    assert!(pipeline.next().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn chaining_past_a_draining_tail_is_misuse() -> Result<()> {
    let mut pipeline = Pipeline::new().from_iter(0..4i64, SourceOptions::default()).await?;
    // Obtaining the iterator clears the tail reference immediately.
    let _ = pipeline.next().await?;

    let result = pipeline
        .filter(|x| *x % 2 == 0, ChainWorkersOptions::default())
        .await;
    assert!(result.is_err());
    Ok(())
}
