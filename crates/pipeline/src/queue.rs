//! The Closable Bounded Queue (CBQ): a multi-producer / multi-consumer bounded
//! FIFO with a one-way `close` transition.
//!
//! `close` uses the sentinel-injection strategy `spec.md` §4.A documents as
//! the simpler of its two observed source variants: the critical section that
//! flips the closed flag also hands [`Slot::Eos`] directly to every
//! currently-registered reader, so no reader can be suspended at a moment
//! "close is observed-complete" without also being woken in the same step.

use crate::errors::{ClosedForPutError, CloseTwiceError, WouldBlockError};
use conveyor_shared::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};

/// A value read from a [`Cbq`]: either a buffered item or the end-of-stream
/// marker. `Eos` is framework-owned and never constructible from a user item,
/// satisfying `spec.md` §3's "distinguished sentinel" requirement without
/// reserving a value out of the item type's own domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot<T> {
    /// A buffered item delivered in FIFO order.
    Item(T),
    /// End-of-stream: the queue is closed and fully drained.
    Eos,
}

impl<T> Slot<T> {
    /// Returns true if this slot is the end-of-stream marker.
    #[must_use]
    pub const fn is_eos(&self) -> bool {
        matches!(self, Self::Eos)
    }

    /// Unwrap a buffered item, returning `None` for `Eos`.
    #[must_use]
    pub fn into_item(self) -> Option<T> {
        match self {
            Self::Item(value) => Some(value),
            Self::Eos => None,
        }
    }
}

/// Randomized delay injected before blocking queue operations, purely a
/// testing aid for race amplification. Must never change queue semantics.
#[derive(Debug, Clone, Copy)]
pub struct FuzzConfig {
    max_delay: Duration,
}

impl FuzzConfig {
    /// Create a fuzz configuration with a maximum per-operation delay.
    #[must_use]
    pub const fn new(max_delay: Duration) -> Self {
        Self { max_delay }
    }

    async fn sleep_random(self) {
        if self.max_delay.is_zero() {
            return;
        }
        let millis = rand::random::<u64>() % (self.max_delay.as_millis() as u64 + 1);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

/// Outcome delivered to a writer parked in `waiting_writers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    /// The item was moved into the buffer or handed to a reader.
    Delivered,
    /// The queue closed while this writer was parked; the item is dropped.
    Closed,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    waiting_readers: VecDeque<oneshot::Sender<Slot<T>>>,
    // The item travels with the parked writer itself, not just a wake
    // signal: a capacity-0 queue never frees buffer space, so a writer that
    // parked before any reader arrived must still be reachable by the next
    // `get`, which pops straight from this queue rather than the buffer.
    waiting_writers: VecDeque<(T, oneshot::Sender<WriteOutcome>)>,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            closed: false,
            waiting_readers: VecDeque::new(),
            waiting_writers: VecDeque::new(),
        }
    }
}

/// A closable bounded multi-producer / multi-consumer FIFO queue.
///
/// Cloning shares the underlying state (it is an `Arc` handle), matching the
/// teacher's `BoundedQueue<T>` clone semantics.
pub struct Cbq<T> {
    capacity: usize,
    state: Arc<Mutex<QueueState<T>>>,
    fuzz: Option<FuzzConfig>,
}

impl<T> Clone for Cbq<T> {
    fn clone(&self) -> Self {
        Self {
            capacity: self.capacity,
            state: Arc::clone(&self.state),
            fuzz: self.fuzz,
        }
    }
}

impl<T: Send + 'static> Cbq<T> {
    /// Create a new queue with the given capacity. Capacity `0` is permitted
    /// and models a rendezvous handoff between a single put and a single get.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Arc::new(Mutex::new(QueueState::new())),
            fuzz: None,
        }
    }

    /// Create a new queue with a randomized delay before blocking operations.
    #[must_use]
    pub fn with_fuzz(capacity: usize, fuzz: FuzzConfig) -> Self {
        Self {
            capacity,
            state: Arc::new(Mutex::new(QueueState::new())),
            fuzz: Some(fuzz),
        }
    }

    /// Returns the configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of buffered items (not including waiters).
    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    /// Returns true when no items are currently buffered.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }

    /// Monotone observation of the closed flag.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Enqueue an item, suspending while the queue is full (`blocking = true`)
    /// or failing immediately with [`WouldBlockError`] (`blocking = false`).
    ///
    /// Fails with [`ClosedForPutError`] if the queue is closed, including if
    /// it is closed while this call was suspended waiting for capacity.
    pub async fn put(&self, item: T, blocking: bool) -> Result<()> {
        if let Some(fuzz) = self.fuzz {
            fuzz.sleep_random().await;
        }

        let mut item = item;
        let completion = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ClosedForPutError.into());
            }

            // A reader suspended on `get` gets the item directly, bypassing
            // the buffer entirely — this is what makes capacity 0
            // (rendezvous) work when the reader parked first.
            while let Some(reader) = state.waiting_readers.pop_front() {
                match reader.send(Slot::Item(item)) {
                    Ok(()) => return Ok(()),
                    Err(Slot::Item(returned)) => item = returned,
                    Err(Slot::Eos) => unreachable!("put never sends Eos"),
                }
            }

            if state.items.len() < self.capacity {
                state.items.push_back(item);
                return Ok(());
            }

            if !blocking {
                return Err(WouldBlockError.into());
            }

            // No reader is waiting and the buffer (if any) is full: park
            // with the item attached so a reader that arrives later — even
            // on a capacity-0 queue, which never frees buffer space — can
            // still find it.
            let (tx, rx) = oneshot::channel();
            state.waiting_writers.push_back((item, tx));
            rx
        };

        match completion.await {
            Ok(WriteOutcome::Delivered) => Ok(()),
            Ok(WriteOutcome::Closed) | Err(_) => Err(ClosedForPutError.into()),
        }
    }

    /// Dequeue the next item, suspending while the queue is empty and open
    /// (`blocking = true`), returning [`Slot::Eos`] once the queue is closed
    /// and drained, or failing with [`WouldBlockError`] for a non-blocking
    /// call against an empty, open queue.
    pub async fn get(&self, blocking: bool) -> Result<Slot<T>> {
        if let Some(fuzz) = self.fuzz {
            fuzz.sleep_random().await;
        }

        let reader_gate = {
            let mut state = self.state.lock().await;

            if let Some(item) = state.items.pop_front() {
                // Freed a slot: migrate one parked writer's item into the
                // buffer so it can stop waiting.
                while let Some((pending, ack)) = state.waiting_writers.pop_front() {
                    state.items.push_back(pending);
                    if ack.send(WriteOutcome::Delivered).is_ok() {
                        break;
                    }
                    // Receiver already gone (its future was dropped); undo
                    // the migration and try the next parked writer.
                    state.items.pop_back();
                }
                return Ok(Slot::Item(item));
            }

            // The buffer is empty but a writer may still be parked directly
            // — always true for capacity 0, and possible transiently on any
            // queue between a writer parking and a reader arriving.
            if let Some((pending, ack)) = state.waiting_writers.pop_front() {
                let _ = ack.send(WriteOutcome::Delivered);
                return Ok(Slot::Item(pending));
            }

            if state.closed {
                return Ok(Slot::Eos);
            }

            if !blocking {
                return Err(WouldBlockError.into());
            }

            let (tx, rx) = oneshot::channel::<Slot<T>>();
            state.waiting_readers.push_back(tx);
            rx
        };

        match reader_gate.await {
            Ok(slot) => Ok(slot),
            // The sender side was dropped without a send; this only happens
            // if the queue's state was torn down mid-wait. Treat it as EOS
            // rather than propagating a spurious error to callers that are
            // only waiting for "item or done".
            Err(_) => Ok(Slot::Eos),
        }
    }

    /// Transition the queue from open to closed.
    ///
    /// With `once = true` (the default convention callers should use),
    /// closing an already-closed queue fails with [`CloseTwiceError`]. With
    /// `once = false` it is a no-op.
    ///
    /// Every currently-suspended reader is woken with `Eos` in the same
    /// critical section that flips the flag; any reader that enrolls after
    /// this call observes `closed = true` and short-circuits to `Eos` without
    /// waiting. Suspended writers are woken so their next loop iteration
    /// observes `closed` and fails with `ClosedForPutError`.
    pub async fn close(&self, once: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return if once { Err(CloseTwiceError.into()) } else { Ok(()) };
        }

        state.closed = true;
        for reader in state.waiting_readers.drain(..) {
            let _ = reader.send(Slot::Eos);
        }
        for (_item, ack) in state.waiting_writers.drain(..) {
            let _ = ack.send(WriteOutcome::Closed);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn scenario_put_put_close_drains_then_eos() -> Result<()> {
        let q: Cbq<i32> = Cbq::new(4);
        q.put(1, true).await?;
        q.put(2, true).await?;
        q.close(true).await?;

        assert_eq!(q.get(true).await?, Slot::Item(1));
        assert_eq!(q.get(true).await?, Slot::Item(2));
        assert_eq!(q.get(true).await?, Slot::Eos);
        assert_eq!(q.get(true).await?, Slot::Eos);
        Ok(())
    }

    #[tokio::test]
    async fn scenario_close_then_get_returns_eos() -> Result<()> {
        let q: Cbq<i32> = Cbq::new(1);
        q.close(true).await?;
        assert_eq!(q.get(true).await?, Slot::Eos);
        Ok(())
    }

    #[tokio::test]
    async fn scenario_close_then_put_fails() -> Result<()> {
        let q: Cbq<i32> = Cbq::new(1);
        q.close(true).await?;
        let err = q.put(1, true).await.expect_err("put after close must fail");
        assert_eq!(err.code, conveyor_shared::ErrorCode::new("pipeline", "closed_for_put"));
        Ok(())
    }

    #[tokio::test]
    async fn close_twice_fails_when_once() -> Result<()> {
        let q: Cbq<i32> = Cbq::new(1);
        q.close(true).await?;
        let err = q.close(true).await.expect_err("second close must fail");
        assert_eq!(err.code, conveyor_shared::ErrorCode::new("pipeline", "close_twice"));
        Ok(())
    }

    #[tokio::test]
    async fn close_twice_is_noop_when_not_once() -> Result<()> {
        let q: Cbq<i32> = Cbq::new(1);
        q.close(true).await?;
        q.close(false).await?;
        Ok(())
    }

    #[tokio::test]
    async fn reader_blocked_on_empty_queue_wakes_on_close() -> Result<()> {
        let q: Cbq<i32> = Cbq::new(1);
        let reader = {
            let q = q.clone();
            tokio::spawn(async move { q.get(true).await })
        };

        tokio::time::sleep(StdDuration::from_millis(10)).await;
        q.close(true).await?;

        let result = tokio::time::timeout(StdDuration::from_millis(200), reader)
            .await
            .expect("reader must not hang")
            .expect("join must succeed")?;
        assert_eq!(result, Slot::Eos);
        Ok(())
    }

    #[tokio::test]
    async fn rendezvous_capacity_zero_hands_off_directly() -> Result<()> {
        let q: Cbq<i32> = Cbq::new(0);
        let reader = {
            let q = q.clone();
            tokio::spawn(async move { q.get(true).await })
        };

        tokio::time::sleep(StdDuration::from_millis(10)).await;
        q.put(42, true).await?;

        let result = tokio::time::timeout(StdDuration::from_millis(200), reader)
            .await
            .expect("reader must not hang")
            .expect("join must succeed")?;
        assert_eq!(result, Slot::Item(42));
        Ok(())
    }

    #[tokio::test]
    async fn rendezvous_capacity_zero_hands_off_when_writer_parks_first() -> Result<()> {
        // A capacity-0 queue never frees buffer space, so a `put` that parks
        // before any reader has arrived must still be reachable by the next
        // `get` rather than only by a `get` already waiting.
        let q: Cbq<i32> = Cbq::new(0);
        let putter = {
            let q = q.clone();
            tokio::spawn(async move { q.put(42, true).await })
        };

        tokio::time::sleep(StdDuration::from_millis(10)).await;
        let result = tokio::time::timeout(StdDuration::from_millis(200), q.get(true))
            .await
            .expect("getter must not hang")?;
        assert_eq!(result, Slot::Item(42));

        tokio::time::timeout(StdDuration::from_millis(200), putter)
            .await
            .expect("putter must not hang")
            .expect("join must succeed")?;
        Ok(())
    }

    #[tokio::test]
    async fn non_blocking_put_on_full_queue_would_block() -> Result<()> {
        let q: Cbq<i32> = Cbq::new(1);
        q.put(1, true).await?;
        let err = q.put(2, false).await.expect_err("full queue must reject");
        assert_eq!(err.code, conveyor_shared::ErrorCode::new("pipeline", "would_block"));
        Ok(())
    }

    #[tokio::test]
    async fn non_blocking_get_on_empty_open_queue_would_block() -> Result<()> {
        let q: Cbq<i32> = Cbq::new(1);
        let err = q.get(false).await.expect_err("empty open queue must reject");
        assert_eq!(err.code, conveyor_shared::ErrorCode::new("pipeline", "would_block"));
        Ok(())
    }

    #[tokio::test]
    async fn fifo_order_preserved_across_multiple_items() -> Result<()> {
        let q: Cbq<i32> = Cbq::new(8);
        for value in 0..8 {
            q.put(value, true).await?;
        }
        q.close(true).await?;

        for expected in 0..8 {
            assert_eq!(q.get(true).await?, Slot::Item(expected));
        }
        assert_eq!(q.get(true).await?, Slot::Eos);
        Ok(())
    }

    #[tokio::test]
    async fn getter_and_closer_race_never_hangs() {
        for _ in 0..100 {
            let q: Cbq<i32> = Cbq::new(1);
            let q2 = q.clone();
            let getter = tokio::spawn(async move { q2.get(true).await });
            let closer = tokio::spawn(async move { q.close(true).await });

            let (get_result, close_result) = tokio::join!(getter, closer);
            let get_result = get_result.expect("getter must not panic");
            let _ = close_result.expect("closer must not panic");
            assert!(get_result.is_ok());
        }
    }

    #[tokio::test]
    async fn putter_getter_closer_race_agrees_on_outcome() {
        for _ in 0..100 {
            let q: Cbq<i32> = Cbq::new(0);
            let putter_q = q.clone();
            let getter_q = q.clone();
            let closer_q = q.clone();

            let putter = tokio::spawn(async move { putter_q.put(7, true).await });
            let getter = tokio::spawn(async move { getter_q.get(true).await });
            let closer = tokio::spawn(async move { closer_q.close(true).await });

            let (put_result, get_result, _) = tokio::join!(putter, getter, closer);
            let put_ok = put_result.expect("putter must not panic").is_ok();
            let got = get_result.expect("getter must not panic").expect("getter must not error");

            if put_ok {
                // The put succeeded, so the getter must have observed either
                // that same item or (if some other get drained it first in
                // a differently-ordered run) Eos is impossible here because
                // there is exactly one getter and one item.
                assert_eq!(got, Slot::Item(7));
            } else {
                assert_eq!(got, Slot::Eos);
            }
        }
    }

    #[tokio::test]
    async fn many_putters_getters_small_capacity_late_closer_no_lost_items() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        for _ in 0..20 {
            let q: Cbq<i32> = Cbq::new(2);
            let putters = 50;
            let getters = 50;

            let successful_puts = Arc::new(AtomicUsize::new(0));
            let items_got = Arc::new(AtomicUsize::new(0));
            let stopiter_count = Arc::new(AtomicUsize::new(0));

            let mut put_handles = Vec::new();
            for value in 0..putters {
                let q = q.clone();
                let successful_puts = Arc::clone(&successful_puts);
                put_handles.push(tokio::spawn(async move {
                    if q.put(value, true).await.is_ok() {
                        successful_puts.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }

            let mut get_handles = Vec::new();
            for _ in 0..getters {
                let q = q.clone();
                let items_got = Arc::clone(&items_got);
                let stopiter_count = Arc::clone(&stopiter_count);
                get_handles.push(tokio::spawn(async move {
                    match q.get(true).await {
                        Ok(Slot::Item(_)) => {
                            items_got.fetch_add(1, Ordering::SeqCst);
                        },
                        Ok(Slot::Eos) => {
                            stopiter_count.fetch_add(1, Ordering::SeqCst);
                        },
                        Err(_) => {},
                    }
                }));
            }

            tokio::time::sleep(StdDuration::from_millis(5)).await;
            let _ = q.close(true).await;

            for handle in put_handles {
                let _ = handle.await;
            }
            for handle in get_handles {
                let _ = handle.await;
            }

            let remaining = q.len().await;
            let puts = successful_puts.load(Ordering::SeqCst);
            let got = items_got.load(Ordering::SeqCst);
            let stopped = stopiter_count.load(Ordering::SeqCst);

            assert_eq!(remaining + got, puts);
            assert_eq!(stopped + got, getters);
        }
    }

    proptest::proptest! {
        #[test]
        fn fifo_multiset_preserved_for_any_put_sequence(values in proptest::collection::vec(0i32..1000, 0..64)) {
            let runtime = tokio::runtime::Runtime::new().expect("runtime must start");
            runtime.block_on(async {
                let q: Cbq<i32> = Cbq::new(values.len().max(1));
                for &value in &values {
                    q.put(value, true).await.expect("put before close must succeed");
                }
                q.close(true).await.expect("first close must succeed");

                let mut observed = Vec::new();
                loop {
                    match q.get(true).await.expect("get must not error") {
                        Slot::Item(value) => observed.push(value),
                        Slot::Eos => break,
                    }
                }

                prop_assert_eq!(observed, values);
                Ok(())
            })?;
        }
    }
}
