//! Blocking handoff queue with shutdown semantics.
//!
//! Producers enqueue items; consumers wait for them. An enqueue that finds a
//! waiting consumer hands the item over directly, otherwise it is buffered.
//! At any instant at most one of "buffered items" and "waiting consumers" is
//! non-empty.
//!
//! [`HandoffQueue::shutdown`] is terminal: every current and future wait
//! resolves to `None` (end of sequence) and no further items are accepted.
//! Items buffered before shutdown stay available to [`HandoffQueue::dequeue`]
//! and [`HandoffQueue::drain`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How an enqueue completes a consumer that is already waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Complete the waiter from the enqueuing task.
    Inline,
    /// Complete the waiter from a separate runtime task.
    Deferred,
}

/// Error returned by [`HandoffQueue::dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DequeueError {
    #[error("dequeue cancelled")]
    Cancelled,
}

type Waiter<T> = oneshot::Sender<Option<T>>;

struct State<T> {
    items: VecDeque<T>,
    waiters: VecDeque<Waiter<T>>,
    shutdown: bool,
}

/// FIFO handoff between producers and blocking consumers.
pub struct HandoffQueue<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T: Send + 'static> HandoffQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
                shutdown: false,
            })),
        }
    }

    /// Hands `item` to the oldest waiting consumer, or buffers it.
    ///
    /// Returns the item back if the queue has been shut down.
    pub fn enqueue(&self, item: T, dispatch: Dispatch) -> Result<(), T> {
        let waiter = {
            let mut state = lock(&self.state);
            if state.shutdown {
                return Err(item);
            }
            match next_waiter(&mut state) {
                Some(waiter) => waiter,
                None => {
                    state.items.push_back(item);
                    return Ok(());
                }
            }
        };

        // Waiters are completed outside the lock.
        match (dispatch, tokio::runtime::Handle::try_current()) {
            (Dispatch::Deferred, Ok(handle)) => {
                let state = self.state.clone();
                handle.spawn(async move { deliver(&state, waiter, item) });
            }
            _ => deliver(&self.state, waiter, item),
        }
        Ok(())
    }

    /// Waits for the next item.
    ///
    /// Returns `Ok(None)` once the queue is shut down and no buffered items
    /// remain. Fails with [`DequeueError::Cancelled`] if `cancel` fires first.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<T>, DequeueError> {
        let mut rx = {
            let mut state = lock(&self.state);
            if let Some(item) = state.items.pop_front() {
                return Ok(Some(item));
            }
            if state.shutdown {
                return Ok(None);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        tokio::select! {
            biased;
            result = &mut rx => Ok(result.unwrap_or(None)),
            _ = cancel.cancelled() => {
                rx.close();
                // An item may have been handed over before the close took effect.
                match rx.try_recv() {
                    Ok(Some(item)) => Ok(Some(item)),
                    _ => Err(DequeueError::Cancelled),
                }
            }
        }
    }

    /// Stops buffering and wakes every waiting consumer with end of sequence.
    /// Idempotent.
    pub fn shutdown(&self) {
        let waiters = {
            let mut state = lock(&self.state);
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            std::mem::take(&mut state.waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(None);
        }
    }

    /// Removes and returns every buffered item.
    pub fn drain(&self) -> Vec<T> {
        lock(&self.state).items.drain(..).collect()
    }

    /// Number of buffered items not yet delivered.
    pub fn pending_count(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.state).shutdown
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        lock(&self.state).waiters.len()
    }
}

impl<T: Send + 'static> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(state: &Mutex<State<T>>) -> MutexGuard<'_, State<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pops the oldest waiter whose consumer is still listening.
fn next_waiter<T>(state: &mut State<T>) -> Option<Waiter<T>> {
    while let Some(waiter) = state.waiters.pop_front() {
        if !waiter.is_closed() {
            return Some(waiter);
        }
    }
    None
}

/// Completes `waiter` with `item`. If the consumer went away in the meantime
/// the item moves on to the next waiter, or back into the buffer.
fn deliver<T>(state: &Mutex<State<T>>, mut waiter: Waiter<T>, item: T) {
    let mut item = item;
    loop {
        match waiter.send(Some(item)) {
            Ok(()) => return,
            Err(returned) => {
                let Some(returned) = returned else { return };
                item = returned;
                let mut guard = lock(state);
                match next_waiter(&mut guard) {
                    Some(next) => waiter = next,
                    None => {
                        guard.items.push_front(item);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    async fn wait_for_waiters<T: Send + 'static>(queue: &HandoffQueue<T>, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.waiter_count() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("waiters should register");
    }

    #[tokio::test]
    async fn buffered_items_come_out_in_order() {
        let queue = HandoffQueue::new();
        for i in 0..3 {
            queue.enqueue(i, Dispatch::Inline).unwrap();
        }
        assert_eq!(queue.pending_count(), 3);

        let cancel = CancellationToken::new();
        for i in 0..3 {
            assert_eq!(queue.dequeue(&cancel).await, Ok(Some(i)));
        }
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn enqueue_hands_over_to_waiting_consumer() {
        let queue = Arc::new(HandoffQueue::new());
        let q = queue.clone();
        let consumer = tokio::spawn(async move { q.dequeue(&CancellationToken::new()).await });

        wait_for_waiters(&queue, 1).await;
        queue.enqueue("conn", Dispatch::Inline).unwrap();

        assert_eq!(consumer.await.unwrap(), Ok(Some("conn")));
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn waiters_are_served_first_come_first_served() {
        let queue = Arc::new(HandoffQueue::new());

        let q = queue.clone();
        let first = tokio::spawn(async move { q.dequeue(&CancellationToken::new()).await });
        wait_for_waiters(&queue, 1).await;
        let q = queue.clone();
        let second = tokio::spawn(async move { q.dequeue(&CancellationToken::new()).await });
        wait_for_waiters(&queue, 2).await;

        queue.enqueue(1, Dispatch::Inline).unwrap();
        queue.enqueue(2, Dispatch::Inline).unwrap();

        assert_eq!(first.await.unwrap(), Ok(Some(1)));
        assert_eq!(second.await.unwrap(), Ok(Some(2)));
    }

    #[tokio::test]
    async fn deferred_dispatch_delivers() {
        let queue = Arc::new(HandoffQueue::new());
        let q = queue.clone();
        let consumer = tokio::spawn(async move { q.dequeue(&CancellationToken::new()).await });

        wait_for_waiters(&queue, 1).await;
        queue.enqueue(7u32, Dispatch::Deferred).unwrap();

        assert_eq!(consumer.await.unwrap(), Ok(Some(7)));
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_consumers_with_end_of_sequence() {
        let queue = Arc::new(HandoffQueue::<u32>::new());
        let mut consumers = Vec::new();
        for _ in 0..3 {
            let q = queue.clone();
            consumers.push(tokio::spawn(async move {
                q.dequeue(&CancellationToken::new()).await
            }));
        }
        wait_for_waiters(&queue, 3).await;

        queue.shutdown();
        for consumer in consumers {
            assert_eq!(consumer.await.unwrap(), Ok(None));
        }

        // Future waits end immediately too.
        assert_eq!(queue.dequeue(&CancellationToken::new()).await, Ok(None));
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_returns_item() {
        let queue = HandoffQueue::new();
        queue.shutdown();
        queue.shutdown();

        assert_eq!(queue.enqueue(5, Dispatch::Inline), Err(5));
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.is_shutdown());
    }

    #[tokio::test]
    async fn buffered_items_survive_shutdown() {
        let queue = HandoffQueue::new();
        queue.enqueue(1, Dispatch::Inline).unwrap();
        queue.enqueue(2, Dispatch::Inline).unwrap();
        queue.shutdown();

        let cancel = CancellationToken::new();
        assert_eq!(queue.dequeue(&cancel).await, Ok(Some(1)));
        assert_eq!(queue.drain(), vec![2]);
        assert_eq!(queue.dequeue(&cancel).await, Ok(None));
    }

    #[tokio::test]
    async fn cancelled_dequeue_does_not_swallow_later_items() {
        let queue = Arc::new(HandoffQueue::new());
        let cancel = CancellationToken::new();

        let q = queue.clone();
        let c = cancel.clone();
        let consumer = tokio::spawn(async move { q.dequeue(&c).await });
        wait_for_waiters(&queue, 1).await;

        cancel.cancel();
        assert_eq!(consumer.await.unwrap(), Err(DequeueError::Cancelled));

        queue.enqueue(9, Dispatch::Inline).unwrap();
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(
            queue.dequeue(&CancellationToken::new()).await,
            Ok(Some(9))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_item_is_delivered_exactly_once() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 250;

        let queue = Arc::new(HandoffQueue::new());
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let q = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Ok(Some(item)) = q.dequeue(&CancellationToken::new()).await {
                    got.push(item);
                }
                got
            }));
        }

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let q = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..PER_PRODUCER {
                    let dispatch = if i % 2 == 0 {
                        Dispatch::Inline
                    } else {
                        Dispatch::Deferred
                    };
                    q.enqueue(p * PER_PRODUCER + i, dispatch).unwrap();
                    if i % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        // Let deferred deliveries land before ending the sequence.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if queue.pending_count() == 0 && queue.waiter_count() == 4 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("consumers should drain the queue");
        queue.shutdown();

        let mut seen = HashSet::new();
        for consumer in consumers {
            for item in consumer.await.unwrap() {
                assert!(seen.insert(item), "item {item} delivered twice");
            }
        }
        assert_eq!(seen.len(), (PRODUCERS * PER_PRODUCER) as usize);
    }
}
