use std::{
    collections::{HashMap, HashSet},
    future::Future,
    hash::Hash,
    mem,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use crate::{
    registry::{Registry, WaveId},
    waiters::WaiterToken,
};

/// Coalesces concurrent key-set lookups into shared waves.
///
/// A scheduler is built around one asynchronous lookup (the *action*):
/// give it a set of keys, it eventually yields a key-to-value map or an
/// error. `query` never invokes the action more than once for the same
/// wave of callers:
///
/// - a caller whose keys are all covered by the wave currently in
///   flight rides along and shares its outcome;
/// - a caller introducing any new key waits in the single queued wave,
///   which aggregates every deferred request and is launched as soon as
///   the in-flight wave settles.
///
/// Each caller receives the wave's response filtered to the keys it
/// asked for, or the wave's error verbatim. Nothing is cached across
/// waves: a query arriving after settlement starts from scratch.
///
/// The scheduler spawns no tasks and works on any executor; the waiters
/// of a wave drive the action future cooperatively from their own
/// `poll` calls.
pub struct QueryScheduler<Key, Value, Error, Action, Fut> {
    shared: Arc<Mutex<Registry<Key, Value, Error, Action, Fut>>>,
}

impl<Key, Value, Error, Action, Fut> QueryScheduler<Key, Value, Error, Action, Fut>
where
    Key: Clone + Eq + Hash,
    Value: Clone,
    Error: Clone,
    Action: Fn(HashSet<Key>) -> Fut,
    Fut: Future<Output = Result<HashMap<Key, Value>, Error>>,
{
    pub fn new(action: Action) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Registry::new(action))),
        }
    }

    /// Request the values for `keys`. The returned future resolves to
    /// the response restricted to `keys`, or to the error of the wave
    /// that served it. Keys absent from the wave's response are absent
    /// from the caller's map.
    ///
    /// An empty `keys` resolves immediately to an empty response and
    /// never launches a wave.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "trace", skip_all, fields(keys = keys.len()))
    )]
    pub fn query(&self, keys: HashSet<Key>) -> QueryFuture<Key, Value, Error, Action, Fut> {
        if keys.is_empty() {
            return QueryFuture {
                wave: None,
                requested: keys,
                waker_token: None,
                shared: Some(Arc::clone(&self.shared)),
            };
        }

        let mut registry = self.shared.lock().unwrap();

        // A fully-cancelled in-flight wave may have left the queued wave
        // stranded; seat it before classifying this caller against it.
        if registry.in_flight.is_none() && registry.queued.is_some() {
            registry.promote();
        }

        let covered = registry
            .in_flight
            .as_ref()
            .is_some_and(|flight| keys.is_subset(&flight.keys));

        let wave = if covered {
            // Every key is already being fetched; ride along.
            let flight = registry.in_flight.as_mut().unwrap();
            flight.waiters += 1;
            flight.id
        } else if registry.in_flight.is_some() {
            // At least one new key: wait for the next wave, which
            // aggregates every deferred request.
            registry.enqueue(&keys)
        } else {
            registry.launch(keys.clone())
        };

        QueryFuture {
            wave: Some(wave),
            requested: keys,
            waker_token: None,
            shared: Some(Arc::clone(&self.shared)),
        }
    }
}

/// One outstanding `query` call, attached to exactly one wave.
///
/// Awaiting it parks the caller until its wave settles. Dropping it
/// detaches the caller without disturbing the wave or its other
/// waiters; the keys it contributed to a queued wave are still fetched,
/// their results simply go unclaimed.
pub struct QueryFuture<Key, Value, Error, Action, Fut> {
    // None for an empty request, which never attaches to a wave.
    wave: Option<WaveId>,
    requested: HashSet<Key>,
    waker_token: Option<WaiterToken>,

    // None once the future has completed; re-polling is an error.
    shared: Option<Arc<Mutex<Registry<Key, Value, Error, Action, Fut>>>>,
}

impl<Key, Value, Error, Action, Fut> Unpin for QueryFuture<Key, Value, Error, Action, Fut> {}

impl<Key, Value, Error, Action, Fut> Future for QueryFuture<Key, Value, Error, Action, Fut>
where
    Key: Clone + Eq + Hash,
    Value: Clone,
    Error: Clone,
    Action: Fn(HashSet<Key>) -> Fut,
    Fut: Future<Output = Result<HashMap<Key, Value>, Error>>,
{
    type Output = Result<HashMap<Key, Value>, Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        // Note about this mutex: it is safe to use in an async context
        // because the lock is released when poll returns; it is never
        // held between polls.
        let mut registry = unpinned
            .shared
            .as_ref()
            .expect("Can't re-poll a completed QueryFuture")
            .lock()
            // Panic propagation: if a sibling's poll panicked (most
            // likely inside the action or its future), the mutex is
            // poisoned, which ensures our poll panics too.
            .unwrap();

        let Some(wave) = unpinned.wave else {
            // Empty request: resolve without touching the wave slots.
            drop(registry);
            unpinned.shared = None;
            return Poll::Ready(Ok(HashMap::new()));
        };

        // Already settled (by whichever waiter drove the last poll):
        // collect our share of the outcome.
        if registry.settled.contains_key(&wave) {
            let requested = mem::take(&mut unpinned.requested);
            let outcome = registry
                .consume_settled(wave, requested)
                .expect("Settled ledger lost a waiter's share");

            // Our waker registration went down with the wave.
            unpinned.waker_token = None;
            drop(registry);
            unpinned.shared = None;
            return Poll::Ready(outcome);
        }

        // Our wave may be queued with the in-flight slot empty, which
        // happens when every waiter of the previous wave cancelled.
        // Take the slot ourselves.
        if registry.in_flight.is_none() && registry.queued.as_ref().map(|q| q.id) == Some(wave) {
            registry.promote();
        }

        if registry.in_flight.as_ref().map(|flight| flight.id) == Some(wave) {
            let flight = registry.in_flight.as_mut().unwrap();

            // Safety: the action future sits in the registry behind the
            // scheduler's Arc; it is never moved out of its slot, only
            // dropped in place when the slot is overwritten below.
            let fut = unsafe { Pin::new_unchecked(&mut flight.fut) };

            let outcome = match fut.poll(ctx) {
                Poll::Pending => {
                    // This waker is now the driving waker for the
                    // action future.
                    flight.wakers.update(ctx.waker(), &mut unpinned.waker_token);
                    return Poll::Pending;
                }
                Poll::Ready(outcome) => outcome,
            };

            let waiters = flight.waiters;
            let mut wakers = mem::take(&mut flight.wakers);

            // Signal the siblings so they come collect their results.
            // We're about to take our own, so we don't wake ourselves.
            match unpinned.waker_token.take() {
                Some(token) => wakers.discard_wake_all(token),
                None => wakers.wake_all(),
            }

            // Retire the wave (the action future is dropped in place)
            // and seat the queued wave, if any. Both happen under the
            // lock we already hold, so an arriving caller sees either
            // the old wave in flight or the new one, never neither.
            registry.in_flight = None;
            registry.settle(wave, outcome, waiters);
            registry.promote();

            let requested = mem::take(&mut unpinned.requested);
            let outcome = registry
                .consume_settled(wave, requested)
                .expect("Settled ledger lost a waiter's share");
            drop(registry);
            unpinned.shared = None;
            return Poll::Ready(outcome);
        }

        // Queued behind the in-flight wave. There is nothing to drive
        // until promotion; just keep our waker fresh.
        if let Some(queued) = registry.queued.as_mut() {
            if queued.id == wave {
                queued.wakers.update(ctx.waker(), &mut unpinned.waker_token);
                return Poll::Pending;
            }
        }

        unreachable!("QueryFuture attached to no wave");
    }
}

impl<Key, Value, Error, Action, Fut> Drop for QueryFuture<Key, Value, Error, Action, Fut> {
    fn drop(&mut self) {
        // The shared action future is only ever driven by one of its
        // waiters. If we were the driver, another waiter must be woken
        // to take over; WaiterSet handles the hand-off. Beyond that we
        // only have to return our attachment: waves with no waiters
        // left serve nobody and are discarded outright.
        let Some(shared) = self.shared.as_ref() else {
            return;
        };
        let Some(wave) = self.wave else {
            return;
        };

        // A poisoned registry means a sibling panicked mid-poll; skip
        // cleanup and let the panic surface through their polls.
        let Ok(mut registry) = shared.lock() else {
            return;
        };

        if let Some(flight) = registry.in_flight.as_mut() {
            if flight.id == wave {
                if let Some(token) = self.waker_token.take() {
                    // If we were driving, this elects and wakes a
                    // successor to progress the shared future.
                    flight.wakers.discard_and_wake(token);
                }
                flight.waiters -= 1;

                if flight.waiters == 0 {
                    // Nobody is left to drive or observe this wave.
                    // Drop the action future in place and let the
                    // queued wave know the slot is free; promotion
                    // happens at the next entry into the registry.
                    registry.in_flight = None;
                    if let Some(queued) = registry.queued.as_ref() {
                        queued.wakers.wake_driver();
                    }
                }
                return;
            }
        }

        if let Some(queued) = registry.queued.as_mut() {
            if queued.id == wave {
                if let Some(token) = self.waker_token.take() {
                    queued.wakers.discard_and_wake(token);
                }
                queued.waiters -= 1;

                // The keys we contributed stay in the union; only a
                // wholly-abandoned wave is discarded.
                if queued.waiters == 0 {
                    registry.queued = None;
                }
                return;
            }
        }

        // Settled but never collected: give up our share so the ledger
        // entry can be retired.
        registry.abandon_settled(wave);
    }
}
