//! The wait registry: the scheduler's only shared mutable state.
//!
//! Holds at most one in-flight wave and one queued wave, plus the
//! outcomes of settled waves that still have unserved waiters. All
//! methods are synchronous and expect to run under the scheduler's
//! mutex; nothing here awaits.

use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Debug, Formatter},
    hash::Hash,
};

use crate::waiters::WaiterSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WaveId(u64);

/// The wave currently holding the one allowed action invocation. Its
/// key snapshot is frozen; the registry keeps it for subset tests while
/// the action owns its own copy.
pub(crate) struct FlightWave<Key, Fut> {
    pub(crate) id: WaveId,
    pub(crate) keys: HashSet<Key>,
    pub(crate) fut: Fut,
    pub(crate) wakers: WaiterSet,
    pub(crate) waiters: usize,
}

impl<Key: Debug, Fut> Debug for FlightWave<Key, Fut> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlightWave")
            .field("id", &self.id)
            .field("keys", &self.keys)
            .field("fut", &"<future>")
            .field("wakers", &self.wakers)
            .field("waiters", &self.waiters)
            .finish()
    }
}

/// The wave waiting behind the in-flight one. Its key union keeps
/// growing until promotion freezes it.
#[derive(Debug)]
pub(crate) struct QueuedWave<Key> {
    pub(crate) id: WaveId,
    pub(crate) keys: HashSet<Key>,
    pub(crate) wakers: WaiterSet,
    pub(crate) waiters: usize,
}

/// A settled wave's outcome, held until every attached waiter has
/// either consumed its share or been dropped.
#[derive(Debug)]
pub(crate) struct SettledWave<Key, Value, Error> {
    outcome: Result<HashMap<Key, Value>, Error>,
    remaining: usize,
}

pub(crate) struct Registry<Key, Value, Error, Action, Fut> {
    action: Action,
    pub(crate) in_flight: Option<FlightWave<Key, Fut>>,
    pub(crate) queued: Option<QueuedWave<Key>>,
    pub(crate) settled: HashMap<WaveId, SettledWave<Key, Value, Error>>,
    next_wave: u64,
}

impl<Key, Value, Error, Action, Fut> Registry<Key, Value, Error, Action, Fut> {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            in_flight: None,
            queued: None,
            settled: HashMap::new(),
            next_wave: 0,
        }
    }

    fn next_id(&mut self) -> WaveId {
        let id = WaveId(self.next_wave);
        self.next_wave += 1;
        id
    }

    /// Record a finished wave's outcome for its `waiters` attached
    /// callers to collect.
    pub fn settle(
        &mut self,
        id: WaveId,
        outcome: Result<HashMap<Key, Value>, Error>,
        waiters: usize,
    ) {
        #[cfg(feature = "tracing")]
        tracing::trace!(wave = id.0, waiters, ok = outcome.is_ok(), "wave settled");

        debug_assert!(waiters > 0);
        self.settled.insert(
            id,
            SettledWave {
                outcome,
                remaining: waiters,
            },
        );
    }

    /// A dropped waiter gives up its unclaimed share of a settled
    /// outcome. The ledger entry is retired with the last share.
    pub fn abandon_settled(&mut self, id: WaveId) {
        if let Some(entry) = self.settled.get_mut(&id) {
            entry.remaining -= 1;
            if entry.remaining == 0 {
                self.settled.remove(&id);
            }
        }
    }
}

impl<Key, Value, Error, Action, Fut> Registry<Key, Value, Error, Action, Fut>
where
    Key: Clone + Eq + Hash,
    Action: Fn(HashSet<Key>) -> Fut,
{
    /// Put a brand new wave directly in flight with a single waiter.
    /// The action is handed its own copy of the key set; the wave keeps
    /// the snapshot for subset tests against later callers.
    pub fn launch(&mut self, keys: HashSet<Key>) -> WaveId {
        debug_assert!(self.in_flight.is_none());

        let id = self.next_id();

        #[cfg(feature = "tracing")]
        tracing::trace!(wave = id.0, keys = keys.len(), "launching wave");

        let fut = (self.action)(keys.clone());
        self.in_flight = Some(FlightWave {
            id,
            keys,
            fut,
            wakers: WaiterSet::default(),
            waiters: 1,
        });

        id
    }

    /// Attach a caller that introduced new keys: join the queued wave,
    /// growing its union, or open one if none is waiting yet.
    pub fn enqueue(&mut self, keys: &HashSet<Key>) -> WaveId {
        match self.queued.as_mut() {
            Some(wave) => {
                wave.keys.extend(keys.iter().cloned());
                wave.waiters += 1;
                wave.id
            }
            None => {
                let id = self.next_id();

                #[cfg(feature = "tracing")]
                tracing::trace!(wave = id.0, keys = keys.len(), "queueing wave");

                self.queued = Some(QueuedWave {
                    id,
                    keys: keys.clone(),
                    wakers: WaiterSet::default(),
                    waiters: 1,
                });
                id
            }
        }
    }

    /// Move the queued wave into the empty in-flight slot, freezing its
    /// key union and invoking the action on it. The queued driver is
    /// woken so some task starts polling the fresh future. No-op when
    /// nothing is queued.
    pub fn promote(&mut self) {
        debug_assert!(self.in_flight.is_none());

        if let Some(wave) = self.queued.take() {
            #[cfg(feature = "tracing")]
            tracing::trace!(wave = wave.id.0, keys = wave.keys.len(), "promoting wave");

            wave.wakers.wake_driver();

            let fut = (self.action)(wave.keys.clone());
            self.in_flight = Some(FlightWave {
                id: wave.id,
                keys: wave.keys,
                fut,
                wakers: wave.wakers,
                waiters: wave.waiters,
            });
        }
    }
}

impl<Key, Value, Error, Action, Fut> Registry<Key, Value, Error, Action, Fut>
where
    Key: Eq + Hash,
    Value: Clone,
    Error: Clone,
{
    /// Serve one waiter its share of a settled outcome, filtered to the
    /// keys it asked for. Values are cloned out of the shared map,
    /// except for the last consumer, which takes them by move and
    /// retires the ledger entry. Returns None if the wave isn't in the
    /// settled ledger.
    pub fn consume_settled(
        &mut self,
        id: WaveId,
        requested: HashSet<Key>,
    ) -> Option<Result<HashMap<Key, Value>, Error>> {
        let entry = self.settled.get_mut(&id)?;
        entry.remaining -= 1;

        if entry.remaining == 0 {
            let entry = self.settled.remove(&id).unwrap();
            Some(entry.outcome.map(|mut response| {
                requested
                    .into_iter()
                    .filter_map(|key| {
                        let value = response.remove(&key)?;
                        Some((key, value))
                    })
                    .collect()
            }))
        } else {
            Some(match &entry.outcome {
                Ok(response) => Ok(requested
                    .into_iter()
                    .filter_map(|key| {
                        let value = response.get(&key)?.clone();
                        Some((key, value))
                    })
                    .collect()),
                Err(err) => Err(err.clone()),
            })
        }
    }
}
