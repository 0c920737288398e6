use std::{collections::HashMap, num::NonZeroU64, task::Waker};

#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash)]
pub(crate) struct WaiterToken(NonZeroU64);

impl WaiterToken {
    fn first() -> Self {
        WaiterToken(NonZeroU64::new(1).unwrap())
    }

    fn copy(&self) -> Self {
        WaiterToken(self.0)
    }

    /// Use this token as a generator: return the current token and step
    /// this one forward.
    fn bump(&mut self) -> WaiterToken {
        let current = self.copy();

        *self = self
            .0
            .get()
            .checked_add(1)
            .and_then(NonZeroU64::new)
            .map(WaiterToken)
            .expect("Overflow when creating a waiter token");

        current
    }
}

/// Tracks the wakers of every caller attached to one wave.
///
/// A wave's action future is shared work: it only needs one task to
/// drive it, but every attached task must hear about the result. The
/// waiter that most recently polled is recorded as the *driver*. When
/// the driver's future is dropped, an arbitrary surviving waiter is
/// elected and woken in its place, so the shared future never loses its
/// path forward; as long as every future discards its token on drop,
/// the chain of drivers is unbroken.
///
/// Invariant: a non-empty set always has a driver. A run of drops with
/// no poll in between must still end with a live waiter awoken (or the
/// set empty), which is why discarding re-elects eagerly rather than
/// waiting for the next poll.
#[derive(Debug)]
pub(crate) struct WaiterSet {
    wakers: HashMap<WaiterToken, Waker>,
    driver: Option<WaiterToken>,

    // Tokens count up forever. Waves are short-lived, so exhausting a
    // u64 is not a practical concern.
    next: WaiterToken,
}

impl Default for WaiterSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::new(),
            driver: None,
            next: WaiterToken::first(),
        }
    }
}

impl WaiterSet {
    /// Register the waker that just polled, either storing it fresh (and
    /// writing the new token into `slot`) or refreshing the entry `slot`
    /// already names. Either way that waker becomes the driver, on the
    /// assumption that it has just been used to poll the shared future.
    pub fn update(&mut self, waker: &Waker, slot: &mut Option<WaiterToken>) {
        match slot {
            Some(token) => {
                let stored = self
                    .wakers
                    .get_mut(token)
                    .expect("No matching token in WaiterSet");

                if !stored.will_wake(waker) {
                    stored.clone_from(waker);
                }

                self.driver = Some(token.copy());
            }
            None => {
                let token = self.next.bump();
                self.wakers.insert(token.copy(), waker.clone());
                self.driver = Some(token.copy());
                *slot = Some(token);
            }
        }
    }

    /// Wake the current driver, if any.
    pub fn wake_driver(&self) {
        if let Some(driver) = &self.driver {
            self.wakers
                .get(driver)
                .expect("Driving waker not present in WaiterSet")
                .wake_by_ref();
        }
    }

    /// Wake every registered waiter.
    pub fn wake_all(&self) {
        self.wakers.values().for_each(|waker| waker.wake_by_ref());
    }

    /// Remove one waiter. If it was the driver (or no driver was set),
    /// elect an arbitrary survivor as the new driver and wake it
    /// immediately, so a chain of drops still leaves someone working.
    pub fn discard_and_wake(&mut self, token: WaiterToken) {
        self.wakers.remove(&token);

        if self.driver == Some(token.copy()) || self.driver.is_none() {
            match self.wakers.iter().next() {
                None => self.driver = None,
                Some((token, waker)) => {
                    waker.wake_by_ref();
                    self.driver = Some(token.copy());
                }
            }
        }
    }

    /// Remove one waiter, then wake all the others. Used by the waiter
    /// that settles a wave: its siblings need to collect their results,
    /// but it is about to take its own and must not wake itself.
    pub fn discard_wake_all(&mut self, token: WaiterToken) {
        self.wakers.remove(&token);
        self.wake_all()
    }
}
