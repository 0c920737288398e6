//! Wave-coalescing key-set queries: overlapping concurrent lookups for
//! sets of keys share a single invocation of the backing async lookup
//! per wave. See [`QueryScheduler`].

mod registry;
mod scheduler;
mod waiters;

#[cfg(test)]
mod test;

pub use scheduler::{QueryFuture, QueryScheduler};
