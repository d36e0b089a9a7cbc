// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Coalesces concurrent loads of the same key into a single execution.
//!
//! When several tasks ask a [`Flight`] for the same key, the first one becomes the
//! *leader* and runs its work; the others become *followers* and receive a clone of the
//! leader's result. Tasks working on different keys never wait on each other.
//!
//! # Cancellation and Panics
//!
//! - If the leader is dropped before finishing, one follower is promoted and runs its
//!   own work instead.
//! - If the leader's work panics, the panic is caught and every caller that joined the
//!   flight receives [`Abandoned`]. The next call for that key starts a fresh flight.
//!
//! # Example
//!
//! ```
//! use scopecache::flight::Flight;
//!
//! # async fn example() {
//! let flight: Flight<u64, String> = Flight::new();
//! let value = flight.work(7, || async { "loaded".to_string() }).await;
//! assert_eq!(value.as_deref(), Ok("loaded"));
//! # }
//! ```

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// The leader of a flight panicked before producing a value.
///
/// Callers sharing that flight cannot obtain a result; this signals a bug in the
/// coalesced work rather than a data problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("coalesced work was abandoned before producing a value")]
pub struct Abandoned;

struct Shared<T> {
    value: OnceLock<T>,
    leading: AtomicBool,
    poisoned: AtomicBool,
    notify: Notify,
}

impl<T> Default for Shared<T> {
    fn default() -> Self {
        Self {
            value: OnceLock::new(),
            leading: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }
}

/// Holds the single leader slot of a flight; releasing it wakes all followers.
struct LeaderGuard<'a, T> {
    shared: &'a Shared<T>,
}

impl<'a, T> LeaderGuard<'a, T> {
    fn claim(shared: &'a Shared<T>) -> Option<Self> {
        shared
            .leading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { shared })
    }
}

impl<T> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        self.shared.leading.store(false, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

/// A group of keyed, duplicate-suppressed units of work.
///
/// `Flight` is `Send` and `Sync` whenever its key and value are, and is meant to be
/// shared by every task resolving the same family of keys.
pub struct Flight<K, T> {
    mapping: Mutex<HashMap<K, Weak<Shared<T>>>>,
}

impl<K, T> Default for Flight<K, T> {
    fn default() -> Self {
        Self {
            mapping: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> Debug for Flight<K, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flight")
            .field("keys", &self.mapping.lock().len())
            .finish()
    }
}

impl<K, T> Flight<K, T>
where
    K: Hash + Eq + Clone,
    T: Clone,
{
    /// Creates an empty flight group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of keys with work currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.mapping
            .lock()
            .values()
            .filter(|call| call.strong_count() > 0)
            .count()
    }

    /// Runs `func` for `key` unless the same key is already in flight, in which case
    /// the caller waits for and receives the in-flight result.
    ///
    /// # Errors
    ///
    /// Returns [`Abandoned`] when the leader's work panicked.
    pub async fn work<F, Fut>(&self, key: K, func: F) -> Result<T, Abandoned>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let shared = self.join(&key);

        loop {
            // Register for wake-ups before inspecting the state so that a leader
            // finishing in between is never missed.
            let mut notified = pin!(shared.notify.notified());
            notified.as_mut().enable();

            if let Some(value) = shared.value.get() {
                return Ok(value.clone());
            }
            if shared.poisoned.load(Ordering::Acquire) {
                return Err(Abandoned);
            }
            if let Some(guard) = LeaderGuard::claim(&shared) {
                // The previous leader may have published right before releasing its slot.
                if let Some(value) = shared.value.get() {
                    return Ok(value.clone());
                }
                return self.lead(&key, &shared, guard, func).await;
            }

            notified.await;
        }
    }

    fn join(&self, key: &K) -> Arc<Shared<T>> {
        let mut mapping = self.mapping.lock();
        if let Some(shared) = mapping.get(key).and_then(Weak::upgrade) {
            return shared;
        }

        let shared = Arc::new(Shared::default());
        mapping.insert(key.clone(), Arc::downgrade(&shared));
        shared
    }

    async fn lead<F, Fut>(&self, key: &K, shared: &Arc<Shared<T>>, guard: LeaderGuard<'_, T>, func: F) -> Result<T, Abandoned>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let outcome = AssertUnwindSafe(async move { func().await }).catch_unwind().await;

        let result = match outcome {
            Ok(value) => {
                // Only the slot holder writes, after re-checking the value is empty.
                let stored = shared.value.set(value.clone()).is_ok();
                debug_assert!(stored, "flight value written twice");
                Ok(value)
            }
            Err(_) => {
                shared.poisoned.store(true, Ordering::Release);
                Err(Abandoned)
            }
        };

        self.forget(key, shared);
        drop(guard);
        result
    }

    fn forget(&self, key: &K, shared: &Arc<Shared<T>>) {
        let mut mapping = self.mapping.lock();
        if mapping
            .get(key)
            .is_some_and(|call| std::ptr::eq(call.as_ptr(), Arc::as_ptr(shared)))
        {
            mapping.remove(key);
        }
    }
}
