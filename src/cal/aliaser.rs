//! Small unique ids for concurrent callers.
//!
//! The CAL wire format only leaves 16 bits for the calling thread, so every live caller is
//! given the smallest integer not currently held by another caller. Freed ids are kept in a
//! min-heap and handed out again before any new, higher id.
//!
//! An [`Aliaser`] never keeps a [`Caller`] alive: it only records the caller's key, and the
//! caller itself hands its ids back when its last handle is dropped. For the per-thread
//! [`Caller::current`] that happens when the thread exits.
//!
//! # Example
//! ```rust
//! use hera_client::cal::aliaser::{Aliaser, Caller};
//!
//! let aliaser = Aliaser::new();
//! let a = Caller::new();
//! let b = Caller::new();
//!
//! assert_eq!(aliaser.get(&a), 0);
//! assert_eq!(aliaser.get(&b), 1);
//!
//! drop(a);
//! let c = Caller::new();
//! assert_eq!(aliaser.get(&c), 0);
//! ```
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use log::trace;

static NEXT_CALLER: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: Caller = Caller::new();
}

#[derive(Debug, Default)]
struct Slots {
    assigned: HashMap<u64, u32>,
    free: BinaryHeap<Reverse<u32>>,
}

impl Slots {
    fn release(&mut self, key: u64) -> Option<u32> {
        let id = self.assigned.remove(&key)?;
        self.free.push(Reverse(id));
        Some(id)
    }
}

/// Handle identifying one logical caller. Clones share the identity.
#[derive(Debug, Clone)]
pub struct Caller(Arc<CallerInner>);

#[derive(Debug)]
struct CallerInner {
    key: u64,
    registrations: Mutex<Vec<Weak<Mutex<Slots>>>>,
}

impl Caller {
    pub fn new() -> Self {
        Self(Arc::new(CallerInner {
            key: NEXT_CALLER.fetch_add(1, Ordering::Relaxed),
            registrations: Mutex::new(Vec::new()),
        }))
    }

    /// The caller bound to the running thread. Its ids are released when the thread exits.
    pub fn current() -> Self {
        // During thread teardown the thread-local may already be gone.
        CURRENT
            .try_with(Caller::clone)
            .unwrap_or_else(|_| Caller::new())
    }

    pub fn key(&self) -> u64 {
        self.0.key
    }

    fn register(&self, slots: &Arc<Mutex<Slots>>) {
        let mut registrations = self
            .0
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let weak = Arc::downgrade(slots);
        if !registrations.iter().any(|r| r.ptr_eq(&weak)) {
            registrations.push(weak);
        }
    }
}

impl Default for Caller {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallerInner {
    fn drop(&mut self) {
        let registrations = self
            .registrations
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for slots in registrations.drain(..) {
            let Some(slots) = slots.upgrade() else {
                continue;
            };
            let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(id) = slots.release(self.key) {
                trace!("caller {} gone, id {id} released", self.key);
            }
        }
    }
}

/// Assigns each caller the smallest free id. Clones share the same id space.
#[derive(Debug, Clone, Default)]
pub struct Aliaser {
    slots: Arc<Mutex<Slots>>,
}

impl Aliaser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the caller's id, assigning one on first use.
    pub fn get(&self, caller: &Caller) -> u32 {
        let mut slots = self.lock();
        if let Some(id) = slots.assigned.get(&caller.key()) {
            return *id;
        }

        // With no freed ids, 0..len are all taken.
        let id = match slots.free.pop() {
            Some(Reverse(id)) => id,
            None => slots.assigned.len() as u32,
        };
        slots.assigned.insert(caller.key(), id);
        drop(slots);

        caller.register(&self.slots);
        trace!("caller {} assigned id {id}", caller.key());
        id
    }

    /// Frees the caller's id right away, e.g. before a long idle period.
    pub fn release(&self, caller: &Caller) -> Option<u32> {
        self.lock().release(caller.key())
    }

    pub fn contains(&self, caller: &Caller) -> bool {
        self.lock().assigned.contains_key(&caller.key())
    }

    /// Number of callers currently holding an id.
    pub fn len(&self) -> usize {
        self.lock().assigned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
