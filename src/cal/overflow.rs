//! Transaction batching for callers that share one wire identity.
//!
//! Callers whose alias does not fit the wire's thread id field are all sent under the same
//! forced id. To keep the daemon from seeing two transactions interleaved under that id,
//! frames are parked per real caller identity and released as one batch once the outermost
//! transaction closes.
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use log::{trace, warn};

use super::message::{MessageKind, packed_kind};

/// Entries a bucket may hold before its depth bookkeeping is assumed broken.
pub const DEFAULT_BACKSTOP: usize = 512;

#[derive(Debug, Default)]
pub struct OverflowBucket {
    stored: Vec<Vec<u8>>,
    depth: i64,
}

impl OverflowBucket {
    /// Adds a packed frame. Returns the batch to send once the outermost transaction has
    /// closed, otherwise an empty vec.
    pub fn message(&mut self, packed: Vec<u8>, backstop: usize) -> Vec<Vec<u8>> {
        match packed_kind(&packed) {
            Some(MessageKind::StartTransaction) => self.depth += 1,
            Some(MessageKind::EndTransaction) => self.depth -= 1,
            _ => {}
        }
        self.stored.push(packed);

        if self.depth == 0 {
            return std::mem::take(&mut self.stored);
        }
        if self.stored.len() > backstop {
            warn!(
                "overflow bucket dropped {} frames at depth {}",
                self.stored.len(),
                self.depth
            );
            self.stored.clear();
            self.depth = 0;
        }
        Vec::new()
    }

    pub fn depth(&self) -> i64 {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.stored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stored.is_empty()
    }
}

/// Buckets keyed by the caller's real thread id.
#[derive(Debug)]
pub struct OverflowBuckets {
    buckets: Mutex<HashMap<u32, OverflowBucket>>,
    backstop: usize,
}

impl OverflowBuckets {
    pub fn new(backstop: usize) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            backstop,
        }
    }

    /// Buffers `packed` under `thread_id` and returns whatever is ready to go out.
    pub fn route(&self, thread_id: u32, packed: Vec<u8>) -> Vec<Vec<u8>> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets.entry(thread_id).or_default();
        let ready = bucket.message(packed, self.backstop);

        if bucket.is_empty() && bucket.depth() == 0 {
            buckets.remove(&thread_id);
        }
        trace!("overflow {thread_id:#x} released {} frames", ready.len());
        ready
    }

    /// Number of identities with frames still parked.
    pub fn pending(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for OverflowBuckets {
    fn default() -> Self {
        Self::new(DEFAULT_BACKSTOP)
    }
}
