//! Correlation ids attached to closing transaction records.
use std::{cell::RefCell, process};

use chrono::Utc;
use log::trace;

/// Supplies the correlation id for the current unit of work.
pub trait CorrelationIdProvider: Send + Sync {
    fn get(&self) -> String;
}

thread_local! {
    static CACHED: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Default provider: one id per thread, derived from host, pid and the current time.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashedCorrelationIds;

impl HashedCorrelationIds {
    /// Forgets the calling thread's id so the next `get` generates a fresh one.
    pub fn reset() {
        CACHED.with(|c| c.borrow_mut().take());
    }
}

impl CorrelationIdProvider for HashedCorrelationIds {
    fn get(&self) -> String {
        CACHED.with(|c| c.borrow_mut().get_or_insert_with(generate).clone())
    }
}

/// Provider always returning the same id. Handy for tests and fixed request scopes.
#[derive(Debug, Clone)]
pub struct FixedCorrelationId(pub String);

impl CorrelationIdProvider for FixedCorrelationId {
    fn get(&self) -> String {
        self.0.clone()
    }
}

fn generate() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let now = Utc::now();
    let micros = now.timestamp_subsec_micros();
    let seed = format!("{host}{}{}{micros}", process::id(), now.timestamp());

    let id = format!("{:x}{micros:x}", fnv_hash(&seed) & 0xFFFF_FFFF);
    trace!("generated correlation id {id}");
    id
}

/// 64 bit FNV-1 (multiply then xor). Not for anything security related.
pub fn fnv_hash(text: &str) -> u64 {
    text.chars().fold(0xcbf2_9ce4_8422_2325, |h: u64, c| {
        h.wrapping_mul(0x0100_0000_01b3) ^ u64::from(u32::from(c))
    })
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn fnv_hash_known_values() {
        assert_eq!(fnv_hash(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(
            fnv_hash("a"),
            0xcbf2_9ce4_8422_2325_u64.wrapping_mul(0x0100_0000_01b3) ^ 0x61
        );
    }

    #[test]
    fn id_is_cached_per_thread() {
        let ids = HashedCorrelationIds;
        let first = ids.get();
        assert_eq!(ids.get(), first);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        let other = thread::spawn(move || HashedCorrelationIds.get()).join().unwrap();
        assert!(!other.is_empty());

        HashedCorrelationIds::reset();
        assert!(!ids.get().is_empty());
    }
}
