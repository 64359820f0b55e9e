//! Replay protection for handshake challenges.
//!
//! A listener records the `(PeerId, Nonce)` pair of every challenge it has
//! answered. Entries live in time-keyed buckets that expire as the clock
//! advances, so memory stays bounded without an explicit sweep.
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ Bucket 0 │ Bucket 1 │ Bucket 2 │ Bucket 3 │
//! │  0-3 min │  3-6 min │  6-9 min │ 9-12 min │
//! └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Four buckets of three minutes cover the default ten minute challenge drift.

use core::time::Duration;
use std::collections::HashSet;

use async_lock::Mutex;

use crate::{crypto::nonce::Nonce, peer::id::PeerId, timestamp::TimestampSeconds};

const DEFAULT_BUCKET_DURATION: Duration = Duration::from_secs(180);
const BUCKET_COUNT: usize = 4;

/// The `(peer, nonce)` pair has been seen recently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("nonce has already been used")]
pub struct NonceReused;

/// Cache of recently-claimed challenge nonces.
#[derive(Debug)]
pub struct NonceCache {
    inner: Mutex<Buckets>,
    bucket_secs: u64,
}

#[derive(Debug)]
struct Buckets {
    slots: [HashSet<(PeerId, Nonce)>; BUCKET_COUNT],

    /// Oldest bucket number still considered live.
    head: u64,
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_DURATION)
    }
}

impl NonceCache {
    /// Create a cache whose buckets each span `bucket_duration`.
    ///
    /// Durations under one second are rounded up to one second.
    #[must_use]
    pub fn new(bucket_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(Buckets {
                slots: core::array::from_fn(|_| HashSet::new()),
                head: 0,
            }),
            bucket_secs: bucket_duration.as_secs().max(1),
        }
    }

    /// Record a nonce from a challenge whose signature has already been
    /// verified.
    ///
    /// # Errors
    ///
    /// Returns [`NonceReused`] if the pair is still live in the cache.
    pub async fn try_claim(
        &self,
        peer: PeerId,
        nonce: Nonce,
        timestamp: TimestampSeconds,
    ) -> Result<(), NonceReused> {
        let key = (peer, nonce);
        let bucket = timestamp.as_secs() / self.bucket_secs;
        let mut inner = self.inner.lock().await;

        let oldest_live = bucket.saturating_sub(BUCKET_COUNT as u64 - 1);
        while inner.head < oldest_live {
            let head = inner.head;
            if let Some(slot) = inner.slots.get_mut(slot_index(head)) {
                slot.clear();
            }
            inner.head += 1;
        }

        if inner.slots.iter().any(|slot| slot.contains(&key)) {
            return Err(NonceReused);
        }

        if let Some(slot) = inner.slots.get_mut(slot_index(bucket)) {
            slot.insert(key);
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)] // result is < BUCKET_COUNT
const fn slot_index(bucket: u64) -> usize {
    (bucket % BUCKET_COUNT as u64) as usize
}
