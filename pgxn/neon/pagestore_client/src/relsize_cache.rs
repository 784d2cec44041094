//! Cache of relation fork sizes, to avoid an Nblocks round trip to the page
//! server for every size lookup.
//!
//! The storage manager keeps the cache coherent with its own writes: extends
//! can only grow a cached size, truncation sets it, and unlink forgets it.
//! A fork that is not cached is looked up on the page server.

use std::collections::HashMap;

use pageserver_api::reltag::RelTag;
use postgres_ffi_types::BlockNumber;
use tracing::trace;

pub struct RelSizeCache {
    sizes: HashMap<RelTag, BlockNumber>,
    capacity: usize,
}

impl RelSizeCache {
    /// A cache holding up to `capacity` forks. Zero disables caching.
    pub fn new(capacity: usize) -> Self {
        RelSizeCache {
            sizes: HashMap::new(),
            capacity,
        }
    }

    pub fn get(&self, rel: &RelTag) -> Option<BlockNumber> {
        self.sizes.get(rel).copied()
    }

    /// Record the authoritative size of a fork, overwriting what was cached.
    pub fn set(&mut self, rel: RelTag, size: BlockNumber) {
        if let Some(cached) = self.sizes.get_mut(&rel) {
            *cached = size;
        } else if self.has_room() {
            self.sizes.insert(rel, size);
        }
    }

    /// Raise the cached size of a fork to at least `size`.
    pub fn update(&mut self, rel: RelTag, size: BlockNumber) {
        if let Some(cached) = self.sizes.get_mut(&rel) {
            *cached = (*cached).max(size);
        } else if self.has_room() {
            self.sizes.insert(rel, size);
        }
    }

    pub fn forget(&mut self, rel: &RelTag) {
        self.sizes.remove(rel);
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    fn has_room(&self) -> bool {
        // Once full, new forks are simply not cached. Dropping an entry is
        // always safe, the size is then fetched from the page server.
        let room = self.sizes.len() < self.capacity;
        if !room {
            trace!("relation size cache is full ({} entries)", self.capacity);
        }
        room
    }
}
