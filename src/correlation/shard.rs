//! Per-entity sharding: hashing `entity_key` into `correlation.shards` lanes
//! so each shard can be a single-writer worker, giving per-entity ordering
//! without a global lock (§4.4 "Per-entity ordering guarantee").

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::domain::EntityKey;

/// Deterministically maps an entity key to one of `num_shards` lanes.
pub fn shard_for(entity_key: &EntityKey, num_shards: usize) -> usize {
    debug_assert!(num_shards > 0, "num_shards must be >= 1");
    let mut hasher = DefaultHasher::new();
    entity_key.as_str().hash(&mut hasher);
    (hasher.finish() % num_shards as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_always_maps_to_same_shard() {
        let key = EntityKey::new("alice").unwrap();
        let first = shard_for(&key, 16);
        for _ in 0..100 {
            assert_eq!(shard_for(&key, 16), first);
        }
    }

    #[test]
    fn shard_index_is_in_range() {
        let key = EntityKey::new("bob").unwrap();
        assert!(shard_for(&key, 8) < 8);
    }
}
