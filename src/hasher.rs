use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Hash of a shard's name, used to derive its permutation and ordering.
pub fn shard_hash(name: &str, seed: u64) -> u64 {
    xxh3_64_with_seed(name.as_bytes(), seed)
}

/// Hash of a lookup key. Use a different seed than for shards, otherwise a key
/// equal to a shard name correlates with that shard's permutation.
pub fn item_hash(key: &str, seed: u64) -> u64 {
    xxh3_64_with_seed(key.as_bytes(), seed)
}
