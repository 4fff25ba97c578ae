//! Weighted Maglev lookup table construction.
//!
//! A variant of Google's Maglev hashing with per-shard weights, a power-of-two
//! table and an LCG permutation instead of the paper's prime-sized offset/skip
//! sequence. The module only builds the table. Hashing shards and items and
//! indexing the table at request time are left to the caller:
//!
//! ```ignore
//! let table = build_table(&shards, 1 << 16)?;
//! let owner = &shards[table.lookup(item_hash)];
//! ```

use std::ops::Deref;

use tracing::debug;

/// LCG multiplier used to scramble a shard hash into permutation parameters.
const GA: u64 = 0xacd5_ad43_2745_93b9;
/// LCG increment paired with [`GA`].
const GB: u64 = 0x6956_ab76_ed26_8a3d;

/// Marks a slot nobody has claimed yet. Generators tag slots with 1-based indices.
const UNCLAIMED: u16 = 0;

/// A weighted backend as seen by the table builder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shard {
    /// Pseudorandom value derived from the shard's identity.
    pub hash: u64,
    /// Relative weight. Only the ratio between weights matters, so `1, 1, 2`
    /// and `100, 100, 200` describe the same split.
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    /// A weight is negative, NaN or infinite, or the weights overflow when summed.
    #[error("shard[{index}] has invalid weight {weight}: weights must be finite and not negative")]
    InvalidWeight { index: usize, weight: f64 },

    #[error("at least one shard must have a positive weight")]
    NoPositiveWeight,
}

/// Mapping from slot to shard index, in the caller's shard order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table(Vec<u16>);

impl Table {
    /// Returns the index of the shard owning `item_hash`.
    ///
    /// Panics on an empty table.
    pub fn lookup(&self, item_hash: u64) -> usize {
        self.0[self.slot(item_hash)] as usize
    }

    /// Slot that `item_hash` falls into.
    pub fn slot(&self, item_hash: u64) -> usize {
        (item_hash & (self.0.len() as u64 - 1)) as usize
    }

    /// Number of slots owned by each of `num_shards` shards.
    pub fn slot_counts(&self, num_shards: usize) -> Vec<usize> {
        let mut counts = vec![0usize; num_shards];
        for &shard in &self.0 {
            counts[shard as usize] += 1;
        }
        counts
    }

    /// Number of slots whose owner differs between two tables of the same size.
    pub fn moved_slots(&self, other: &Table) -> usize {
        assert_eq!(
            self.0.len(),
            other.0.len(),
            "cannot compare tables of different sizes"
        );
        self.0
            .iter()
            .zip(&other.0)
            .filter(|(a, b)| a != b)
            .count()
    }

    /// Little-endian `u16` per slot, the format served to remote readers.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|shard| shard.to_le_bytes()).collect()
    }
}

impl Deref for Table {
    type Target = [u16];

    fn deref(&self) -> &[u16] {
        &self.0
    }
}

/// Per-shard permutation state, owned by a single build.
struct Generator {
    /// 1-based position of the shard in the caller's slice.
    index: u16,
    /// Unscrambled shard hash, used only to order generators.
    hash: u64,
    weight: f64,
    start: u64,
    step_add: u64,
    step_mult: u64,
    position: u64,
    quota: usize,
    accumulator: f64,
}

impl Generator {
    fn new(input_index: usize, shard: &Shard, divisor: u128) -> Self {
        let mut hash = shard.hash;
        let mut next = || {
            hash = hash.wrapping_mul(GA).wrapping_add(GB);
            (u128::from(hash) / divisor) as u64
        };
        let start = next();
        // An odd increment and a multiplier congruent to 1 mod 4 give the
        // permutation a full period over any power-of-two table.
        let step_add = next() | 1;
        let step_mult = (next() & !3) | 5;

        Self {
            index: (input_index + 1) as u16,
            hash: shard.hash,
            weight: shard.weight,
            start,
            step_add,
            step_mult,
            position: 0,
            quota: 0,
            accumulator: 0.0,
        }
    }

    /// Next slot of this generator's permutation.
    fn next_candidate(&mut self, mask: u64) -> usize {
        let candidate = self.start.wrapping_add(self.position) & mask;
        self.position = self
            .position
            .wrapping_mul(self.step_mult)
            .wrapping_add(self.step_add);
        candidate as usize
    }
}

/// Builds the slot-to-shard table for `shards`.
///
/// `table_size` must be a power of two and should stay the same for the whole
/// lifetime of a cluster. Every call is a full rebuild; the same input always
/// produces the same table.
///
/// # Panics
///
/// If `table_size` is not a positive power of two, or if there are more than
/// `u16::MAX` shards. Both are configuration mistakes a retry cannot fix.
pub fn build_table(shards: &[Shard], table_size: usize) -> Result<Table, BuildError> {
    if !table_size.is_power_of_two() {
        panic!("table_size should be a positive power of two, got {table_size}");
    }
    if shards.len() > u16::MAX as usize {
        panic!(
            "at most {} shards fit in a table, got {}",
            u16::MAX,
            shards.len()
        );
    }

    // ceil(2^64 / table_size); projects a scrambled hash into [0, table_size).
    let divisor = (1u128 << 64).div_ceil(table_size as u128);
    let mut generators = Vec::with_capacity(shards.len());
    let mut total_weight = 0.0_f64;
    for (index, shard) in shards.iter().enumerate() {
        if !shard.weight.is_finite() || shard.weight < 0.0 {
            return Err(BuildError::InvalidWeight {
                index,
                weight: shard.weight,
            });
        }
        total_weight += shard.weight;
        if !total_weight.is_finite() {
            return Err(BuildError::InvalidWeight {
                index,
                weight: shard.weight,
            });
        }
        generators.push(Generator::new(index, shard, divisor));
    }
    if total_weight == 0.0 {
        return Err(BuildError::NoPositiveWeight);
    }
    let average_weight = total_weight / shards.len() as f64;

    // Without a stable order, identical shard sets given in a different order
    // would place slots differently.
    generators.sort_by_key(|generator| generator.hash);

    allocate_quotas(&mut generators, average_weight, table_size);
    debug!(
        shards = shards.len(),
        table_size,
        quotas = ?generators.iter().map(|g| (g.index - 1, g.quota)).collect::<Vec<_>>(),
        "allocated slot quotas"
    );

    let mut table = place_slots(&mut generators, table_size);
    for slot in &mut table {
        *slot -= 1;
    }
    Ok(Table(table))
}

/// Splits `table_size` slots between generators proportionally to weight.
///
/// Each turn a generator adds its weight to its accumulator and takes one slot
/// per whole `average_weight` accumulated. Not optimal, but close and stable:
/// counts land within a slot or two of the exact share.
fn allocate_quotas(generators: &mut [Generator], average_weight: f64, table_size: usize) {
    let mut rest = table_size;
    let mut turn = 0;
    while rest > 0 {
        let generator = &mut generators[turn % generators.len()];
        turn += 1;
        generator.accumulator += generator.weight;
        if generator.accumulator >= average_weight {
            let granted = ((generator.accumulator / average_weight) as usize).min(rest);
            generator.quota += granted;
            rest -= granted;
            generator.accumulator -= average_weight * granted as f64;
        }
    }
}

/// Lets generators claim one free slot per turn until the table is full.
fn place_slots(generators: &mut [Generator], table_size: usize) -> Vec<u16> {
    let mask = table_size as u64 - 1;
    let mut table = vec![UNCLAIMED; table_size];
    let mut claimed = 0;
    let mut turn = 0;
    while claimed < table_size {
        let generator = &mut generators[turn % generators.len()];
        turn += 1;
        if generator.quota == 0 {
            continue;
        }
        generator.quota -= 1;
        loop {
            let slot = generator.next_candidate(mask);
            if table[slot] == UNCLAIMED {
                table[slot] = generator.index;
                claimed += 1;
                break;
            }
        }
    }
    table
}
