use std::fmt;

use thiserror::Error;

/// Width of a simulated address in bits.
pub const ADDRESS_BITS: u32 = 64;
pub const MAX_ASSOCIATIVITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("number of set index bits must be greater than zero")]
    ZeroSetBits,
    #[error("number of block offset bits must be greater than zero")]
    ZeroBlockBits,
    #[error("lines per set must be greater than zero")]
    ZeroAssociativity,
    #[error("lines per set ({0}) exceeds the maximum of 8")]
    AssociativityTooLarge(usize),
    #[error("lines per set ({0}) is not a power of two")]
    AssociativityNotPowerOfTwo(usize),
    #[error("set index bits ({set_bits}) plus block offset bits ({block_bits}) exceed 64")]
    AddressTooNarrow { set_bits: u32, block_bits: u32 },
}

/// Shape of the cache: `2^s` sets of `E` lines holding `2^b` byte blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    set_bits: u32,
    block_bits: u32,
    associativity: usize,
}

impl Geometry {
    pub fn new(set_bits: u32, associativity: usize, block_bits: u32) -> Result<Self, ConfigError> {
        if set_bits == 0 {
            return Err(ConfigError::ZeroSetBits);
        }
        if block_bits == 0 {
            return Err(ConfigError::ZeroBlockBits);
        }
        if associativity == 0 {
            return Err(ConfigError::ZeroAssociativity);
        }
        if associativity > MAX_ASSOCIATIVITY {
            return Err(ConfigError::AssociativityTooLarge(associativity));
        }
        if !associativity.is_power_of_two() {
            return Err(ConfigError::AssociativityNotPowerOfTwo(associativity));
        }
        if set_bits.saturating_add(block_bits) > ADDRESS_BITS {
            return Err(ConfigError::AddressTooNarrow {
                set_bits,
                block_bits,
            });
        }
        Ok(Self {
            set_bits,
            block_bits,
            associativity,
        })
    }

    pub fn set_bits(&self) -> u32 {
        self.set_bits
    }

    pub fn block_bits(&self) -> u32 {
        self.block_bits
    }

    pub fn associativity(&self) -> usize {
        self.associativity
    }

    pub fn num_sets(&self) -> usize {
        1usize << self.set_bits
    }

    /// Block size in bytes. Never consulted when classifying accesses.
    pub fn block_size(&self) -> u64 {
        1u64 << self.block_bits
    }

    pub fn tag_bits(&self) -> u32 {
        ADDRESS_BITS - self.set_bits - self.block_bits
    }

    pub fn decode(&self, address: u64) -> (u64, u64) {
        decode(address, self.set_bits, self.block_bits)
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "s={} E={} b={} ({} sets, {}B blocks)",
            self.set_bits,
            self.associativity,
            self.block_bits,
            self.num_sets(),
            self.block_size()
        )
    }
}

/// Splits an address into `(set_index, tag)`.
///
/// The set index is the `set_bits` bits directly above the block offset and
/// the tag is everything above that. Total over all inputs: shifts of 64 or
/// more yield zero.
pub fn decode(address: u64, set_bits: u32, block_bits: u32) -> (u64, u64) {
    let set_mask = match set_bits {
        0 => 0,
        bits if bits >= ADDRESS_BITS => u64::MAX,
        bits => (1u64 << bits) - 1,
    };
    let set_index = address.checked_shr(block_bits).unwrap_or(0) & set_mask;
    let tag = address
        .checked_shr(set_bits.saturating_add(block_bits))
        .unwrap_or(0);
    (set_index, tag)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    Hit,
    /// Miss filled into a free line.
    Miss,
    /// Miss that displaced the least recently used line.
    MissEviction,
}

impl AccessOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, AccessOutcome::Hit)
    }
}

impl fmt::Display for AccessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessOutcome::Hit => write!(f, "hit"),
            AccessOutcome::Miss => write!(f, "miss"),
            AccessOutcome::MissEviction => write!(f, "miss eviction"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: AccessOutcome) {
        match outcome {
            AccessOutcome::Hit => self.hits += 1,
            AccessOutcome::Miss => self.misses += 1,
            AccessOutcome::MissEviction => {
                self.misses += 1;
                self.evictions += 1;
            }
        }
    }

    pub fn accesses(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        if self.accesses() == 0 {
            0.0
        } else {
            self.hits as f64 / self.accesses() as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits:{} misses:{} evictions:{}",
            self.hits, self.misses, self.evictions
        )
    }
}

/// One storage slot. `tag` and `last_access` mean nothing unless occupied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheLine {
    occupied: bool,
    tag: u64,
    last_access: u64,
}

impl CacheLine {
    pub fn is_occupied(&self) -> bool {
        self.occupied
    }

    pub fn tag(&self) -> Option<u64> {
        self.occupied.then_some(self.tag)
    }

    pub fn last_access(&self) -> Option<u64> {
        self.occupied.then_some(self.last_access)
    }
}

#[derive(Debug, Clone)]
pub struct CacheSet {
    lines: Vec<CacheLine>,
}

impl CacheSet {
    fn new(ways: usize) -> Self {
        Self {
            lines: vec![CacheLine::default(); ways],
        }
    }

    pub fn lines(&self) -> &[CacheLine] {
        &self.lines
    }

    pub fn is_full(&self) -> bool {
        self.lines.iter().all(|line| line.occupied)
    }

    pub fn contains(&self, tag: u64) -> bool {
        self.find_line(tag).is_some()
    }

    fn find_line(&self, tag: u64) -> Option<usize> {
        self.lines
            .iter()
            .position(|line| line.occupied && line.tag == tag)
    }

    fn first_free(&self) -> Option<usize> {
        self.lines.iter().position(|line| !line.occupied)
    }

    // First minimum wins, so equal timestamps fall back to the lowest way.
    fn lru_victim(&self) -> usize {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.occupied)
            .min_by_key(|(_, line)| line.last_access)
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }

    fn touch(&mut self, idx: usize, tick: u64) {
        if let Some(line) = self.lines.get_mut(idx) {
            line.last_access = tick;
        }
    }

    fn fill(&mut self, idx: usize, tag: u64, tick: u64) {
        if let Some(line) = self.lines.get_mut(idx) {
            *line = CacheLine {
                occupied: true,
                tag,
                last_access: tick,
            };
        }
    }

    fn access(&mut self, tag: u64, tick: u64) -> AccessOutcome {
        if let Some(idx) = self.find_line(tag) {
            self.touch(idx, tick);
            return AccessOutcome::Hit;
        }
        if let Some(idx) = self.first_free() {
            self.fill(idx, tag, tick);
            return AccessOutcome::Miss;
        }
        let victim = self.lru_victim();
        self.fill(victim, tag, tick);
        AccessOutcome::MissEviction
    }
}

/// Set-associative cache with LRU replacement. Sized once from a validated
/// [`Geometry`] and never resized.
#[derive(Debug, Clone)]
pub struct Cache {
    geometry: Geometry,
    sets: Vec<CacheSet>,
}

impl Cache {
    pub fn new(geometry: Geometry) -> Self {
        let sets = (0..geometry.num_sets())
            .map(|_| CacheSet::new(geometry.associativity()))
            .collect();
        Self { geometry, sets }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn sets(&self) -> &[CacheSet] {
        &self.sets
    }

    pub fn set(&self, index: usize) -> Option<&CacheSet> {
        self.sets.get(index)
    }

    /// Whether the block holding `address` is resident. Does not update recency.
    pub fn contains(&self, address: u64) -> bool {
        let (set_index, tag) = self.geometry.decode(address);
        self.sets
            .get(set_index as usize)
            .is_some_and(|set| set.contains(tag))
    }

    /// Classifies one reference and updates the addressed set. `tick` must be
    /// strictly greater than every tick passed before it.
    pub fn access(&mut self, address: u64, tick: u64) -> AccessOutcome {
        let (set_index, tag) = self.geometry.decode(address);
        debug_assert!((set_index as usize) < self.sets.len());
        self.sets[set_index as usize].access(tag, tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(s: u32, e: usize, b: u32) -> Geometry {
        Geometry::new(s, e, b).expect("valid geometry")
    }

    #[test]
    fn decode_splits_fields() {
        // tag | set (4 bits) | offset (4 bits)
        let (set, tag) = decode(0xABCD_EF12, 4, 4);
        assert_eq!(set, 0x1);
        assert_eq!(tag, 0xABCD_EF);
    }

    #[test]
    fn decode_is_total_at_extremes() {
        assert_eq!(decode(u64::MAX, 1, 63), (1, 0));
        assert_eq!(decode(u64::MAX, 63, 1), ((1u64 << 63) - 1, 0));
        assert_eq!(decode(u64::MAX, 1, 1), (1, u64::MAX >> 2));
        assert_eq!(decode(0, 8, 8), (0, 0));
    }

    #[test]
    fn rejects_bad_geometry() {
        assert_eq!(Geometry::new(0, 1, 1), Err(ConfigError::ZeroSetBits));
        assert_eq!(Geometry::new(1, 1, 0), Err(ConfigError::ZeroBlockBits));
        assert_eq!(Geometry::new(1, 0, 1), Err(ConfigError::ZeroAssociativity));
        assert_eq!(
            Geometry::new(1, 16, 1),
            Err(ConfigError::AssociativityTooLarge(16))
        );
        assert_eq!(
            Geometry::new(1, 3, 1),
            Err(ConfigError::AssociativityNotPowerOfTwo(3))
        );
        assert_eq!(
            Geometry::new(40, 1, 30),
            Err(ConfigError::AddressTooNarrow {
                set_bits: 40,
                block_bits: 30
            })
        );
    }

    #[test]
    fn accepts_every_legal_associativity() {
        for e in [1, 2, 4, 8] {
            let g = geometry(4, e, 5);
            assert_eq!(g.associativity(), e);
            assert_eq!(g.num_sets(), 16);
            assert_eq!(g.block_size(), 32);
            assert_eq!(g.tag_bits(), 55);
        }
    }

    #[test]
    fn new_cache_is_empty() {
        let cache = Cache::new(geometry(3, 4, 2));
        assert_eq!(cache.sets().len(), 8);
        for set in cache.sets() {
            assert_eq!(set.lines().len(), 4);
            assert!(!set.is_full());
            assert!(set.lines().iter().all(|line| !line.is_occupied()));
        }
    }

    #[test]
    fn empty_line_never_matches_tag_zero() {
        let mut cache = Cache::new(geometry(1, 1, 1));
        assert!(!cache.contains(0));
        assert_eq!(cache.access(0, 1), AccessOutcome::Miss);
        assert!(cache.contains(0));
    }

    #[test]
    fn cold_fill_uses_lowest_free_way() {
        let mut cache = Cache::new(geometry(1, 4, 4));
        // set 0, tags 1 and 2
        cache.access(1 << 5, 1);
        cache.access(2 << 5, 2);
        let set = cache.set(0).unwrap();
        assert_eq!(set.lines()[0].tag(), Some(1));
        assert_eq!(set.lines()[1].tag(), Some(2));
        assert!(!set.lines()[2].is_occupied());
    }

    #[test]
    fn hit_refreshes_timestamp() {
        let mut cache = Cache::new(geometry(1, 2, 4));
        cache.access(0x100, 1);
        assert_eq!(cache.access(0x10f, 7), AccessOutcome::Hit);
        assert_eq!(cache.set(0).unwrap().lines()[0].last_access(), Some(7));
    }

    #[test]
    fn evicts_least_recently_used_way() {
        let mut cache = Cache::new(geometry(1, 2, 4));
        let a = 1 << 5;
        let b = 2 << 5;
        let c = 3 << 5;
        cache.access(a, 1);
        cache.access(b, 2);
        cache.access(a, 3);
        assert_eq!(cache.access(c, 4), AccessOutcome::MissEviction);
        assert!(cache.contains(a));
        assert!(!cache.contains(b));
        assert!(cache.contains(c));
    }

    #[test]
    fn victim_tie_goes_to_lowest_way() {
        let mut cache = Cache::new(geometry(1, 4, 1));
        // Same tick everywhere: a caller bug, but the choice is still defined.
        for tag in 0..4u64 {
            cache.access(tag << 2, 5);
        }
        cache.access(9 << 2, 6);
        let set = cache.set(0).unwrap();
        assert_eq!(set.lines()[0].tag(), Some(9));
        assert_eq!(set.lines()[1].tag(), Some(1));
    }

    #[test]
    fn stats_count_evictions_as_misses() {
        let mut stats = CacheStats::new();
        stats.record(AccessOutcome::Hit);
        stats.record(AccessOutcome::Miss);
        stats.record(AccessOutcome::MissEviction);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.accesses(), 3);
        assert_eq!(stats.to_string(), "hits:1 misses:2 evictions:1");
    }
}
