use std::fmt;

use log::{debug, trace};

use crate::{
    cache::{AccessOutcome, Cache, CacheStats, Geometry},
    trace::{AccessKind, TraceRecord},
};

/// Strictly increasing logical time used to order lines by recency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogicalClock(u64);

impl LogicalClock {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn now(&self) -> u64 {
        self.0
    }

    /// Advances the clock and returns the new time.
    pub fn tick(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

/// What a single trace record did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Instruction fetches never reach the cache.
    Skipped,
    Single(AccessOutcome),
    Modify(AccessOutcome, AccessOutcome),
}

impl fmt::Display for RecordOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordOutcome::Skipped => Ok(()),
            RecordOutcome::Single(outcome) => write!(f, "{outcome}"),
            RecordOutcome::Modify(load, store) => write!(f, "{load} {store}"),
        }
    }
}

/// Drives a [`Cache`] through a reference stream in arrival order, keeping
/// the logical clock and running totals.
pub struct Simulator {
    cache: Cache,
    clock: LogicalClock,
    stats: CacheStats,
    verbose_log: Option<Vec<String>>,
}

impl Simulator {
    pub fn new(geometry: Geometry) -> Self {
        debug!("building cache {geometry}");
        Self {
            cache: Cache::new(geometry),
            clock: LogicalClock::new(),
            stats: CacheStats::new(),
            verbose_log: None,
        }
    }

    /// Records one `"<record> <outcomes>"` line per data reference.
    pub fn with_verbose(mut self) -> Self {
        self.verbose_log = Some(Vec::new());
        self
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn clock(&self) -> LogicalClock {
        self.clock
    }

    pub fn verbose_log(&self) -> &[String] {
        self.verbose_log.as_deref().unwrap_or(&[])
    }

    pub fn access(&mut self, address: u64) -> AccessOutcome {
        let now = self.clock.tick();
        let outcome = self.cache.access(address, now);
        self.stats.record(outcome);
        trace!("t={now} addr={address:#x} {outcome}");
        outcome
    }

    pub fn apply(&mut self, record: &TraceRecord) -> RecordOutcome {
        let outcome = match record.kind {
            AccessKind::Instruction => return RecordOutcome::Skipped,
            AccessKind::Load | AccessKind::Store => RecordOutcome::Single(self.access(record.address)),
            AccessKind::Modify => {
                let load = self.access(record.address);
                let store = self.access(record.address);
                RecordOutcome::Modify(load, store)
            }
        };
        if let Some(log) = self.verbose_log.as_mut() {
            log.push(format!("{record} {outcome}"));
        }
        outcome
    }

    pub fn run_trace(&mut self, trace: &[TraceRecord]) -> CacheStats {
        for record in trace {
            self.apply(record);
        }
        debug!(
            "trace done after {} ticks: {} (hit rate {:.2}%)",
            self.clock.now(),
            self.stats,
            self.stats.hit_rate() * 100.0
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(address: u64) -> TraceRecord {
        TraceRecord::new(AccessKind::Load, address, 1)
    }

    fn simulator(s: u32, e: usize, b: u32) -> Simulator {
        Simulator::new(Geometry::new(s, e, b).unwrap())
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let mut clock = LogicalClock::new();
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.now(), 2);
    }

    #[test]
    fn clock_advances_once_per_reference() {
        let mut sim = simulator(2, 2, 2);
        sim.apply(&load(0));
        sim.apply(&TraceRecord::new(AccessKind::Modify, 0x40, 4));
        sim.apply(&TraceRecord::new(AccessKind::Instruction, 0x80, 4));
        assert_eq!(sim.clock().now(), 3);
    }

    #[test]
    fn direct_mapped_scenario() {
        let mut sim = simulator(1, 1, 1);
        let trace = [load(0), load(1), load(8), load(0)];
        let stats = sim.run_trace(&trace);
        assert_eq!(
            stats,
            CacheStats {
                hits: 1,
                misses: 3,
                evictions: 1
            }
        );
    }

    #[test]
    fn modify_second_half_hits() {
        let mut sim = simulator(4, 1, 4);
        let outcome = sim.apply(&TraceRecord::new(AccessKind::Modify, 0x1234, 8));
        assert_eq!(
            outcome,
            RecordOutcome::Modify(AccessOutcome::Miss, AccessOutcome::Hit)
        );
    }

    #[test]
    fn instruction_fetches_are_ignored() {
        let mut sim = simulator(4, 1, 4);
        let outcome = sim.apply(&TraceRecord::new(AccessKind::Instruction, 0x1234, 8));
        assert_eq!(outcome, RecordOutcome::Skipped);
        assert_eq!(sim.stats(), CacheStats::default());
        assert!(!sim.cache().contains(0x1234));
    }

    #[test]
    fn replaces_true_lru_after_reuse() {
        for ways in [1usize, 2, 4, 8] {
            let mut sim = simulator(2, ways, 3);
            // tag stride of 1 << (s + b) keeps everything in set 0
            let addr = |tag: u64| tag << 5;
            for tag in 0..ways as u64 {
                sim.access(addr(tag));
            }
            let first = sim.access(addr(0));
            assert!(first.is_hit());
            assert_eq!(sim.access(addr(100)), AccessOutcome::MissEviction);
            assert!(sim.cache().contains(addr(0)) || ways == 1);
            if ways > 1 {
                assert!(!sim.cache().contains(addr(1)));
            }
        }
    }

    #[test]
    fn verbose_log_lists_outcomes() {
        let mut sim = simulator(1, 1, 1).with_verbose();
        sim.run_trace(&[
            TraceRecord::new(AccessKind::Instruction, 0x0, 2),
            load(0x10),
            TraceRecord::new(AccessKind::Modify, 0x10, 1),
            TraceRecord::new(AccessKind::Store, 0x30, 1),
        ]);
        assert_eq!(
            sim.verbose_log(),
            ["L 10,1 miss", "M 10,1 hit hit", "S 30,1 miss eviction"]
        );
    }
}
