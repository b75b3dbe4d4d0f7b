//! # Submission Aggregator
//!
//! Ordered list of recorded command buffers waiting to be chained into
//! physical submissions.
//!
//! Recording only marks which barriers became redundant. Bytes are rewritten
//! when a chain is taken, and only between neighbours inside that chain: the
//! last record of a chain always keeps its barrier.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use hashbrown::HashSet;
use kiln_core::ByteSize;
use kiln_mem::{AllocationId, AllocationRegistry};
use log::debug;

use crate::batch::CommandBufferRecord;

/// Aggregator statistics
#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    /// Records added
    pub records: u64,
    /// Chains handed out
    pub chains: u64,
    /// Barriers marked redundant
    pub elided_barriers: u64,
}

/// Batched command buffers of one receiver
#[derive(Debug, Default)]
pub struct SubmissionAggregator {
    records: VecDeque<CommandBufferRecord>,
    footprint: ByteSize,
    stats: AggregatorStats,
}

impl SubmissionAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record
    ///
    /// If the previous record runs at the same task level and both allow
    /// out-of-order execution, the previous record's elidable barrier is
    /// marked for removal.
    pub fn record(&mut self, record: CommandBufferRecord) {
        if let Some(previous) = self.records.back_mut() {
            if previous.task_level == record.task_level
                && previous.out_of_order
                && record.out_of_order
                && previous.elidable_barrier.is_some()
            {
                previous.elide_barrier = true;
                self.stats.elided_barriers += 1;
            }
        }

        self.footprint = self.footprint + record.footprint;
        self.stats.records += 1;
        self.records.push_back(record);
    }

    /// Detach the longest compatible prefix that fits `limit`
    ///
    /// The first record is always taken. Following records join while they
    /// are compatible with it and the union of resident surfaces stays
    /// within `limit`.
    pub fn take_next_chain(
        &mut self,
        registry: &AllocationRegistry,
        limit: Option<ByteSize>,
    ) -> Vec<CommandBufferRecord> {
        let mut chain: Vec<CommandBufferRecord> = Vec::new();
        let mut seen: HashSet<AllocationId> = HashSet::new();
        let mut chain_footprint = 0u64;

        while let Some(next) = self.records.front() {
            let added: u64 = next
                .surfaces
                .iter()
                .filter(|id| !seen.contains(*id))
                .filter_map(|id| registry.get(*id).ok())
                .map(|alloc| alloc.size().as_bytes())
                .sum();

            if let Some(first) = chain.first() {
                let fits = limit.map_or(true, |limit| chain_footprint + added <= limit.as_bytes());
                if !first.is_compatible(next) || !fits {
                    break;
                }
            }

            let Some(record) = self.records.pop_front() else {
                break;
            };
            seen.extend(record.surfaces.iter().copied());
            chain_footprint += added;
            self.footprint = ByteSize::from_bytes(
                self.footprint.as_bytes().saturating_sub(record.footprint.as_bytes()),
            );
            chain.push(record);
        }

        if !chain.is_empty() {
            self.stats.chains += 1;
            debug!(
                "chain of {} records, {} resident",
                chain.len(),
                ByteSize::from_bytes(chain_footprint)
            );
        }
        chain
    }

    /// Check if nothing is recorded
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of recorded command buffers
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Sum of the resident footprints of all records
    pub fn pending_footprint(&self) -> ByteSize {
        self.footprint
    }

    /// Recorded command buffers in order
    pub fn records(&self) -> impl Iterator<Item = &CommandBufferRecord> {
        self.records.iter()
    }

    /// Get statistics
    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BarrierSlot, BatchBuffer};
    use crate::encoder::BarrierDesc;
    use crate::stream::StreamLocation;
    use alloc::vec;
    use kiln_core::{AllocationType, GpuAddr, ThrottleLevel};
    use kiln_mem::GraphicsAllocation;

    struct Fixture {
        registry: AllocationRegistry,
        stream: AllocationId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = AllocationRegistry::new();
            let stream = registry.insert(GraphicsAllocation::new(
                GpuAddr::new(0x10000),
                ByteSize::KIB_4,
                AllocationType::CommandBuffer,
                AllocationType::CommandBuffer.default_flags(),
            ));
            Self { registry, stream }
        }

        fn surface(&mut self, kib: u64) -> AllocationId {
            self.registry.insert(GraphicsAllocation::new(
                GpuAddr::new(0x100000 * (self.registry.len() as u64 + 1)),
                ByteSize::from_kib(kib),
                AllocationType::Buffer,
                AllocationType::Buffer.default_flags(),
            ))
        }

        fn record(
            &self,
            task_count: u32,
            task_level: u32,
            out_of_order: bool,
            surfaces: Vec<AllocationId>,
        ) -> CommandBufferRecord {
            let location = StreamLocation {
                allocation: self.stream,
                offset: task_count as usize * 64,
            };
            let slot = BarrierSlot {
                location,
                desc: BarrierDesc::stall(),
            };
            CommandBufferRecord {
                batch: BatchBuffer {
                    csr: None,
                    task: None,
                    tail: location,
                    requires_coherency: false,
                    low_priority: false,
                    throttle: ThrottleLevel::Medium,
                },
                footprint: self.registry.footprint(&surfaces),
                surfaces,
                task_count,
                task_level,
                out_of_order,
                elidable_barrier: out_of_order.then_some(slot),
                epilogue: Some(slot),
                elide_barrier: false,
            }
        }
    }

    fn elided(aggregator: &SubmissionAggregator) -> Vec<bool> {
        aggregator.records().map(|r| r.elide_barrier).collect()
    }

    #[test]
    fn test_same_level_out_of_order_elides() {
        let fixture = Fixture::new();
        let mut aggregator = SubmissionAggregator::new();
        for task_count in 1..=3 {
            aggregator.record(fixture.record(task_count, 2, true, vec![]));
        }
        assert_eq!(elided(&aggregator), vec![true, true, false]);
        assert_eq!(aggregator.stats().elided_barriers, 2);
    }

    #[test]
    fn test_level_change_or_in_order_keeps_barrier() {
        let fixture = Fixture::new();
        let mut aggregator = SubmissionAggregator::new();
        aggregator.record(fixture.record(1, 1, true, vec![]));
        aggregator.record(fixture.record(2, 2, true, vec![]));
        aggregator.record(fixture.record(3, 2, false, vec![]));
        aggregator.record(fixture.record(4, 2, true, vec![]));
        assert_eq!(elided(&aggregator), vec![false, false, false, false]);
    }

    #[test]
    fn test_chain_splits_on_incompatible() {
        let fixture = Fixture::new();
        let mut aggregator = SubmissionAggregator::new();
        aggregator.record(fixture.record(1, 0, false, vec![]));
        let mut low = fixture.record(2, 0, false, vec![]);
        low.batch.low_priority = true;
        aggregator.record(low);
        aggregator.record(fixture.record(3, 0, false, vec![]));

        let sizes: Vec<usize> = core::iter::from_fn(|| {
            let chain = aggregator.take_next_chain(&fixture.registry, None);
            (!chain.is_empty()).then_some(chain.len())
        })
        .collect();
        assert_eq!(sizes, vec![1, 1, 1]);
        assert!(aggregator.is_empty());
        assert_eq!(aggregator.stats().chains, 3);
    }

    #[test]
    fn test_chain_memory_limit_counts_shared_surfaces_once() {
        let mut fixture = Fixture::new();
        let shared = fixture.surface(4);
        let other = fixture.surface(4);
        let mut aggregator = SubmissionAggregator::new();
        aggregator.record(fixture.record(1, 0, false, vec![shared]));
        aggregator.record(fixture.record(2, 0, false, vec![shared]));
        aggregator.record(fixture.record(3, 0, false, vec![other]));
        assert_eq!(aggregator.pending_footprint(), ByteSize::from_kib(12));

        let chain = aggregator.take_next_chain(&fixture.registry, Some(ByteSize::KIB_4));
        assert_eq!(chain.len(), 2);
        assert_eq!(aggregator.len(), 1);
        assert_eq!(aggregator.pending_footprint(), ByteSize::KIB_4);

        // An oversized first record still goes out on its own
        let chain = aggregator.take_next_chain(&fixture.registry, Some(ByteSize::ZERO));
        assert_eq!(chain.len(), 1);
    }
}
