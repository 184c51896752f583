//! # NUMA Topology & Distance-Ordered Fallback
//!
//! The firmware distance matrix (10 = local, larger = farther) drives a
//! precomputed fallback order per node: row i is the permutation of all
//! nodes sorted by ascending distance from i, ties broken by index. The
//! sort is stable, so fallback is deterministic for equal distances.
//!
//! Cross-node fallback is strict: the first node's lock is dropped
//! before the next node is tried, and the per-node attempt never
//! recurses into further fallback.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use orion_hal::{PlatformInfo, MAX_NUMA_NODES, PAGE_SHIFT};

use crate::buddy::NodeAllocator;
use crate::AllocError;

// =============================================================================
// Topology
// =============================================================================

/// Distance matrix and derived fallback order.
pub struct NumaTopology {
    node_count: usize,
    /// Row-major `node_count × node_count` distances.
    distance: Vec<u8>,
    /// Row i: node indices sorted by ascending distance from i.
    fallback: Vec<ArrayVec<u8, MAX_NUMA_NODES>>,
}

impl NumaTopology {
    /// Build the topology from the firmware description.
    pub fn from_platform(info: &PlatformInfo) -> Self {
        let node_count = (info.node_count.max(1) as usize).min(MAX_NUMA_NODES);

        let mut distance = Vec::with_capacity(node_count * node_count);
        for from in 0..node_count {
            for to in 0..node_count {
                distance.push(info.distance(from, to));
            }
        }

        let mut topology = Self {
            node_count,
            distance,
            fallback: Vec::new(),
        };
        topology.build_fallback_order();
        topology
    }

    /// Single-node topology for UMA operation.
    pub fn uniform() -> Self {
        let mut topology = Self {
            node_count: 1,
            distance: alloc::vec![10],
            fallback: Vec::new(),
        };
        topology.build_fallback_order();
        topology
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Distance between two nodes (10 = local).
    pub fn distance(&self, from: usize, to: usize) -> u8 {
        if from < self.node_count && to < self.node_count {
            self.distance[from * self.node_count + to]
        } else {
            u8::MAX
        }
    }

    /// Fallback row for a node: all node indices, nearest first. The
    /// first entry is the node itself.
    pub fn fallback_order(&self, node: usize) -> &[u8] {
        &self.fallback[node.min(self.node_count - 1)]
    }

    fn build_fallback_order(&mut self) {
        self.fallback.clear();
        for from in 0..self.node_count {
            let mut row: ArrayVec<u8, MAX_NUMA_NODES> = (0..self.node_count as u8).collect();
            // Stable sort keeps index order for equal distances.
            row.sort_by_key(|&to| self.distance(from, to as usize));
            self.fallback.push(row);
        }
    }
}

// =============================================================================
// NUMA Allocator
// =============================================================================

/// The per-node allocators plus their fallback policy.
pub struct NumaAllocator {
    topology: NumaTopology,
    nodes: Vec<NodeAllocator>,
}

impl NumaAllocator {
    /// Build the allocator set from the firmware description, seeding
    /// each node with its declared memory ranges.
    pub fn from_platform(info: &PlatformInfo) -> Self {
        let topology = NumaTopology::from_platform(info);
        let mut nodes = Vec::with_capacity(topology.node_count());

        for node_id in 0..topology.node_count() {
            let ranges = info
                .node_memory
                .get(node_id)
                .map(|m| m.ranges.as_slice())
                .unwrap_or(&[]);

            let start_pfn = ranges
                .iter()
                .map(|r| r.base >> PAGE_SHIFT)
                .min()
                .unwrap_or(0);
            let end_pfn = ranges
                .iter()
                .map(|r| (r.base + r.length) >> PAGE_SHIFT)
                .max()
                .unwrap_or(start_pfn);

            let node = NodeAllocator::new(node_id as u32, start_pfn, end_pfn);
            for range in ranges {
                node.add_free_range(range.base >> PAGE_SHIFT, (range.base + range.length) >> PAGE_SHIFT);
            }
            log::debug!(
                "NUMA: node {} spans PFN {:#x}..{:#x}, {} pages free",
                node_id,
                start_pfn,
                end_pfn,
                node.free_pages()
            );
            nodes.push(node);
        }

        Self { topology, nodes }
    }

    /// Build directly from prepared node allocators; the distance
    /// matrix is row-major `nodes.len()²`.
    pub fn from_parts(nodes: Vec<NodeAllocator>, distance: &[u8]) -> Self {
        let node_count = nodes.len().max(1);
        let mut topology = NumaTopology {
            node_count,
            distance: distance.to_vec(),
            fallback: Vec::new(),
        };
        if topology.distance.len() != node_count * node_count {
            topology.distance = alloc::vec![10; node_count * node_count];
            for i in 0..node_count {
                for j in 0..node_count {
                    if i != j {
                        topology.distance[i * node_count + j] = 20;
                    }
                }
            }
        }
        topology.build_fallback_order();
        Self { topology, nodes }
    }

    /// Node count.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Topology view.
    pub fn topology(&self) -> &NumaTopology {
        &self.topology
    }

    /// Allocate `2^order` pages on `node`, falling back to the other
    /// nodes in ascending distance order when the node is exhausted.
    pub fn alloc_pages(&self, node: u32, order: u32) -> Result<u64, AllocError> {
        let node = node as usize;
        if node >= self.nodes.len() {
            return Err(AllocError::InvalidNode);
        }

        // Local attempt covers splitting; failure means the node has no
        // block of any usable order.
        match self.nodes[node].alloc(order) {
            Ok(pfn) => return Ok(pfn),
            Err(AllocError::OutOfMemory) => {}
            Err(err) => return Err(err),
        }

        // Fallback row starts with the node itself; skip it. Each
        // attempt is strict so fallback never cascades, and only one
        // node lock is ever held at a time.
        for &fallback in &self.topology.fallback_order(node)[1..] {
            match self.nodes[fallback as usize].alloc(order) {
                Ok(pfn) => return Ok(pfn),
                Err(AllocError::OutOfMemory) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(AllocError::OutOfMemory)
    }

    /// Strict single-node allocation, no fallback.
    pub fn alloc_pages_strict(&self, node: u32, order: u32) -> Result<u64, AllocError> {
        self.nodes
            .get(node as usize)
            .ok_or(AllocError::InvalidNode)?
            .alloc(order)
    }

    /// Free a block; the owning node is derived from the frame number.
    pub fn free_pages(&self, pfn: u64, order: u32) -> Result<(), AllocError> {
        let node = self.page_node(pfn).ok_or(AllocError::InvalidFrame)?;
        self.nodes[node as usize].free(pfn, order)
    }

    /// Node owning a frame number, if any.
    pub fn page_node(&self, pfn: u64) -> Option<u32> {
        self.nodes
            .iter()
            .find(|n| n.owns(pfn))
            .map(|n| n.node_id())
    }

    /// Free pages on one node.
    pub fn node_free_pages(&self, node: u32) -> u64 {
        self.nodes
            .get(node as usize)
            .map(|n| n.free_pages())
            .unwrap_or(0)
    }

    /// Free pages across all nodes.
    pub fn total_free_pages(&self) -> u64 {
        self.nodes.iter().map(|n| n.free_pages()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orion_hal::firmware::{MemoryRange, NodeMemory, ProcessorEntry};

    fn two_node_allocator(distance: &[u8]) -> NumaAllocator {
        // Node 0: PFNs 0x100..0x140, node 1: 0x200..0x280.
        let node0 = NodeAllocator::new(0, 0x100, 0x140);
        node0.add_free_range(0x100, 0x140);
        let node1 = NodeAllocator::new(1, 0x200, 0x280);
        node1.add_free_range(0x200, 0x280);
        NumaAllocator::from_parts(alloc::vec![node0, node1], distance)
    }

    #[test]
    fn test_fallback_order_sorted_by_distance() {
        let mut info = PlatformInfo::default();
        info.node_count = 3;
        for d in [10u8, 30, 20, 30, 10, 15, 20, 15, 10] {
            info.distances.push(d);
        }
        let topology = NumaTopology::from_platform(&info);
        assert_eq!(topology.fallback_order(0), &[0, 2, 1]);
        assert_eq!(topology.fallback_order(1), &[1, 2, 0]);
        assert_eq!(topology.fallback_order(2), &[2, 1, 0]);
    }

    #[test]
    fn test_fallback_ties_broken_by_index() {
        let mut info = PlatformInfo::default();
        info.node_count = 3;
        for d in [10u8, 20, 20, 20, 10, 20, 20, 20, 10] {
            info.distances.push(d);
        }
        let topology = NumaTopology::from_platform(&info);
        assert_eq!(topology.fallback_order(0), &[0, 1, 2]);
        assert_eq!(topology.fallback_order(2), &[2, 0, 1]);
    }

    #[test]
    fn test_local_allocation_preferred() {
        let numa = two_node_allocator(&[10, 20, 20, 10]);
        let pfn = numa.alloc_pages(0, 0).unwrap();
        assert_eq!(numa.page_node(pfn), Some(0));
    }

    #[test]
    fn test_fallback_to_distant_node() {
        // Exhaust node 0; allocation on node 0 must succeed from node 1
        // and the frame must map back to node 1.
        let numa = two_node_allocator(&[10, 20, 20, 10]);
        while numa.alloc_pages_strict(0, 0).is_ok() {}
        assert_eq!(numa.node_free_pages(0), 0);

        let before_remote = numa.node_free_pages(1);
        let pfn = numa.alloc_pages(0, 0).unwrap();
        assert_eq!(numa.page_node(pfn), Some(1));
        assert_eq!(numa.node_free_pages(1), before_remote - 1);

        // Freeing returns it to node 1.
        numa.free_pages(pfn, 0).unwrap();
        assert_eq!(numa.node_free_pages(1), before_remote);
    }

    #[test]
    fn test_strict_does_not_fall_back() {
        let numa = two_node_allocator(&[10, 20, 20, 10]);
        while numa.alloc_pages_strict(0, 0).is_ok() {}
        assert_eq!(
            numa.alloc_pages_strict(0, 0),
            Err(AllocError::OutOfMemory)
        );
        assert!(numa.node_free_pages(1) > 0);
    }

    #[test]
    fn test_invalid_node_rejected() {
        let numa = two_node_allocator(&[10, 20, 20, 10]);
        assert_eq!(numa.alloc_pages(7, 0), Err(AllocError::InvalidNode));
    }

    #[test]
    fn test_from_platform_builds_nodes() {
        let mut info = PlatformInfo::default();
        info.node_count = 2;
        info.processors.push(ProcessorEntry {
            logical_id: 0,
            apic_id: 0,
            acpi_id: 0,
            enabled: true,
        });
        let mut mem0 = NodeMemory::default();
        mem0.ranges.push(MemoryRange {
            base: 0x10_0000,
            length: 0x10_0000,
        });
        let mut mem1 = NodeMemory::default();
        mem1.ranges.push(MemoryRange {
            base: 0x40_0000,
            length: 0x20_0000,
        });
        info.node_memory.push(mem0);
        info.node_memory.push(mem1);

        let numa = NumaAllocator::from_platform(&info);
        assert_eq!(numa.node_count(), 2);
        assert_eq!(numa.node_free_pages(0), 0x100);
        assert_eq!(numa.node_free_pages(1), 0x200);
        assert_eq!(numa.total_free_pages(), 0x300);
    }
}
