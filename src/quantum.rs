//! Quantum allocator: a fleet of equal-sized partitions, each currently
//! assigned one size order out of the allocator's configured range.
//!
//! The partition registry tracks which slots have been handed out to a
//! partition incarnation (and are committed); one order registry per handled
//! order tracks which partitions are *online* for that order and reachable
//! by the fast-path iteration. A slot is online for at most one order at a
//! time. Taking a slot offline is the linearization point for ownership of
//! the slot; only the thread that actually cleared the online bit may
//! rebuild the partition at a different order.

use core::fmt;

use std::sync::Arc;

use log::{info, warn};

use crate::partition::Partition;
use crate::registry::Registry;
use crate::roster::{Roster, RosterEntry};
use crate::util::Space;
use crate::{mmap, CAS_RETRIES, MAX_QUANTUM_ALLOCATOR_ORDERS};

pub struct QuantumAllocator {
    space: Space,
    /// Own position in the top-level allocator, used in roster entries.
    index: usize,
    partition_size_order: usize,
    partition_count: usize,
    smallest_order: usize,
    partitions: Box<[Partition]>,
    /// Bit set: slot handed out to an incarnation, memory committed.
    partition_registry: Registry,
    /// Bit set: partition online for the order, one registry per order.
    order_registries: Box<[Registry]>,
    roster: Arc<Roster>,
}

impl QuantumAllocator {
    pub fn new(
        index: usize,
        base: u64,
        shared: bool,
        secure: bool,
        roster: Arc<Roster>,
        smallest_order: usize,
        partition_size_order: usize,
        partition_count: usize,
    ) -> Self {
        let partition_size = 1usize << partition_size_order;
        let partitions: Box<[Partition]> = (0..partition_count)
            .map(|slot| {
                Partition::new(
                    base + ((slot as u64) << partition_size_order),
                    partition_size,
                    shared,
                    secure,
                )
            })
            .collect();
        let order_registries = (0..MAX_QUANTUM_ALLOCATOR_ORDERS)
            .map(|_| Registry::new(partition_count, shared))
            .collect();
        info!(
            "quantum allocator {index}: o={smallest_order}..={} p={partition_count}x{partition_size:#x} at {base:#x}",
            smallest_order + MAX_QUANTUM_ALLOCATOR_ORDERS - 1
        );
        Self {
            space: Space::new(base, partition_count << partition_size_order),
            index,
            partition_size_order,
            partition_count,
            smallest_order,
            partitions,
            partition_registry: Registry::new(partition_count, shared),
            order_registries,
            roster,
        }
    }

    pub fn space(&self) -> Space {
        self.space
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.space.contains(addr)
    }

    pub fn smallest_order(&self) -> usize {
        self.smallest_order
    }

    pub fn largest_order(&self) -> usize {
        self.smallest_order + MAX_QUANTUM_ALLOCATOR_ORDERS - 1
    }

    fn order_index(&self, order: usize) -> usize {
        debug_assert!((self.smallest_order..=self.largest_order()).contains(&order));
        order - self.smallest_order
    }

    fn slot_of(&self, addr: u64) -> usize {
        debug_assert!(self.contains(addr));
        ((addr - self.space.base()) >> self.partition_size_order) as usize
    }

    /// Allocate one quantum of the given order. Returns 0 on exhaustion.
    ///
    /// Serves from the partitions online for the order first; when those are
    /// full, brings a fresh partition online; as a last resort repurposes an
    /// empty partition assigned to a different order.
    pub fn allocate(&self, order: usize) -> u64 {
        let oi = self.order_index(order);
        for _ in 0..CAS_RETRIES {
            for slot in self.order_registries[oi].iter_set() {
                let addr = self.partitions[slot].allocate(order);
                if addr != 0 {
                    return addr;
                }
            }
            if let Some(slot) = self.allocate_partition() {
                self.partitions[slot].rebuild(order);
                self.add_to_order(oi, slot);
                let addr = self.partitions[slot].allocate(order);
                if addr != 0 {
                    return addr;
                }
                // Contenders drained the new partition, try again
                continue;
            }
            match self.free_up_partition(order) {
                Some(slot) => {
                    let addr = self.partitions[slot].allocate(order);
                    if addr != 0 {
                        return addr;
                    }
                }
                None => return 0,
            }
        }
        warn!("no progress a={} o={order}", self.index);
        0
    }

    /// Fast path for a roster entry naming one partition directly. A full
    /// partition is excluded from the retry iteration so a miss cannot
    /// reselect it.
    pub fn allocate_at(&self, slot: usize, order: usize) -> u64 {
        let partition = &self.partitions[slot];
        if partition.quantum_order() == order {
            let addr = partition.allocate(order);
            if addr != 0 {
                return addr;
            }
            return self.allocate_excluding(slot, order);
        }
        // Stale roster entry, the slot serves another order by now
        self.allocate(order)
    }

    /// Allocate with `full` taken offline, so the iteration cannot come back
    /// to the partition that just reported exhaustion. The slot is put back
    /// online on every exit path.
    fn allocate_excluding(&self, full: usize, order: usize) -> u64 {
        let oi = self.order_index(order);
        self.offline_partition(oi, full);
        let _reonline = Reonline {
            owner: self,
            oi,
            slot: full,
        };
        self.allocate(order)
    }

    /// Claim a free slot from the partition registry and commit its memory.
    fn allocate_partition(&self) -> Option<usize> {
        let slot = self.partition_registry.find_free()?;
        let base = self.space.base() + ((slot as u64) << self.partition_size_order);
        if !mmap::commit(base, 1 << self.partition_size_order) {
            self.partition_registry.free(slot);
            return None;
        }
        Some(slot)
    }

    /// Publish the partition for the order: set the online bit and point the
    /// roster at the partition itself.
    fn add_to_order(&self, oi: usize, slot: usize) {
        self.order_registries[oi].set(slot);
        self.roster.set(
            self.smallest_order + oi,
            RosterEntry::partition(self.index, slot),
        );
    }

    /// Take the partition offline: clear the online bit and route the order
    /// back to this allocator. Returns whether this call cleared the bit.
    fn offline_partition(&self, oi: usize, slot: usize) -> bool {
        let changed = self.order_registries[oi].clear(slot);
        self.roster
            .set(self.smallest_order + oi, RosterEntry::quantum(self.index));
        changed
    }

    /// Undo of `offline_partition`.
    fn online_partition(&self, oi: usize, slot: usize) {
        self.order_registries[oi].set(slot);
    }

    /// Scan slots from high to low for a speculatively empty partition,
    /// take it offline, re-check emptiness under the offline guarantee and
    /// rebuild it for `order`. Returns the rebuilt slot.
    fn free_up_partition(&self, order: usize) -> Option<usize> {
        let oi = self.order_index(order);
        for slot in (0..self.partition_count).rev() {
            if !self.partition_registry.is_set(slot) {
                continue;
            }
            let partition = &self.partitions[slot];
            if !partition.is_empty() {
                continue;
            }
            let current = partition.quantum_order();
            if current < self.smallest_order {
                // Slot claimed by a contender that has not built it yet
                continue;
            }
            let current_oi = self.order_index(current);
            if !self.offline_partition(current_oi, slot) {
                // Someone else owns the transition
                continue;
            }
            if partition.is_empty() {
                info!("repurpose a={} slot={slot} o={current}->{order}", self.index);
                partition.rebuild(order);
                self.add_to_order(oi, slot);
                return Some(slot);
            }
            self.online_partition(current_oi, slot);
        }
        None
    }

    pub fn deallocate(&self, addr: u64) {
        let slot = self.slot_of(addr);
        if !self.partition_registry.is_set(slot) {
            return;
        }
        self.partitions[slot].deallocate(addr);
    }

    pub fn clear(&self, addr: u64) {
        let slot = self.slot_of(addr);
        if self.partition_registry.is_set(slot) {
            self.partitions[slot].clear(addr);
        }
    }

    pub fn allocation_size(&self, addr: u64) -> usize {
        let slot = self.slot_of(addr);
        if !self.partition_registry.is_set(slot) {
            return 0;
        }
        self.partitions[slot].allocation_size(addr)
    }

    pub fn allocation_base(&self, addr: u64) -> u64 {
        let slot = self.slot_of(addr);
        if !self.partition_registry.is_set(slot) {
            return 0;
        }
        self.partitions[slot].allocation_base(addr)
    }

    /// Walk the slots upward, continuing into the next partition with a
    /// fresh start once the current one is exhausted.
    pub fn next_allocation(&self, addr: u64) -> u64 {
        let mut addr = addr;
        let mut slot = if addr == 0 { 0 } else { self.slot_of(addr) };
        while slot < self.partition_count {
            if self.partition_registry.is_set(slot) {
                let next = self.partitions[slot].next_allocation(addr);
                if next != 0 {
                    return next;
                }
            }
            addr = 0;
            slot += 1;
        }
        0
    }

    pub fn stats(&self, counts: &mut [usize], sizes: &mut [usize]) {
        for slot in self.partition_registry.iter_set() {
            self.partitions[slot].stats(counts, sizes);
        }
    }
}

/// Puts the excluded partition back online when the allocation attempt ends.
struct Reonline<'a> {
    owner: &'a QuantumAllocator,
    oi: usize,
    slot: usize,
}

impl Drop for Reonline<'_> {
    fn drop(&mut self) {
        self.owner.online_partition(self.oi, self.slot);
    }
}

impl fmt::Debug for QuantumAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "QuantumAllocator {} {{", self.index)?;
        writeln!(f, "    space: {:?}", self.space)?;
        writeln!(f, "    partitions: {:?}", self.partition_registry)?;
        for (oi, registry) in self.order_registries.iter().enumerate() {
            if registry.count() > 0 {
                writeln!(f, "    o={}: {registry:?}", self.smallest_order + oi)?;
            }
        }
        write!(f, "}}")
    }
}
