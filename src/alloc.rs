//! Top-level allocator owning the root reservation and the dispatch wiring.
//!
//! Construction reserves one contiguous virtual address region and places
//! three quantum allocators in it, covering size orders 3..=10, 11..=18 and
//! 19..=26 with partition sizes of 128 KiB, 32 MiB and 8 GiB. Orders above
//! that route to the slab allocator, which reserves separately. The roster
//! makes the allocation hot path a single atomic load followed by one bitmap
//! claim.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::null_mut;

use std::sync::Arc;

use log::info;

use crate::quantum::QuantumAllocator;
use crate::roster::{Roster, RosterEntry, Target};
use crate::slab::SlabAllocator;
use crate::util::{is_valid_address, round_up, round_up_pow2, size_to_order, Space};
use crate::{
    mmap, Error, Result, LARGEST_SIZE, LARGEST_SIZE_ORDER, MAX_ADDRESS_ORDER,
    MAX_PARTITION_QUANTUM_ORDER, MAX_QUANTUM_ALLOCATORS, MAX_QUANTUM_ALLOCATOR_ORDERS,
    SMALLEST_SIZE_ORDER,
};

/// Smallest size order served by the i-th quantum allocator.
const fn smallest_order(i: usize) -> usize {
    SMALLEST_SIZE_ORDER + i * MAX_QUANTUM_ALLOCATOR_ORDERS
}

/// Partition size order of the i-th quantum allocator, chosen so a partition
/// of the smallest order has exactly the maximum quantum count.
const fn partition_size_order(i: usize) -> usize {
    smallest_order(i) + MAX_PARTITION_QUANTUM_ORDER
}

pub struct NativeAllocator {
    space: Space,
    quantum: Box<[QuantumAllocator]>,
    slab: SlabAllocator,
    roster: Arc<Roster>,
}

impl NativeAllocator {
    /// Create an allocator with the given partition counts per quantum
    /// allocator and slab slot count.
    ///
    /// A non-zero `address` places the reservation exactly there and must be
    /// aligned to the largest quantum size. In `shared` mode all registries
    /// use their concurrent claiming strategy; `secure` zeroes memory on
    /// free.
    pub fn create(
        address: u64,
        shared: bool,
        secure: bool,
        small: usize,
        medium: usize,
        large: usize,
        max_slabs: usize,
    ) -> Result<Self> {
        let counts = [small, medium, large];
        let mut offsets = [0usize; MAX_QUANTUM_ALLOCATORS];
        let mut reservation = 0usize;
        for (i, &count) in counts.iter().enumerate() {
            if count == 0 {
                offsets[i] = reservation;
                continue;
            }
            // Partitions must be aligned to their largest quantum size so the
            // quantum base mask arithmetic holds for every served order
            let largest = smallest_order(i) + MAX_QUANTUM_ALLOCATOR_ORDERS - 1;
            reservation = round_up(reservation, 1 << largest);
            offsets[i] = reservation;
            reservation += count << partition_size_order(i);
        }

        let base = if reservation == 0 {
            0
        } else if address == 0 {
            mmap::reserve_aligned(reservation, LARGEST_SIZE)
        } else {
            debug_assert!(
                is_valid_address(address) && address % LARGEST_SIZE as u64 == 0,
                "misaligned reservation address {address:#x}"
            );
            mmap::reserve_at(address, reservation)
        };
        if reservation != 0 && base == 0 {
            return Err(Error::Memory);
        }

        let roster = Arc::new(Roster::new());
        let quantum: Box<[QuantumAllocator]> = (0..MAX_QUANTUM_ALLOCATORS)
            .map(|i| {
                QuantumAllocator::new(
                    i,
                    base + offsets[i] as u64,
                    shared,
                    secure,
                    roster.clone(),
                    smallest_order(i),
                    partition_size_order(i),
                    counts[i],
                )
            })
            .collect();
        let slab = SlabAllocator::new(max_slabs, shared, secure);

        // Wire the dispatch table. Sub-quantum orders round up to the
        // smallest quantum; allocators without partitions serve nothing.
        for order in 0..smallest_order(0) {
            let entry = if counts[0] > 0 {
                RosterEntry::quantum(0)
            } else {
                RosterEntry::none()
            };
            roster.set(order, entry);
        }
        for (i, &count) in counts.iter().enumerate() {
            let entry = if count > 0 {
                RosterEntry::quantum(i)
            } else {
                RosterEntry::none()
            };
            for order in 0..MAX_QUANTUM_ALLOCATOR_ORDERS {
                roster.set(smallest_order(i) + order, entry);
            }
        }
        for order in LARGEST_SIZE_ORDER + 1..MAX_ADDRESS_ORDER {
            roster.set(order, RosterEntry::slab());
        }

        info!("created at {base:#x} reservation={reservation:#x} shared={shared} secure={secure}");
        Ok(Self {
            space: Space::new(base, reservation),
            quantum,
            slab,
            roster,
        })
    }

    /// The root reservation of the quantum allocators.
    pub fn space(&self) -> Space {
        self.space
    }

    /// Allocate a block of at least `size` bytes. The served size is always
    /// the next power of two (at least one quantum).
    pub fn allocate(&self, size: usize) -> Result<u64> {
        let order = size_to_order(size);
        let addr = match self.roster.get(order).target() {
            Some(Target::Quantum(i)) => self.quantum[i].allocate(order),
            Some(Target::Partition(i, slot)) => self.quantum[i].allocate_at(slot, order),
            Some(Target::Slab) => self.slab.allocate(order),
            None => 0,
        };
        if addr == 0 {
            return Err(Error::Memory);
        }
        Ok(addr)
    }

    /// Free the allocation at `addr`. Zero and unknown addresses are
    /// silently ignored.
    pub fn deallocate(&self, addr: u64) {
        if addr == 0 {
            return;
        }
        for quantum in self.quantum.iter() {
            if quantum.contains(addr) {
                return quantum.deallocate(addr);
            }
        }
        self.slab.deallocate(addr);
    }

    /// Resize the allocation at `old`. The block is moved (allocate, copy,
    /// free) only when the size order actually changes; shrinking within the
    /// same quantum returns `old` unchanged.
    pub fn reallocate(&self, old: u64, new_size: usize) -> Result<u64> {
        if old == 0 {
            return self.allocate(new_size);
        }
        let old_size = self.allocation_size(old);
        if old_size < round_up_pow2(new_size) || size_to_order(new_size) < size_to_order(old_size)
        {
            let addr = self.allocate(new_size)?;
            let len = old_size.min(self.allocation_size(addr));
            if len > 0 {
                mmap::copy(old, addr, len);
            }
            self.deallocate(old);
            return Ok(addr);
        }
        Ok(old)
    }

    /// Zero the whole block containing `addr`.
    pub fn clear(&self, addr: u64) {
        if addr == 0 {
            return;
        }
        for quantum in self.quantum.iter() {
            if quantum.contains(addr) {
                return quantum.clear(addr);
            }
        }
        self.slab.clear(addr);
    }

    /// Size of the block containing `addr`, or 0 for unknown addresses.
    /// Always an exact power of two, not the requested size.
    pub fn allocation_size(&self, addr: u64) -> usize {
        if addr == 0 {
            return 0;
        }
        for quantum in self.quantum.iter() {
            if quantum.contains(addr) {
                return quantum.allocation_size(addr);
            }
        }
        self.slab.allocation_size(addr)
    }

    /// Base address of the block containing `addr`, or 0.
    pub fn allocation_base(&self, addr: u64) -> u64 {
        if addr == 0 {
            return 0;
        }
        for quantum in self.quantum.iter() {
            if quantum.contains(addr) {
                return quantum.allocation_base(addr);
            }
        }
        self.slab.allocation_base(addr)
    }

    /// Next live allocation after `addr` (0 starts the iteration), visiting
    /// the quantum allocators in address order, then the slabs. Sampled;
    /// concurrent mutations may or may not be observed.
    pub fn next_allocation(&self, addr: u64) -> u64 {
        let mut addr = addr;
        for quantum in self.quantum.iter() {
            if addr != 0 && !quantum.contains(addr) {
                continue;
            }
            let next = quantum.next_allocation(addr);
            if next != 0 {
                return next;
            }
            addr = 0;
        }
        self.slab.next_allocation(addr)
    }

    /// Sampled allocation counts and byte totals per size order. Slot 0
    /// holds the sums over all orders.
    pub fn stats(&self, counts: &mut [usize; 64], sizes: &mut [usize; 64]) {
        counts.fill(0);
        sizes.fill(0);
        for quantum in self.quantum.iter() {
            quantum.stats(counts, sizes);
        }
        self.slab.stats(counts, sizes);
        counts[0] = counts[1..].iter().sum();
        sizes[0] = sizes[1..].iter().sum();
    }

    /// Sampled number of live allocations.
    #[cold]
    pub fn allocated_count(&self) -> usize {
        let mut counts = [0; 64];
        let mut sizes = [0; 64];
        self.stats(&mut counts, &mut sizes);
        counts[0]
    }

    /// Sampled number of live bytes, in served (rounded) sizes.
    #[cold]
    pub fn allocated_bytes(&self) -> usize {
        let mut counts = [0; 64];
        let mut sizes = [0; 64];
        self.stats(&mut counts, &mut sizes);
        sizes[0]
    }

    /// Tear the allocator down. The caller must have drained all concurrent
    /// use; every outstanding address is invalid afterwards.
    pub fn close(self) {}
}

impl Drop for NativeAllocator {
    fn drop(&mut self) {
        self.slab.close();
        if self.space.size() != 0 {
            mmap::release(self.space.base(), self.space.size());
        }
    }
}

/// Served blocks are power-of-two sized and self-aligned, so requesting
/// `max(size, align)` bytes satisfies any layout the allocator can serve.
unsafe impl GlobalAlloc for NativeAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.allocate(layout.size().max(layout.align())) {
            Ok(addr) => addr as *mut u8,
            Err(_) => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.deallocate(ptr as u64);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // Recycled quanta keep their previous contents
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            self.clear(ptr as u64);
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        match self.reallocate(ptr as u64, new_size.max(layout.align())) {
            Ok(addr) => addr as *mut u8,
            Err(_) => null_mut(),
        }
    }
}

impl fmt::Debug for NativeAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NativeAllocator {{")?;
        writeln!(f, "    space: {:?}", self.space)?;
        for quantum in self.quantum.iter() {
            writeln!(f, "    {quantum:?}")?;
        }
        writeln!(f, "    {:?}", self.slab)?;
        write!(f, "}}")
    }
}

#[cfg(test)]
mod test {
    use spin::Barrier;

    use super::NativeAllocator;
    use crate::util::{logging, size_to_order, WyRand};
    use crate::{thread, Error, MAX_PARTITION_QUANTUM};

    fn default() -> NativeAllocator {
        logging();
        NativeAllocator::create(0, false, false, 8, 8, 8, 8).unwrap()
    }

    #[test]
    fn size_and_base_queries() {
        let alloc = default();
        let a = alloc.allocate(13).unwrap();
        assert_ne!(a, 0);
        assert_eq!(alloc.allocation_size(a), 16);
        assert_eq!(alloc.allocation_size(a + 15), 16);
        assert_eq!(alloc.allocation_base(a + 15), a);
    }

    #[test]
    fn quantum_alignment() {
        let alloc = default();
        for order in 3..=26 {
            let addr = alloc.allocate(1 << order).unwrap();
            assert_eq!(addr % (1u64 << order), 0, "o={order}");
            assert_eq!(alloc.allocation_size(addr), 1 << order);
            assert_eq!(alloc.allocation_base(addr + (1 << order) - 1), addr);
            alloc.deallocate(addr);
        }
    }

    #[test]
    fn reallocation() {
        let alloc = default();
        let a = alloc.allocate(64).unwrap();
        let b = alloc.reallocate(a, 63).unwrap();
        assert_eq!(b, a);
        let c = alloc.reallocate(b, 64).unwrap();
        assert_eq!(c, b);
        let d = alloc.reallocate(c, 65).unwrap();
        assert_ne!(d, c);
        assert_eq!(alloc.allocation_size(d), 128);
        // Shrinking back recycles the quantum freed above
        let e = alloc.reallocate(d, 64).unwrap();
        assert_eq!(e, a);
        let f = alloc.reallocate(0, 64).unwrap();
        assert_ne!(f, 0);
    }

    #[test]
    fn realloc_preserves_content() {
        let alloc = default();
        let a = alloc.allocate(32).unwrap();
        let data = unsafe { core::slice::from_raw_parts_mut(a as *mut u64, 4) };
        data.copy_from_slice(&[1, 2, 3, 4]);

        let b = alloc.reallocate(a, 512).unwrap();
        assert_ne!(b, a);
        let moved = unsafe { core::slice::from_raw_parts(b as *const u64, 4) };
        assert_eq!(moved, &[1, 2, 3, 4]);
    }

    #[test]
    fn clearing() {
        let alloc = default();
        let a1 = alloc.allocate(32).unwrap();
        let a2 = alloc.allocate(32).unwrap();
        let a3 = alloc.allocate(32).unwrap();
        for &addr in &[a1, a2, a3] {
            unsafe {
                core::slice::from_raw_parts_mut(addr as *mut u64, 4)
                    .copy_from_slice(&[addr; 4])
            };
        }
        alloc.clear(a2);
        let read = |addr: u64| unsafe { core::slice::from_raw_parts(addr as *const u64, 4) };
        assert_eq!(read(a2), &[0; 4]);
        assert_eq!(read(a1), &[a1; 4]);
        assert_eq!(read(a3), &[a3; 4]);
    }

    #[test]
    fn iteration_in_order() {
        let alloc = default();
        let a1 = alloc.allocate(16).unwrap();
        let a2 = alloc.allocate(16).unwrap();
        assert_eq!(alloc.next_allocation(0), a1);
        assert_eq!(alloc.next_allocation(a1), a2);
        assert_eq!(alloc.next_allocation(a2), 0);
    }

    #[test]
    fn iteration_spans_allocators() {
        let alloc = default();
        let small = alloc.allocate(8).unwrap();
        let medium = alloc.allocate(4096).unwrap();
        let large = alloc.allocate(1 << 20).unwrap();

        let mut seen = Vec::new();
        let mut addr = alloc.next_allocation(0);
        while addr != 0 {
            seen.push(addr);
            addr = alloc.next_allocation(addr);
        }
        assert_eq!(seen.len(), 3);
        // The three quantum allocators are contiguous ascending
        assert_eq!(seen, [small, medium, large]);
    }

    #[test]
    fn unknown_addresses() {
        let alloc = default();
        let a = alloc.allocate(100).unwrap();
        let bogus = alloc.space().limit() + 0x1000;

        alloc.deallocate(bogus);
        assert_eq!(alloc.allocation_size(bogus), 0);
        assert_eq!(alloc.allocation_base(bogus), 0);
        assert_eq!(alloc.next_allocation(bogus), 0);
        // Nothing observable changed
        assert_eq!(alloc.allocated_count(), 1);
        assert_eq!(alloc.next_allocation(0), a);
        alloc.deallocate(0);
        assert_eq!(alloc.allocated_count(), 1);
    }

    #[test]
    fn recycling() {
        let alloc = default();
        let a = alloc.allocate(24).unwrap();
        alloc.deallocate(a);
        assert_eq!(alloc.allocate(24).unwrap(), a);
    }

    #[test]
    fn disjoint_allocations() {
        let alloc = default();
        let mut rng = WyRand::new(42);
        let mut live: Vec<(u64, usize)> = Vec::new();
        for _ in 0..500 {
            let size = rng.range(1..5000) as usize;
            let addr = alloc.allocate(size).unwrap();
            let served = alloc.allocation_size(addr);
            assert!(served >= size);
            assert_eq!(addr % served as u64, 0);
            live.push((addr, served));
        }
        live.sort_unstable();
        for pair in live.windows(2) {
            assert!(
                pair[0].0 + pair[0].1 as u64 <= pair[1].0,
                "overlap: {pair:?}"
            );
        }
    }

    #[test]
    fn stats_conservation() {
        let alloc = default();
        let mut counts = [0; 64];
        let mut sizes = [0; 64];

        let a = alloc.allocate(13).unwrap();
        let b = alloc.allocate(5000).unwrap();
        let c = alloc.allocate(1 << 21).unwrap();
        alloc.stats(&mut counts, &mut sizes);
        assert_eq!(counts[0], 3);
        assert_eq!(counts[4], 1);
        assert_eq!(counts[13], 1);
        assert_eq!(counts[21], 1);
        assert_eq!(sizes[0], 16 + 8192 + (1 << 21));
        assert_eq!(alloc.allocated_bytes(), sizes[0]);

        alloc.deallocate(a);
        alloc.deallocate(b);
        alloc.deallocate(c);
        alloc.stats(&mut counts, &mut sizes);
        assert_eq!(counts[0], 0);
        assert_eq!(sizes[0], 0);
    }

    #[test]
    fn exhaustion_terminates() {
        logging();
        let alloc = NativeAllocator::create(0, false, false, 1, 1, 1, 1).unwrap();
        let mut calls = 0;
        loop {
            calls += 1;
            assert!(calls <= MAX_PARTITION_QUANTUM + 2, "no exhaustion");
            match alloc.allocate(2049) {
                Ok(addr) => assert_ne!(addr, 0),
                Err(Error::Memory) => break,
                Err(e) => panic!("{e:?}"),
            }
        }
        // 32 MiB partition in 4 KiB quanta
        assert_eq!(calls, 8192 + 1);
    }

    #[test]
    fn zero_partition_counts() {
        logging();
        let alloc = NativeAllocator::create(0, false, false, 4, 0, 0, 2).unwrap();
        assert!(alloc.allocate(8).is_ok());
        // Medium and large orders have no partitions to serve from
        assert_eq!(alloc.allocate(4096), Err(Error::Memory));
        assert_eq!(alloc.allocate(1 << 20), Err(Error::Memory));
        // Slabs still work
        let slab = alloc.allocate(1 << 27).unwrap();
        assert_eq!(alloc.allocation_size(slab), 1 << 27);
    }

    #[test]
    fn slab_sizes() {
        let alloc = default();
        let size = (1 << 27) + 1;
        let a = alloc.allocate(size).unwrap();
        assert_eq!(alloc.allocation_size(a), 1 << 28);
        assert_eq!(a % (1 << size_to_order(size)), 0);
        assert_eq!(alloc.allocation_base(a + 12345), a);

        // Slab allocations show up in the iteration after the quantum ranges
        let q = alloc.allocate(8).unwrap();
        assert_eq!(alloc.next_allocation(0), q);
        assert_eq!(alloc.next_allocation(q), a);
        assert_eq!(alloc.next_allocation(a), 0);

        alloc.deallocate(a);
        assert_eq!(alloc.allocated_count(), 1);
    }

    #[test]
    fn secure_mode_zeroes_on_free() {
        logging();
        let alloc = NativeAllocator::create(0, false, true, 2, 2, 2, 2).unwrap();
        let a = alloc.allocate(64).unwrap();
        unsafe { core::slice::from_raw_parts_mut(a as *mut u64, 8).fill(u64::MAX) };
        alloc.deallocate(a);
        let b = alloc.allocate(64).unwrap();
        assert_eq!(b, a);
        let data = unsafe { core::slice::from_raw_parts(b as *const u64, 8) };
        assert!(data.iter().all(|&v| v == 0));
    }

    #[test]
    fn global_alloc_adapter() {
        use core::alloc::{GlobalAlloc, Layout};

        let alloc = default();
        let layout = Layout::from_size_align(24, 16).unwrap();
        let a = unsafe { alloc.alloc(layout) };
        assert!(!a.is_null());
        assert_eq!(a as usize % 16, 0);
        unsafe { a.write_bytes(0xab, 24) };
        unsafe { alloc.dealloc(a, layout) };

        // The recycled quantum is dirty, alloc_zeroed must scrub it
        let b = unsafe { alloc.alloc_zeroed(layout) };
        assert_eq!(b, a);
        assert!(unsafe { core::slice::from_raw_parts(b, 24) }
            .iter()
            .all(|&v| v == 0));
        unsafe { alloc.dealloc(b, layout) };

        // Over-aligned layouts are served by a block of the alignment size
        let over = Layout::from_size_align(8, 4096).unwrap();
        let c = unsafe { alloc.alloc(over) };
        assert_eq!(c as usize % 4096, 0);
        assert_eq!(alloc.allocation_size(c as u64), 4096);
        unsafe { alloc.dealloc(c, over) };

        assert_eq!(alloc.allocated_count(), 0);
    }

    #[test]
    fn parallel_alloc_free() {
        logging();
        const THREADS: usize = 8;
        const ROUNDS: usize = 100;

        let alloc = NativeAllocator::create(0, true, false, 8, 8, 8, 8).unwrap();
        let barrier = Barrier::new(THREADS);

        let all = thread::parallel(0..THREADS, |t| {
            thread::pin(t);
            barrier.wait();
            let mut seen = Vec::with_capacity(ROUNDS);
            for _ in 0..ROUNDS {
                let addr = alloc.allocate(8).unwrap();
                seen.push(addr);
                alloc.deallocate(addr);
            }
            seen
        });

        assert_eq!(alloc.allocated_count(), 0);
        // An address may be reused over time but never handed out twice at
        // once; with alternating alloc/free, the simultaneity window is the
        // whole round, which the count above already rules out.
        for seen in all {
            assert_eq!(seen.len(), ROUNDS);
        }
    }

    #[test]
    fn parallel_churn() {
        logging();
        const THREADS: usize = 4;
        const PER_THREAD: usize = 256;

        let alloc = NativeAllocator::create(0, true, false, 8, 8, 8, 8).unwrap();
        let barrier = Barrier::new(THREADS);

        let all = thread::parallel(0..THREADS, |t| {
            thread::pin(t);
            let mut rng = WyRand::new(t as u64);
            let mut live = Vec::with_capacity(PER_THREAD);
            barrier.wait();
            for _ in 0..PER_THREAD {
                live.push(alloc.allocate(rng.range(1..4096) as usize).unwrap());
            }
            rng.shuffle(&mut live);
            for addr in live.drain(..PER_THREAD / 2) {
                alloc.deallocate(addr);
            }
            for _ in 0..PER_THREAD / 2 {
                live.push(alloc.allocate(rng.range(1..4096) as usize).unwrap());
            }
            live
        });

        // All live allocations are pairwise distinct across threads
        let mut flat: Vec<_> = all.iter().flatten().copied().collect();
        let total = flat.len();
        flat.sort_unstable();
        flat.dedup();
        assert_eq!(flat.len(), total);
        assert_eq!(alloc.allocated_count(), total);

        for addrs in all {
            for addr in addrs {
                alloc.deallocate(addr);
            }
        }
        assert_eq!(alloc.allocated_count(), 0);
    }

    #[test]
    fn closing() {
        logging();
        // Fixed address so no concurrent test maps into the observed range
        const ADDRESS: u64 = 0x1000_0000_0000;
        let alloc = NativeAllocator::create(ADDRESS, false, false, 1, 0, 0, 0).unwrap();
        let size = alloc.space().size();
        assert_eq!(alloc.space().base(), ADDRESS);
        alloc.allocate(8).unwrap();
        alloc.close();

        // The root reservation is gone and can be taken again
        assert_eq!(crate::mmap::reserve_at(ADDRESS, size), ADDRESS);
        crate::mmap::release(ADDRESS, size);
    }
}
