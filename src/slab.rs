//! Slab allocator for large one-off reservations.
//!
//! Every slab is a self-aligned reservation obtained directly from the OS.
//! Deallocation only clears the occupancy bit and keeps the `(base, size)`
//! descriptor, so a later allocation of a compatible size reuses the
//! reservation without another syscall. A slot's descriptor is only written
//! by the thread that just won its registry bit; readers consult slots with
//! the bit set.

use core::fmt;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::SeqCst;

use log::{error, info};

use crate::registry::Registry;
use crate::{mmap, LARGEST_SIZE_ORDER, MAX_ALLOCATION_ORDER};

/// Descriptor of one large reservation, kept for recycling after free.
#[derive(Default)]
struct Slab {
    base: AtomicU64,
    size: AtomicU64,
}

pub struct SlabAllocator {
    secure: bool,
    registry: Registry,
    slots: Box<[Slab]>,
}

impl SlabAllocator {
    /// Smallest order served, directly above the quantum allocators.
    pub const SMALLEST_ORDER: usize = LARGEST_SIZE_ORDER + 1;
    /// Largest order served.
    pub const LARGEST_ORDER: usize = MAX_ALLOCATION_ORDER;

    pub fn new(max_count: usize, shared: bool, secure: bool) -> Self {
        Self {
            secure,
            registry: Registry::new(max_count, shared),
            slots: (0..max_count).map(|_| Slab::default()).collect(),
        }
    }

    /// Reserve a self-aligned slab of `1 << order` bytes. Returns 0 when all
    /// slots are taken, the order is out of range, or the OS refuses.
    pub fn allocate(&self, order: usize) -> u64 {
        if !(Self::SMALLEST_ORDER..=Self::LARGEST_ORDER).contains(&order) {
            error!("slab order out of range o={order}");
            return 0;
        }
        let size = 1u64 << order;
        let Some(slot) = self.registry.find_free() else {
            return 0;
        };
        let slab = &self.slots[slot];

        let base = slab.base.load(SeqCst);
        let old_size = slab.size.load(SeqCst);
        if base != 0 && old_size >= size {
            // Recycle the prior reservation, trimming any excess
            if old_size > size {
                mmap::release(base + size, (old_size - size) as usize);
            }
            if self.secure {
                // Back the surviving range with fresh zero pages
                mmap::uncommit(base, size as usize);
                if !mmap::commit(base, size as usize) {
                    mmap::release(base, size as usize);
                    slab.base.store(0, SeqCst);
                    slab.size.store(0, SeqCst);
                    self.registry.free(slot);
                    return 0;
                }
            }
            slab.size.store(size, SeqCst);
            info!("slab {slot} recycled o={order}");
            return base;
        }

        // Incompatible leftover, give it back first
        if base != 0 {
            mmap::release(base, old_size as usize);
            slab.base.store(0, SeqCst);
            slab.size.store(0, SeqCst);
        }
        let base = mmap::reserve_aligned(size as usize, size as usize);
        if base == 0 {
            self.registry.free(slot);
            return 0;
        }
        if !mmap::commit(base, size as usize) {
            mmap::release(base, size as usize);
            self.registry.free(slot);
            return 0;
        }
        slab.base.store(base, SeqCst);
        slab.size.store(size, SeqCst);
        info!("slab {slot} reserved o={order} at {base:#x}");
        base
    }

    /// Occupied slot containing `addr`, if any.
    fn find(&self, addr: u64) -> Option<usize> {
        if addr == 0 {
            return None;
        }
        self.registry.iter_set().find(|&slot| {
            let base = self.slots[slot].base.load(SeqCst);
            let size = self.slots[slot].size.load(SeqCst);
            base != 0 && base <= addr && addr < base + size
        })
    }

    /// Clears the occupancy bit but keeps the descriptor for recycling.
    /// Unknown addresses are ignored.
    pub fn deallocate(&self, addr: u64) {
        if let Some(slot) = self.find(addr) {
            self.registry.free(slot);
        }
    }

    /// Zero the whole slab containing `addr`.
    pub fn clear(&self, addr: u64) {
        if let Some(slot) = self.find(addr) {
            let slab = &self.slots[slot];
            mmap::clear(slab.base.load(SeqCst), slab.size.load(SeqCst) as usize);
        }
    }

    pub fn allocation_size(&self, addr: u64) -> usize {
        match self.find(addr) {
            Some(slot) => self.slots[slot].size.load(SeqCst) as usize,
            None => 0,
        }
    }

    pub fn allocation_base(&self, addr: u64) -> u64 {
        match self.find(addr) {
            Some(slot) => self.slots[slot].base.load(SeqCst),
            None => 0,
        }
    }

    /// Base of the next occupied slab after `addr`, or 0. An `addr` of 0
    /// starts a fresh iteration at slot 0.
    pub fn next_allocation(&self, addr: u64) -> u64 {
        let start = if addr == 0 {
            0
        } else {
            match self.find(addr) {
                Some(slot) => slot + 1,
                None => return 0,
            }
        };
        match self.registry.iter_set_from(start).next() {
            Some(slot) => self.slots[slot].base.load(SeqCst),
            None => 0,
        }
    }

    pub fn stats(&self, counts: &mut [usize], sizes: &mut [usize]) {
        for slot in self.registry.iter_set() {
            let size = self.slots[slot].size.load(SeqCst) as usize;
            if size != 0 {
                let order = size.trailing_zeros() as usize;
                counts[order] += 1;
                sizes[order] += size;
            }
        }
    }

    /// Release every remaining reservation, live or kept for recycling.
    pub fn close(&self) {
        for slab in self.slots.iter() {
            let base = slab.base.swap(0, SeqCst);
            let size = slab.size.swap(0, SeqCst);
            if base != 0 && size != 0 {
                mmap::release(base, size as usize);
            }
        }
    }
}

impl fmt::Debug for SlabAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SlabAllocator {{ {:?}", self.registry)?;
        for (slot, slab) in self.slots.iter().enumerate() {
            let base = slab.base.load(SeqCst);
            if base != 0 {
                writeln!(
                    f,
                    "    {slot}: {base:#x} +{:#x} {}",
                    slab.size.load(SeqCst),
                    if self.registry.is_set(slot) { "live" } else { "kept" }
                )?;
            }
        }
        write!(f, "}}")
    }
}
