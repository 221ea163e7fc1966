//! A single partition: one power-of-two sub-range of a quantum allocator,
//! carved into equal quanta of the partition's current size order.
//!
//! The partition value lives for the whole life of its slot; taking a slot
//! through another incarnation (a different quantum order) re-targets the
//! registry in place. Slot emptiness is tracked by the owning quantum
//! allocator's partition registry, never by an optional here.

use core::fmt;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::SeqCst;

use crate::mmap;
use crate::registry::Registry;
use crate::util::{order_div, order_mul, Space};
use crate::MAX_PARTITION_QUANTUM;

pub struct Partition {
    space: Space,
    secure: bool,
    /// Quantum size order of the current incarnation; 0 before the first
    /// `rebuild`.
    quantum_order: AtomicUsize,
    registry: Registry,
}

impl Partition {
    pub fn new(base: u64, size: usize, shared: bool, secure: bool) -> Self {
        Self {
            space: Space::new(base, size),
            secure,
            quantum_order: AtomicUsize::new(0),
            registry: Registry::with_capacity(MAX_PARTITION_QUANTUM, 0, shared),
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.space.contains(addr)
    }

    pub fn quantum_order(&self) -> usize {
        self.quantum_order.load(SeqCst)
    }

    /// Start a new incarnation serving quanta of the given order.
    ///
    /// The caller must own the slot exclusively: fresh from the partition
    /// registry, or offline with the emptiness re-checked.
    pub fn rebuild(&self, order: usize) {
        debug_assert!(self.space.size() >> order <= MAX_PARTITION_QUANTUM);
        self.quantum_order.store(order, SeqCst);
        self.registry.retarget(self.space.size() >> order);
    }

    /// Claim a free quantum. Returns 0 when the partition is full or no
    /// longer serves this order.
    pub fn allocate(&self, order: usize) -> u64 {
        if self.quantum_order() != order {
            // Stale dispatch, the slot was rebuilt concurrently
            return 0;
        }
        match self.registry.find_free() {
            Some(index) => self.space.base() + order_mul(index as u64, order),
            None => 0,
        }
    }

    pub fn deallocate(&self, addr: u64) {
        debug_assert!(self.contains(addr));
        let order = self.quantum_order();
        let index = order_div(addr - self.space.base(), order) as usize;
        debug_assert!(self.registry.is_set(index), "double free {addr:#x}");
        if self.secure {
            mmap::clear(self.allocation_base(addr), 1 << order);
        }
        self.registry.free(index);
    }

    /// Zero the quantum containing `addr`.
    pub fn clear(&self, addr: u64) {
        debug_assert!(self.contains(addr));
        mmap::clear(self.allocation_base(addr), self.allocation_size(addr));
    }

    pub fn allocation_size(&self, _addr: u64) -> usize {
        1 << self.quantum_order()
    }

    pub fn allocation_base(&self, addr: u64) -> u64 {
        addr & !((1u64 << self.quantum_order()) - 1)
    }

    /// Address of the next live quantum after `addr`, or 0. An `addr` of 0
    /// starts at the partition base.
    pub fn next_allocation(&self, addr: u64) -> u64 {
        let order = self.quantum_order();
        let start = if addr == 0 {
            0
        } else {
            order_div(addr - self.space.base(), order) as usize + 1
        };
        match self.registry.iter_set_from(start).next() {
            Some(index) => self.space.base() + order_mul(index as u64, order),
            None => 0,
        }
    }

    pub fn stats(&self, counts: &mut [usize], sizes: &mut [usize]) {
        let order = self.quantum_order();
        let count = self.registry.count();
        counts[order] += count;
        sizes[order] += count << order;
    }

    /// Sampled; only trustworthy after the slot has been taken offline.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("space", &self.space)
            .field("order", &self.quantum_order())
            .field("registry", &self.registry)
            .finish()
    }
}
