//! Size-order dispatch table.
//!
//! One atomic entry per size order names the component that serves the next
//! allocation of that order: a quantum allocator, one of its partitions
//! directly (the fast path published by `add_to_order`), or the slab
//! allocator. Entries are packed into 64 bits so a roster access is one
//! atomic load or store; racing stores are all valid serves, so no
//! compare-exchange is needed.

use bitfield_struct::bitfield;
use crossbeam_utils::atomic::AtomicCell;

/// Number of dispatch entries, one per size order plus order 64.
pub const MAX_ROSTER: usize = 65;

const _: () = assert!(AtomicCell::<RosterEntry>::is_lock_free());

/// Packed dispatch entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct RosterEntry {
    #[bits(2)]
    kind: u8,
    #[bits(6)]
    allocator: usize,
    #[bits(56)]
    slot: usize,
}

/// Decoded dispatch target of a roster entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// A quantum allocator by index.
    Quantum(usize),
    /// A specific online partition of a quantum allocator.
    Partition(usize, usize),
    /// The slab allocator.
    Slab,
}

impl RosterEntry {
    const NONE: u8 = 0;
    const QUANTUM: u8 = 1;
    const PARTITION: u8 = 2;
    const SLAB: u8 = 3;

    /// Unserved order; every allocation fails.
    pub fn none() -> Self {
        Self::new()
    }
    pub fn quantum(allocator: usize) -> Self {
        Self::new().with_kind(Self::QUANTUM).with_allocator(allocator)
    }
    pub fn partition(allocator: usize, slot: usize) -> Self {
        Self::new()
            .with_kind(Self::PARTITION)
            .with_allocator(allocator)
            .with_slot(slot)
    }
    pub fn slab() -> Self {
        Self::new().with_kind(Self::SLAB)
    }

    pub fn target(self) -> Option<Target> {
        match self.kind() {
            Self::QUANTUM => Some(Target::Quantum(self.allocator())),
            Self::PARTITION => Some(Target::Partition(self.allocator(), self.slot())),
            Self::SLAB => Some(Target::Slab),
            _ => None,
        }
    }
}

/// The order-indexed dispatch table.
pub struct Roster {
    entries: [AtomicCell<RosterEntry>; MAX_ROSTER],
}

impl Roster {
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| AtomicCell::new(RosterEntry::none())),
        }
    }

    pub fn get(&self, order: usize) -> RosterEntry {
        self.entries[order].load()
    }

    pub fn set(&self, order: usize, entry: RosterEntry) {
        self.entries[order].store(entry);
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}
