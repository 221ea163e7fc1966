//! Quantum-based native memory allocator.
//!
//! A single [`NativeAllocator`] serves allocation requests from 8 bytes up to
//! terabytes out of one reserved virtual address region, backed only by the
//! OS reservation/commit primitives. Occupancy is tracked with atomic bitmap
//! registries; there are no locks, monitors or free-lists on any path.
//!
//! Requests are routed by size order through a [`roster`](roster::Roster):
//! small and medium orders go to one of three [quantum
//! allocators](quantum::QuantumAllocator), which carve fixed-size partitions
//! into power-of-two quanta; everything above 64 MiB is served by the
//! [slab allocator](slab::SlabAllocator) as a one-off self-aligned
//! reservation.

pub mod alloc;
pub mod mmap;
pub mod partition;
pub mod quantum;
pub mod registry;
pub mod roster;
pub mod slab;
pub mod thread;
pub mod util;

pub use crate::alloc::NativeAllocator;

/// Smallest served size order (8 bytes).
pub const SMALLEST_SIZE_ORDER: usize = 3;
/// Number of quantum allocators owned by the top-level allocator.
pub const MAX_QUANTUM_ALLOCATORS: usize = 3;
/// Number of size orders a single quantum allocator handles.
pub const MAX_QUANTUM_ALLOCATOR_ORDERS: usize = 8;
/// Largest quantum-served size order (64 MiB).
pub const LARGEST_SIZE_ORDER: usize =
    SMALLEST_SIZE_ORDER + MAX_QUANTUM_ALLOCATORS * MAX_QUANTUM_ALLOCATOR_ORDERS - 1;
/// Largest quantum-served size in bytes.
pub const LARGEST_SIZE: usize = 1 << LARGEST_SIZE_ORDER;
/// Log2 of the maximum number of quanta per partition.
pub const MAX_PARTITION_QUANTUM_ORDER: usize = 14;
/// Maximum number of quanta per partition.
pub const MAX_PARTITION_QUANTUM: usize = 1 << MAX_PARTITION_QUANTUM_ORDER;
/// Addresses are confined to this order of virtual address space.
pub const MAX_ADDRESS_ORDER: usize = 48;
/// Largest order a single allocation may have.
pub const MAX_ALLOCATION_ORDER: usize = 44;
/// Number of retries if an atomic operation fails.
pub const CAS_RETRIES: usize = 16;

const _: () = assert!(LARGEST_SIZE_ORDER == 26);

/// Error codes of the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Not enough memory, either from the OS or within the reservation.
    Memory,
    /// Address not owned by this allocator.
    Address,
    /// Invalid construction parameters.
    Initialization,
}

pub type Result<T> = core::result::Result<T, Error>;
