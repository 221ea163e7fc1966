//! Bitmap registry tracking occupancy of indexable resources.
//!
//! A registry packs `maximum` bits into 64-bit words plus a 32-bit `lowest`
//! hint, the index of a word at or below the lowest word containing a zero
//! bit. A set bit means the resource is allocated (or online). The registry
//! is either *confined* to one thread, using plain load/store claiming, or
//! *shared*, where claiming is a CAS that re-samples on failure and the hint
//! moves through single CAS attempts. Both variants are the same type; only
//! the claiming strategy differs.
//!
//! Under concurrency `find_free` may return slightly higher indices than a
//! linearizable version would; this is accepted. The hint is never optimistic
//! in a way that loses a free bit: frees lower it, allocations may raise it.

use core::fmt;
use core::sync::atomic::Ordering::{Relaxed, SeqCst};
use core::sync::atomic::{AtomicU32, AtomicUsize};

use crossbeam_utils::atomic::AtomicCell;

/// Bits per registry word.
pub const BITS_PER_WORD: usize = 64;

const _: () = assert!(AtomicCell::<u64>::is_lock_free());

pub struct Registry {
    shared: bool,
    /// Number of bits in use; never exceeds the word capacity.
    maximum: AtomicUsize,
    /// Word index at or below the lowest word with a zero bit.
    lowest: AtomicU32,
    words: Box<[AtomicCell<u64>]>,
}

impl Registry {
    pub fn new(maximum: usize, shared: bool) -> Self {
        Self::with_capacity(maximum, maximum, shared)
    }

    /// Create a registry with room for `capacity` bits of which `maximum`
    /// are initially in use. [`Registry::retarget`] may later change the
    /// bit maximum within the capacity.
    pub fn with_capacity(capacity: usize, maximum: usize, shared: bool) -> Self {
        debug_assert!(maximum <= capacity);
        let mut words = Vec::new();
        words.resize_with(capacity.div_ceil(BITS_PER_WORD), || AtomicCell::new(0));
        Self {
            shared,
            maximum: AtomicUsize::new(maximum),
            lowest: AtomicU32::new(0),
            words: words.into(),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn maximum(&self) -> usize {
        self.maximum.load(Relaxed)
    }

    fn word_count(&self) -> usize {
        self.maximum().div_ceil(BITS_PER_WORD)
    }

    /// Change the bit maximum and drop all occupancy.
    ///
    /// The caller must hold exclusive ownership of the registry, which for a
    /// partition registry means the partition has been taken offline.
    pub fn retarget(&self, maximum: usize) {
        debug_assert!(maximum <= self.words.len() * BITS_PER_WORD);
        for word in self.words.iter() {
            word.store(0);
        }
        self.maximum.store(maximum, SeqCst);
        self.lowest.store(0, SeqCst);
    }

    /// Find a zero bit, set it and return its index.
    ///
    /// Scans word-wise upward from the `lowest` hint, advancing the hint over
    /// full words. Zero bits beyond `maximum` in the tail word are phantom
    /// and never claimed.
    pub fn find_free(&self) -> Option<usize> {
        let maximum = self.maximum();
        let words = maximum.div_ceil(BITS_PER_WORD);
        let mut wi = self.lowest.load(SeqCst) as usize;
        while wi < words {
            let word = self.words[wi].load();
            if word == u64::MAX {
                wi = self.increment_lowest(wi);
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let index = wi * BITS_PER_WORD + bit;
            if index >= maximum {
                return None;
            }
            if self.shared {
                if self.words[wi].compare_exchange(word, word | 1 << bit).is_err() {
                    // Lost the word, re-sample it
                    continue;
                }
            } else {
                self.words[wi].store(word | 1 << bit);
            }
            return Some(index);
        }
        None
    }

    /// Advance the hint past the full word `wi`. Under sharing this is a
    /// single CAS attempt; losers take whichever value won.
    fn increment_lowest(&self, wi: usize) -> usize {
        if self.shared {
            match self
                .lowest
                .compare_exchange(wi as u32, wi as u32 + 1, SeqCst, SeqCst)
            {
                Ok(_) => wi + 1,
                Err(current) => current as usize,
            }
        } else {
            self.lowest.store(wi as u32 + 1, Relaxed);
            wi + 1
        }
    }

    /// Clear the bit at `index` and lower the hint to its word.
    pub fn free(&self, index: usize) {
        debug_assert!(index < self.maximum());
        let wi = index / BITS_PER_WORD;
        let bit = 1u64 << (index % BITS_PER_WORD);
        if self.shared {
            let old = self.words[wi].fetch_and(!bit);
            debug_assert!(old & bit != 0, "freeing a free bit {index}");
        } else {
            let word = self.words[wi].load();
            debug_assert!(word & bit != 0, "freeing a free bit {index}");
            self.words[wi].store(word & !bit);
        }
        self.lower_lowest(wi);
    }

    fn lower_lowest(&self, wi: usize) {
        if self.shared {
            let mut current = self.lowest.load(SeqCst);
            while current as usize > wi {
                match self
                    .lowest
                    .compare_exchange(current, wi as u32, SeqCst, SeqCst)
                {
                    Ok(_) => return,
                    Err(changed) => current = changed,
                }
            }
        } else if self.lowest.load(Relaxed) as usize > wi {
            self.lowest.store(wi as u32, Relaxed);
        }
    }

    /// Peek at a bit. Not linearizable with concurrent mutators; only
    /// meaningful when the caller owns the bit.
    pub fn is_set(&self, index: usize) -> bool {
        debug_assert!(index < self.maximum());
        self.words[index / BITS_PER_WORD].load() & 1 << (index % BITS_PER_WORD) != 0
    }

    /// Unconditionally set a bit, returning whether it changed.
    pub fn set(&self, index: usize) -> bool {
        debug_assert!(index < self.maximum());
        let bit = 1u64 << (index % BITS_PER_WORD);
        self.words[index / BITS_PER_WORD].fetch_or(bit) & bit == 0
    }

    /// Unconditionally clear a bit, returning whether it changed.
    /// Unlike [`Registry::free`] the hint is left untouched.
    pub fn clear(&self, index: usize) -> bool {
        debug_assert!(index < self.maximum());
        let bit = 1u64 << (index % BITS_PER_WORD);
        self.words[index / BITS_PER_WORD].fetch_and(!bit) & bit != 0
    }

    /// Sampled "probably empty" check. Callers that act on it must remove
    /// the registry from service and re-check afterwards.
    pub fn is_empty(&self) -> bool {
        self.words[..self.word_count()].iter().all(|w| w.load() == 0)
    }

    /// Sampled population count.
    pub fn count(&self) -> usize {
        self.words[..self.word_count()]
            .iter()
            .map(|w| w.load().count_ones() as usize)
            .sum()
    }

    /// Iterate over the indices of set bits, ascending, starting at index 0.
    pub fn iter_set(&self) -> SetIter<'_> {
        self.iter_set_from(0)
    }

    /// Iterate over the indices of set bits at or above `start`, ascending.
    ///
    /// The sequence is finite and not restartable; concurrent mutations may
    /// or may not be observed.
    pub fn iter_set_from(&self, start: usize) -> SetIter<'_> {
        let wi = start / BITS_PER_WORD;
        let word = if wi < self.word_count() {
            self.words[wi].load() & u64::MAX << (start % BITS_PER_WORD)
        } else {
            0
        };
        SetIter {
            registry: self,
            wi,
            word,
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registry {{ {}/{} lowest={}",
            self.count(),
            self.maximum(),
            self.lowest.load(Relaxed)
        )?;
        if f.alternate() {
            write!(f, " (")?;
            for w in self.words[..self.word_count()].iter() {
                write!(f, "{:016x} ", w.load())?;
            }
            write!(f, ")")?;
        }
        write!(f, " }}")
    }
}

/// Iterator over set bits, masking off already visited bits of the current
/// word.
pub struct SetIter<'a> {
    registry: &'a Registry,
    wi: usize,
    word: u64,
}

impl Iterator for SetIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let maximum = self.registry.maximum();
        let words = maximum.div_ceil(BITS_PER_WORD);
        loop {
            if self.word != 0 {
                let bit = self.word.trailing_zeros() as usize;
                self.word &= self.word - 1;
                let index = self.wi * BITS_PER_WORD + bit;
                if index >= maximum {
                    return None;
                }
                return Some(index);
            }
            self.wi += 1;
            if self.wi >= words {
                return None;
            }
            self.word = self.registry.words[self.wi].load();
        }
    }
}
