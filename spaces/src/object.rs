//! The slice of the object model the allocator needs: every object starts
//! with one header word that encodes its size and whether it is padding.
//!
//! ```text
//! bits 0..8:  kind   (Regular | Filler | FreeSpace)
//! bits 8..64: size in bytes (always a multiple of WORD_SIZE)
//! ```
//!
//! Free-space records carry a second word: the address of the next block in
//! their free-list category (0 terminates the chain).

use std::ptr;

use crate::Address;

pub const WORD_SIZE: usize = 8;
pub const WORD_SIZE_LOG2: usize = 3;
/// Smallest block that can be threaded onto a free list (header + next).
pub const MIN_FREE_BLOCK_SIZE: usize = 2 * WORD_SIZE;

const KIND_MASK: u64 = 0xff;
const SIZE_SHIFT: u32 = 8;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Regular = 0,
    /// Padding inserted for alignment or to seal unused window slack.
    Filler = 1,
    /// A reclaimed block, linked into a free-list category.
    FreeSpace = 2,
}

impl From<u8> for ObjectKind {
    fn from(val: u8) -> Self {
        match val {
            1 => ObjectKind::Filler,
            2 => ObjectKind::FreeSpace,
            _ => ObjectKind::Regular,
        }
    }
}

#[inline(always)]
pub const fn encode_header(kind: ObjectKind, size: usize) -> u64 {
    ((size as u64) << SIZE_SHIFT) | kind as u64
}

/// Rounds `size` up to the next multiple of the word size.
#[inline(always)]
pub const fn object_size_for(size: usize) -> usize {
    (size + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

/// Bytes of padding needed so that `addr` becomes a multiple of `align`.
#[inline(always)]
pub const fn fill_to_align(addr: Address, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr.wrapping_neg() & (align - 1)
}

/// Worst-case padding for `align` when the start address is only word aligned.
#[inline(always)]
pub const fn max_fill_to_align(align: usize) -> usize {
    if align > WORD_SIZE {
        align - WORD_SIZE
    } else {
        0
    }
}

/// A view onto an object that lives at a heap address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapObject(Address);

impl HeapObject {
    #[inline(always)]
    pub const fn from_address(addr: Address) -> Self {
        Self(addr)
    }

    #[inline(always)]
    pub const fn address(self) -> Address {
        self.0
    }

    #[inline(always)]
    fn header(self) -> u64 {
        // SAFETY: caller obtained `self` from a walkable heap position
        unsafe { ptr::read(self.0 as *const u64) }
    }

    #[inline(always)]
    pub fn size(self) -> usize {
        (self.header() >> SIZE_SHIFT) as usize
    }

    #[inline(always)]
    pub fn kind(self) -> ObjectKind {
        ObjectKind::from((self.header() & KIND_MASK) as u8)
    }

    /// Fillers and free-space records are both skipped by iteration.
    #[inline(always)]
    pub fn is_filler(self) -> bool {
        self.kind() != ObjectKind::Regular
    }

    /// Writes a regular object header at `addr`.
    ///
    /// # Safety
    /// `addr..addr + size` must be memory handed out by an allocation.
    pub unsafe fn initialize(addr: Address, size: usize) -> Self {
        debug_assert!(size >= WORD_SIZE && size.is_multiple_of(WORD_SIZE));
        // SAFETY: by contract
        unsafe { write_word(addr, encode_header(ObjectKind::Regular, size)) };
        Self(addr)
    }
}

/// # Safety
/// `addr` must be a word-aligned, writable heap address.
#[inline(always)]
pub(crate) unsafe fn write_word(addr: Address, word: u64) {
    // SAFETY: by contract
    unsafe { ptr::write(addr as *mut u64, word) }
}

/// # Safety
/// `addr` must be a word-aligned, readable heap address.
#[inline(always)]
pub(crate) unsafe fn read_word(addr: Address) -> u64 {
    // SAFETY: by contract
    unsafe { ptr::read(addr as *const u64) }
}

/// Makes `[addr, addr + size)` walkable: nothing for 0, a one-word filler
/// for a single word, a free-space record (with a null link) otherwise.
///
/// # Safety
/// The range must be owned, writable heap memory.
pub unsafe fn create_filler(addr: Address, size: usize) {
    debug_assert!(size.is_multiple_of(WORD_SIZE));
    match size {
        0 => {}
        WORD_SIZE => {
            // SAFETY: by contract
            unsafe { write_word(addr, encode_header(ObjectKind::Filler, size)) }
        }
        _ => {
            // SAFETY: by contract, size >= 2 words
            unsafe {
                write_word(addr, encode_header(ObjectKind::FreeSpace, size));
                write_word(addr + WORD_SIZE, 0);
            }
        }
    }
}

/// Writes `filler` bytes of padding at `addr` and returns the object start.
///
/// # Safety
/// `[addr, addr + filler)` must be owned, writable heap memory.
#[inline]
pub unsafe fn precede_with_filler(addr: Address, filler: usize) -> Address {
    // SAFETY: by contract
    unsafe { create_filler(addr, filler) };
    addr + filler
}

/// Link stored in the second word of a free-space record.
///
/// # Safety
/// `block` must be a free-space record.
#[inline(always)]
pub(crate) unsafe fn free_space_next(block: Address) -> Address {
    // SAFETY: by contract
    unsafe { read_word(block + WORD_SIZE) as Address }
}

/// # Safety
/// `block` must be a free-space record.
#[inline(always)]
pub(crate) unsafe fn set_free_space_next(block: Address, next: Address) {
    // SAFETY: by contract
    unsafe { write_word(block + WORD_SIZE, next as u64) }
}
