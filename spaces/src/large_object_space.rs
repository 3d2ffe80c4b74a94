//! One dedicated chunk per object, mapped outside the page arena.
//!
//! Chunks are charged against the arena's byte budget so the whole heap
//! shares one limit. The address table is read by `chunk_from_any_address`
//! on other threads while new chunks are registered.

use std::{
    collections::BTreeMap,
    ops::Bound,
    ptr::{self, NonNull},
    sync::Arc,
};

use log::debug;
use parking_lot::{RwLock, RwLockReadGuard};

use crate::{
    Address, AllocationResult, AllocationSpace, OS_PAGE_SIZE,
    chunk::{MemoryAllocator, PAGE_HEADER_SIZE},
    marking::MarkingState,
    object::{HeapObject, WORD_SIZE},
    system,
};

/// Bytes in front of every large object; keeps objects aligned like page areas.
pub const LARGE_OBJECT_HEADER_SIZE: usize = PAGE_HEADER_SIZE;

/// Written at the base of every large chunk. The object starts
/// `LARGE_OBJECT_HEADER_SIZE` bytes after the base.
#[repr(C)]
struct LargeChunkHeader {
    chunk_size: usize,
    object_size: usize,
}

/// Snapshot of a large-object chunk as recorded in the address table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeChunk {
    base: Address,
    size: usize,
    object_size: usize,
    black: bool,
}

impl LargeChunk {
    #[inline]
    pub fn base(&self) -> Address {
        self.base
    }

    /// Mapped bytes, header included.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn object(&self) -> HeapObject {
        HeapObject::from_address(self.base + LARGE_OBJECT_HEADER_SIZE)
    }

    #[inline]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Allocated while black allocation was active.
    #[inline]
    pub fn is_black(&self) -> bool {
        self.black
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

/// Largest object a chunk of `chunk_bytes` can hold.
#[inline]
pub fn object_size_for(chunk_bytes: usize) -> usize {
    chunk_bytes.saturating_sub(LARGE_OBJECT_HEADER_SIZE) & !(WORD_SIZE - 1)
}

#[derive(Debug, Default)]
pub struct LargeObjectTable {
    chunks: BTreeMap<Address, LargeChunk>,
    size: usize,
}

impl LargeObjectTable {
    /// The chunk whose base is the smallest one above `after`.
    pub fn next_after(&self, after: Option<Address>) -> Option<LargeChunk> {
        let lower = match after {
            Some(base) => Bound::Excluded(base),
            None => Bound::Unbounded,
        };
        self.chunks
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(_, chunk)| *chunk)
    }

    fn find(&self, addr: Address) -> Option<LargeChunk> {
        self.chunks
            .range(..=addr)
            .next_back()
            .map(|(_, chunk)| *chunk)
            .filter(|chunk| chunk.contains(addr))
    }
}

#[derive(Debug)]
pub struct LargeObjectSpace {
    allocator: Arc<MemoryAllocator>,
    marking: Arc<MarkingState>,
    table: RwLock<LargeObjectTable>,
}

impl LargeObjectSpace {
    pub fn new(allocator: Arc<MemoryAllocator>, marking: Arc<MarkingState>) -> Self {
        Self {
            allocator,
            marking,
            table: RwLock::new(LargeObjectTable::default()),
        }
    }

    /// Maps a chunk for one object of `size` bytes.
    pub fn allocate_raw(&self, size: usize) -> AllocationResult {
        debug_assert!(size > 0 && size.is_multiple_of(WORD_SIZE));
        let chunk_size = (LARGE_OBJECT_HEADER_SIZE + size).next_multiple_of(OS_PAGE_SIZE);

        if !self.allocator.charge(chunk_size) {
            debug!("large object space exhausted for {size} bytes");
            return AllocationResult::Retry(AllocationSpace::Large);
        }
        let Some(raw) = system::map_memory(chunk_size) else {
            self.allocator.uncharge(chunk_size);
            debug!("mapping a {chunk_size} byte large chunk failed");
            return AllocationResult::Retry(AllocationSpace::Large);
        };

        let base = raw.as_ptr() as Address;
        // SAFETY: fresh mapping of at least LARGE_OBJECT_HEADER_SIZE bytes
        unsafe {
            ptr::write(
                base as *mut LargeChunkHeader,
                LargeChunkHeader {
                    chunk_size,
                    object_size: size,
                },
            );
        }
        let chunk = LargeChunk {
            base,
            size: chunk_size,
            object_size: size,
            black: self.marking.black_allocation(),
        };

        let mut table = self.table.write();
        table.chunks.insert(base, chunk);
        table.size += size;
        drop(table);

        debug!("mapped large chunk {base:#x} ({chunk_size} bytes)");
        AllocationResult::Success(chunk.object().address())
    }

    /// Collector path: unmaps the chunk of `object`.
    pub fn free(&self, object: Address) -> bool {
        let Some(base) = object.checked_sub(LARGE_OBJECT_HEADER_SIZE) else {
            return false;
        };
        let mut table = self.table.write();
        let Some(chunk) = table.chunks.remove(&base) else {
            return false;
        };
        table.size -= chunk.object_size;
        drop(table);

        Self::unmap(chunk);
        self.allocator.uncharge(chunk.size);
        debug!("released large chunk {base:#x}");
        true
    }

    fn unmap(chunk: LargeChunk) {
        // SAFETY: the header was written when the chunk was mapped
        let header = unsafe { &*(chunk.base as *const LargeChunkHeader) };
        let mapped = header.chunk_size;
        debug_assert_eq!(mapped, chunk.size);
        debug_assert_eq!(header.object_size, chunk.object_size);
        if let Some(ptr) = NonNull::new(chunk.base as *mut u8) {
            system::unmap_memory(ptr, mapped);
        }
    }

    /// Safe to call from any thread while other threads allocate.
    pub fn find_chunk_thread_safe(&self, addr: Address) -> Option<LargeChunk> {
        self.table.read().find(addr)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.find_chunk_thread_safe(addr).is_some()
    }

    /// Whether `object` was allocated while black allocation was active.
    pub fn is_black(&self, object: Address) -> bool {
        self.find_chunk_thread_safe(object)
            .is_some_and(|chunk| chunk.is_black())
    }

    /// Object bytes, chunk headers excluded.
    pub fn size(&self) -> usize {
        self.table.read().size
    }

    /// Mapped bytes, headers and page rounding included.
    pub fn committed(&self) -> usize {
        self.table.read().chunks.values().map(LargeChunk::size).sum()
    }

    pub fn object_count(&self) -> usize {
        self.table.read().chunks.len()
    }

    /// Size of the largest object that could still be allocated.
    pub fn available(&self) -> usize {
        object_size_for(self.allocator.available())
    }

    pub fn read(&self) -> RwLockReadGuard<'_, LargeObjectTable> {
        self.table.read()
    }
}

impl Drop for LargeObjectSpace {
    fn drop(&mut self) {
        let table = std::mem::take(self.table.get_mut());
        for chunk in table.chunks.into_values() {
            Self::unmap(chunk);
            self.allocator.uncharge(chunk.size);
        }
    }
}
