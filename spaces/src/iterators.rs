//! Lazy, forward-only walks over pages, chunks and objects.
//!
//! Every iterator holds the lock of the space it walks, so the structure it
//! sees cannot change underneath it. Object walks skip fillers and jump
//! over the uninitialized slack of the space's bump window.

use parking_lot::{MutexGuard, RwLockReadGuard};

use crate::{
    Address,
    chunk::{Chunk, MemoryAllocator, PageId},
    heap::Heap,
    large_object_space::{LargeChunk, LargeObjectSpace, LargeObjectTable},
    new_space::{NewSpace, NewSpaceInner},
    object::HeapObject,
    paged_space::{PagedSpace, PagedSpaceInner},
};

// ── Pages ─────────────────────────────────────────────────────────────

pub struct PageIterator<'a> {
    guard: MutexGuard<'a, PagedSpaceInner>,
    index: usize,
}

impl<'a> PageIterator<'a> {
    pub fn new(space: &'a PagedSpace) -> Self {
        Self {
            guard: space.lock(),
            index: 0,
        }
    }
}

impl Iterator for PageIterator<'_> {
    type Item = PageId;

    fn next(&mut self) -> Option<PageId> {
        let page = self.guard.pages().get(self.index).copied()?;
        self.index += 1;
        Some(page)
    }
}

// ── Objects ───────────────────────────────────────────────────────────

/// Cursor over one page area that honours the window `[top, limit)`.
#[derive(Debug, Clone, Copy)]
struct AreaCursor {
    current: Address,
    end: Address,
}

impl AreaCursor {
    const DONE: AreaCursor = AreaCursor { current: 0, end: 0 };

    fn next_object(&mut self, top: Address, limit: Address) -> Option<HeapObject> {
        while self.current < self.end {
            if self.current == top && top != limit {
                self.current = limit;
                continue;
            }
            let object = HeapObject::from_address(self.current);
            let size = object.size();
            debug_assert!(size > 0, "object without size at {:#x}", self.current);
            if size == 0 {
                self.current = self.end;
                break;
            }
            self.current += size;
            debug_assert!(self.current <= self.end, "object crosses its page");
            if !object.is_filler() {
                return Some(object);
            }
        }
        None
    }
}

/// Live objects of a paged space, page by page.
pub struct HeapObjectIterator<'a> {
    guard: MutexGuard<'a, PagedSpaceInner>,
    allocator: &'a MemoryAllocator,
    page_index: usize,
    cursor: AreaCursor,
}

impl<'a> HeapObjectIterator<'a> {
    pub fn new(space: &'a PagedSpace) -> Self {
        Self {
            guard: space.lock(),
            allocator: space.allocator(),
            page_index: 0,
            cursor: AreaCursor::DONE,
        }
    }

    fn advance_page(&mut self) -> bool {
        let Some(&page) = self.guard.pages().get(self.page_index) else {
            return false;
        };
        self.page_index += 1;
        self.cursor = AreaCursor {
            current: self.allocator.area_start(page),
            end: self.allocator.area_end(page),
        };
        true
    }
}

impl Iterator for HeapObjectIterator<'_> {
    type Item = HeapObject;

    fn next(&mut self) -> Option<HeapObject> {
        let info = self.guard.allocation_info();
        loop {
            if let Some(object) = self.cursor.next_object(info.top(), info.limit()) {
                return Some(object);
            }
            if !self.advance_page() {
                return None;
            }
        }
    }
}

/// Live objects of the to-space up to the current window top.
pub struct SemiSpaceIterator<'a> {
    guard: MutexGuard<'a, NewSpaceInner>,
    allocator: &'a MemoryAllocator,
    page_index: usize,
    cursor: AreaCursor,
}

impl<'a> SemiSpaceIterator<'a> {
    pub fn new(space: &'a NewSpace) -> Self {
        Self {
            guard: space.lock(),
            allocator: space.allocator(),
            page_index: 0,
            cursor: AreaCursor::DONE,
        }
    }

    fn advance_page(&mut self) -> bool {
        if self.page_index > self.guard.current_page() {
            return false;
        }
        let page = self.guard.to_space().pages()[self.page_index];
        self.page_index += 1;
        self.cursor = AreaCursor {
            current: self.allocator.area_start(page),
            end: self.allocator.area_end(page),
        };
        true
    }
}

impl Iterator for SemiSpaceIterator<'_> {
    type Item = HeapObject;

    fn next(&mut self) -> Option<HeapObject> {
        let info = self.guard.allocation_info();
        loop {
            if let Some(object) = self.cursor.next_object(info.top(), info.limit()) {
                return Some(object);
            }
            if !self.advance_page() {
                return None;
            }
        }
    }
}

/// Chunks of the large-object space in address order.
pub struct LargeChunkIterator<'a> {
    guard: RwLockReadGuard<'a, LargeObjectTable>,
    last: Option<Address>,
    done: bool,
}

impl<'a> LargeChunkIterator<'a> {
    pub fn new(space: &'a LargeObjectSpace) -> Self {
        Self {
            guard: space.read(),
            last: None,
            done: false,
        }
    }
}

impl Iterator for LargeChunkIterator<'_> {
    type Item = LargeChunk;

    fn next(&mut self) -> Option<LargeChunk> {
        if self.done {
            return None;
        }
        let Some(chunk) = self.guard.next_after(self.last) else {
            self.done = true;
            return None;
        };
        self.last = Some(chunk.base());
        Some(chunk)
    }
}

pub struct LargeObjectIterator<'a> {
    chunks: LargeChunkIterator<'a>,
}

impl<'a> LargeObjectIterator<'a> {
    pub fn new(space: &'a LargeObjectSpace) -> Self {
        Self {
            chunks: LargeChunkIterator::new(space),
        }
    }
}

impl Iterator for LargeObjectIterator<'_> {
    type Item = HeapObject;

    fn next(&mut self) -> Option<HeapObject> {
        self.chunks.next().map(|chunk| chunk.object())
    }
}

// ── Whole heap ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkIteratorState {
    Old,
    Map,
    Code,
    Large,
    Finished,
}

impl ChunkIteratorState {
    #[inline]
    pub fn next(self) -> Self {
        match self {
            Self::Old => Self::Map,
            Self::Map => Self::Code,
            Self::Code => Self::Large,
            Self::Large | Self::Finished => Self::Finished,
        }
    }
}

enum ChunkSource<'a> {
    Pages(PageIterator<'a>),
    Large(LargeChunkIterator<'a>),
    None,
}

/// Old-generation pages, then metadata pages, code pages and large chunks.
pub struct ChunkIterator<'a> {
    heap: &'a Heap,
    state: ChunkIteratorState,
    source: ChunkSource<'a>,
}

impl<'a> ChunkIterator<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        let mut iter = Self {
            heap,
            state: ChunkIteratorState::Old,
            source: ChunkSource::None,
        };
        iter.source = iter.source_for(ChunkIteratorState::Old);
        iter
    }

    #[inline]
    pub fn state(&self) -> ChunkIteratorState {
        self.state
    }

    fn source_for(&self, state: ChunkIteratorState) -> ChunkSource<'a> {
        let heap = self.heap;
        match state {
            ChunkIteratorState::Old => ChunkSource::Pages(PageIterator::new(heap.old_space())),
            ChunkIteratorState::Map => ChunkSource::Pages(PageIterator::new(heap.map_space())),
            ChunkIteratorState::Code => ChunkSource::Pages(PageIterator::new(heap.code_space())),
            ChunkIteratorState::Large => {
                ChunkSource::Large(LargeChunkIterator::new(heap.lo_space()))
            }
            ChunkIteratorState::Finished => ChunkSource::None,
        }
    }
}

impl Iterator for ChunkIterator<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            let next = match &mut self.source {
                ChunkSource::Pages(pages) => pages.next().map(Chunk::Page),
                ChunkSource::Large(chunks) => chunks.next().map(Chunk::Large),
                ChunkSource::None => return None,
            };
            if next.is_some() {
                return next;
            }
            // release the exhausted space's lock before taking the next one
            self.source = ChunkSource::None;
            self.state = self.state.next();
            self.source = self.source_for(self.state);
        }
    }
}
