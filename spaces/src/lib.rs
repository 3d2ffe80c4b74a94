mod allocation;
mod chunk;
mod free_list;
mod heap;
mod iterators;
mod lab;
mod large_object_space;
mod marking;
mod new_space;
mod object;
mod paged_space;
mod settings;
mod system;

pub use allocation::{Address, AllocationInfo, AllocationResult, AllocationSpace};
pub use chunk::{Chunk, MemoryAllocator, PAGE_HEADER_SIZE, PageFlags, PageId, chunk_from_any_address};
pub use free_list::{FreeList, FreeListCategory, PageCategories};
pub use heap::{Heap, HeapStats, LargeObjectStats, SpaceStats};
pub use iterators::{
    ChunkIterator, ChunkIteratorState, HeapObjectIterator, LargeChunkIterator,
    LargeObjectIterator, PageIterator, SemiSpaceIterator,
};
pub use lab::LocalAllocationBuffer;
pub use large_object_space::{LARGE_OBJECT_HEADER_SIZE, LargeChunk, LargeObjectSpace};
pub use marking::MarkingState;
pub use new_space::{GrowToMaximum, GrowthPolicy, NeverGrow, NewSpace, SemiSpace};
pub use object::{
    HeapObject, MIN_FREE_BLOCK_SIZE, ObjectKind, WORD_SIZE, create_filler,
    fill_to_align, max_fill_to_align, object_size_for, precede_with_filler,
};
pub use paged_space::{DetachedPage, PagedSpace};
pub use settings::{ConfigError, FreeListSettings, HeapError, HeapSettings};
pub use system::{OS_PAGE_SIZE, map_memory, unmap_memory};
