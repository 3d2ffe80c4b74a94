use std::{fmt, sync::Arc};

use log::debug;

use crate::{
    Address, AllocationResult, AllocationSpace,
    chunk::{Chunk, MemoryAllocator, chunk_from_any_address},
    iterators::ChunkIterator,
    lab::LocalAllocationBuffer,
    large_object_space::{LARGE_OBJECT_HEADER_SIZE, LargeObjectSpace},
    marking::MarkingState,
    new_space::{GrowToMaximum, GrowthPolicy, NewSpace},
    object::{HeapObject, WORD_SIZE, object_size_for},
    paged_space::PagedSpace,
    settings::{HeapError, HeapSettings},
};

// ── Stats ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceStats {
    pub pages: usize,
    pub capacity: usize,
    pub size: usize,
    pub available: usize,
    pub waste: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LargeObjectStats {
    pub objects: usize,
    pub size: usize,
    pub committed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub new_space: SpaceStats,
    pub old_space: SpaceStats,
    pub map_space: SpaceStats,
    pub code_space: SpaceStats,
    pub lo_space: LargeObjectStats,
    pub committed: usize,
    pub capacity: usize,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<6} {:>6} {:>12} {:>12} {:>12} {:>10}",
            "space", "pages", "capacity", "size", "available", "waste"
        )?;
        for (name, stats) in [
            ("new", &self.new_space),
            ("old", &self.old_space),
            ("map", &self.map_space),
            ("code", &self.code_space),
        ] {
            writeln!(
                f,
                "{:<6} {:>6} {:>12} {:>12} {:>12} {:>10}",
                name, stats.pages, stats.capacity, stats.size, stats.available, stats.waste
            )?;
        }
        writeln!(
            f,
            "large  {} objects, {} bytes ({} committed)",
            self.lo_space.objects, self.lo_space.size, self.lo_space.committed
        )?;
        write!(f, "arena  {} / {} bytes committed", self.committed, self.capacity)
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

/// All spaces sharing one page arena and one marking state.
#[derive(Debug)]
pub struct Heap {
    settings: HeapSettings,
    allocator: Arc<MemoryAllocator>,
    marking: Arc<MarkingState>,
    new_space: NewSpace,
    old_space: PagedSpace,
    map_space: PagedSpace,
    code_space: PagedSpace,
    lo_space: LargeObjectSpace,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Result<Self, HeapError> {
        Self::with_growth_policy(settings, Box::new(GrowToMaximum))
    }

    pub fn with_growth_policy(
        settings: HeapSettings,
        policy: Box<dyn GrowthPolicy>,
    ) -> Result<Self, HeapError> {
        settings.validate()?;

        let allocator = MemoryAllocator::new(settings.page_size, settings.capacity).ok_or(
            HeapError::ReservationFailed {
                bytes: settings.capacity + settings.page_size,
            },
        )?;
        let allocator = Arc::new(allocator);
        let marking = Arc::new(MarkingState::new());

        let new_space = NewSpace::new(
            allocator.clone(),
            marking.clone(),
            settings.semi_space_initial_pages,
            settings.semi_space_max_pages,
            policy,
        )
        .ok_or(HeapError::InitialPages {
            pages: 2 * settings.semi_space_initial_pages,
        })?;

        let paged = |identity| {
            PagedSpace::new(identity, allocator.clone(), marking.clone(), &settings.free_list)
        };
        let old_space = paged(AllocationSpace::Old);
        let map_space = paged(AllocationSpace::Map);
        let code_space = paged(AllocationSpace::Code);
        let lo_space = LargeObjectSpace::new(allocator.clone(), marking.clone());

        debug!(
            "heap created: {} pages of {} bytes",
            allocator.page_count(),
            settings.page_size
        );
        Ok(Self {
            settings,
            allocator,
            marking,
            new_space,
            old_space,
            map_space,
            code_space,
            lo_space,
        })
    }

    #[inline]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline]
    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    #[inline]
    pub fn marking(&self) -> &MarkingState {
        &self.marking
    }

    #[inline]
    pub fn new_space(&self) -> &NewSpace {
        &self.new_space
    }

    #[inline]
    pub fn new_space_mut(&mut self) -> &mut NewSpace {
        &mut self.new_space
    }

    #[inline]
    pub fn old_space(&self) -> &PagedSpace {
        &self.old_space
    }

    #[inline]
    pub fn old_space_mut(&mut self) -> &mut PagedSpace {
        &mut self.old_space
    }

    #[inline]
    pub fn map_space(&self) -> &PagedSpace {
        &self.map_space
    }

    #[inline]
    pub fn code_space(&self) -> &PagedSpace {
        &self.code_space
    }

    #[inline]
    pub fn lo_space(&self) -> &LargeObjectSpace {
        &self.lo_space
    }

    /// The paged space for `space`, if it is one.
    pub fn paged_space(&self, space: AllocationSpace) -> Option<&PagedSpace> {
        match space {
            AllocationSpace::Old => Some(&self.old_space),
            AllocationSpace::Map => Some(&self.map_space),
            AllocationSpace::Code => Some(&self.code_space),
            AllocationSpace::New | AllocationSpace::Large => None,
        }
    }

    #[inline]
    fn is_large(&self, size: usize, space: AllocationSpace) -> bool {
        space == AllocationSpace::Large || size > self.settings.max_regular_object_size()
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Unsynchronized allocation in `space`. Objects above the regular size
    /// limit go to the large-object space whatever `space` says.
    pub fn allocate_raw(
        &mut self,
        size: usize,
        space: AllocationSpace,
        align: usize,
    ) -> AllocationResult {
        let size = object_size_for(size);
        if self.is_large(size, space) {
            debug_assert!(align <= LARGE_OBJECT_HEADER_SIZE);
            return self.lo_space.allocate_raw(size);
        }
        match space {
            AllocationSpace::New => self.new_space.allocate_raw(size, align),
            AllocationSpace::Old => self.old_space.allocate_raw(size, align),
            AllocationSpace::Map => self.map_space.allocate_raw(size, align),
            AllocationSpace::Code => self.code_space.allocate_raw(size, align),
            AllocationSpace::Large => unreachable!("routed above"),
        }
    }

    /// Allocation safe to call from several threads at once.
    pub fn allocate_raw_synchronized(
        &self,
        size: usize,
        space: AllocationSpace,
        align: usize,
    ) -> AllocationResult {
        let size = object_size_for(size);
        if self.is_large(size, space) {
            debug_assert!(align <= LARGE_OBJECT_HEADER_SIZE);
            return self.lo_space.allocate_raw(size);
        }
        match space {
            AllocationSpace::New => self.new_space.allocate_raw_synchronized(size, align),
            AllocationSpace::Old => self.old_space.allocate_raw_synchronized(size, align),
            AllocationSpace::Map => self.map_space.allocate_raw_synchronized(size, align),
            AllocationSpace::Code => self.code_space.allocate_raw_synchronized(size, align),
            AllocationSpace::Large => unreachable!("routed above"),
        }
    }

    /// Allocates and writes a regular object header of the rounded size.
    pub fn allocate_object(
        &self,
        size: usize,
        space: AllocationSpace,
        align: usize,
    ) -> AllocationResult {
        let size = object_size_for(size.max(WORD_SIZE));
        let result = self.allocate_raw_synchronized(size, space, align);
        if let AllocationResult::Success(addr) = result {
            // SAFETY: freshly allocated range of `size` bytes
            unsafe { HeapObject::initialize(addr, size) };
        }
        result
    }

    /// Carves a buffer of `lab_size` bytes out of `space`, bypassing the
    /// large-object routing. The buffer is invalid if the space is exhausted
    /// or cannot host buffers.
    pub fn new_lab(&self, space: AllocationSpace) -> LocalAllocationBuffer {
        let size = self.settings.lab_size;
        let result = match space {
            AllocationSpace::New => self.new_space.allocate_raw_synchronized(size, WORD_SIZE),
            _ => match self.paged_space(space) {
                Some(paged) => paged.allocate_raw_synchronized(size, WORD_SIZE),
                None => AllocationResult::Retry(space),
            },
        };
        LocalAllocationBuffer::from_result(result, size)
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn chunk_from_any_address(&self, addr: Address) -> Option<Chunk> {
        chunk_from_any_address(&self.allocator, &self.lo_space, addr)
    }

    pub fn chunks(&self) -> ChunkIterator<'_> {
        ChunkIterator::new(self)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.new_space.contains(addr)
            || self.old_space.contains(addr)
            || self.map_space.contains(addr)
            || self.code_space.contains(addr)
            || self.lo_space.contains(addr)
    }

    /// The space owning `addr`, if any.
    pub fn space_of(&self, addr: Address) -> Option<AllocationSpace> {
        match self.chunk_from_any_address(addr)? {
            Chunk::Page(page) => self.allocator.owner(page),
            Chunk::Large(_) => Some(AllocationSpace::Large),
        }
    }

    pub fn stats(&self) -> HeapStats {
        let paged = |space: &PagedSpace| SpaceStats {
            pages: space.page_count(),
            capacity: space.capacity(),
            size: space.size(),
            available: space.available(),
            waste: space.waste(),
        };
        let new_space = SpaceStats {
            pages: self.new_space.page_count(),
            capacity: self.new_space.capacity(),
            size: self.new_space.allocated_since_flip(),
            available: self.new_space.available(),
            waste: 0,
        };
        HeapStats {
            new_space,
            old_space: paged(&self.old_space),
            map_space: paged(&self.map_space),
            code_space: paged(&self.code_space),
            lo_space: LargeObjectStats {
                objects: self.lo_space.object_count(),
                size: self.lo_space.size(),
                committed: self.lo_space.committed(),
            },
            committed: self.allocator.committed(),
            capacity: self.allocator.capacity(),
        }
    }
}
