//! The young generation: a pair of semispaces allocated by bump pointer only.

use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    Address, AllocationInfo, AllocationResult, AllocationSpace,
    chunk::{MemoryAllocator, PageFlags, PageId},
    marking::MarkingState,
    object::{WORD_SIZE, create_filler, fill_to_align, max_fill_to_align, precede_with_filler},
};

/// Decides whether an exhausted to-space may take more pages before the
/// caller has to collect.
pub trait GrowthPolicy: Send + Sync {
    fn may_grow(&self, capacity: usize, maximum: usize) -> bool;
}

/// Grows until the configured maximum.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrowToMaximum;

impl GrowthPolicy for GrowToMaximum {
    fn may_grow(&self, capacity: usize, maximum: usize) -> bool {
        capacity < maximum
    }
}

/// Never grows; every exhaustion becomes a retry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverGrow;

impl GrowthPolicy for NeverGrow {
    fn may_grow(&self, _capacity: usize, _maximum: usize) -> bool {
        false
    }
}

#[derive(Debug)]
pub struct SemiSpace {
    pages: Vec<PageId>,
    flag: PageFlags,
}

impl SemiSpace {
    #[inline]
    pub fn pages(&self) -> &[PageId] {
        &self.pages
    }

    fn set_flags(&self, allocator: &MemoryAllocator) {
        let other = if self.flag == PageFlags::InToSpace {
            PageFlags::InFromSpace
        } else {
            PageFlags::InToSpace
        };
        for &page in &self.pages {
            allocator.clear_flag(page, other);
            allocator.set_flag(page, self.flag);
        }
    }
}

#[derive(Debug)]
pub struct NewSpaceInner {
    to_space: SemiSpace,
    from_space: SemiSpace,
    /// Index into `to_space.pages` of the page holding the window.
    current: usize,
    info: AllocationInfo,
    allocated_since_flip: usize,
}

impl NewSpaceInner {
    #[inline]
    pub fn to_space(&self) -> &SemiSpace {
        &self.to_space
    }

    #[inline]
    pub fn from_space(&self) -> &SemiSpace {
        &self.from_space
    }

    /// Index of the to-space page holding the window.
    #[inline]
    pub fn current_page(&self) -> usize {
        self.current
    }

    #[inline]
    pub fn allocation_info(&self) -> AllocationInfo {
        self.info
    }
}

pub struct NewSpace {
    allocator: Arc<MemoryAllocator>,
    marking: Arc<MarkingState>,
    policy: Box<dyn GrowthPolicy>,
    maximum_pages: usize,
    inner: Mutex<NewSpaceInner>,
}

impl std::fmt::Debug for NewSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewSpace")
            .field("maximum_pages", &self.maximum_pages)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl NewSpace {
    /// Sets up both semispaces with `initial_pages` pages each. Returns
    /// `None` if the arena cannot supply them.
    pub fn new(
        allocator: Arc<MemoryAllocator>,
        marking: Arc<MarkingState>,
        initial_pages: usize,
        maximum_pages: usize,
        policy: Box<dyn GrowthPolicy>,
    ) -> Option<Self> {
        debug_assert!(initial_pages > 0 && initial_pages <= maximum_pages);
        let mut to_space = SemiSpace {
            pages: Vec::with_capacity(maximum_pages),
            flag: PageFlags::InToSpace,
        };
        let mut from_space = SemiSpace {
            pages: Vec::with_capacity(maximum_pages),
            flag: PageFlags::InFromSpace,
        };
        if !Self::acquire_pair(&allocator, &mut to_space, &mut from_space, initial_pages) {
            for &page in to_space.pages.iter().chain(&from_space.pages) {
                allocator.release_page(page);
            }
            return None;
        }

        let first = to_space.pages[0];
        let info = AllocationInfo::new(allocator.area_start(first), allocator.area_end(first));
        let inner = NewSpaceInner {
            to_space,
            from_space,
            current: 0,
            info,
            allocated_since_flip: 0,
        };
        Some(Self {
            allocator,
            marking,
            policy,
            maximum_pages,
            inner: Mutex::new(inner),
        })
    }

    fn acquire_pair(
        allocator: &MemoryAllocator,
        to_space: &mut SemiSpace,
        from_space: &mut SemiSpace,
        count: usize,
    ) -> bool {
        for _ in 0..count {
            let Some(to) = allocator.acquire_page(AllocationSpace::New) else {
                return false;
            };
            let Some(from) = allocator.acquire_page(AllocationSpace::New) else {
                allocator.release_page(to);
                return false;
            };
            allocator.set_flag(to, to_space.flag);
            allocator.set_flag(from, from_space.flag);
            to_space.pages.push(to);
            from_space.pages.push(from);
        }
        true
    }

    #[inline]
    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    pub fn lock(&self) -> MutexGuard<'_, NewSpaceInner> {
        self.inner.lock()
    }

    // ── Allocation ────────────────────────────────────────────────────

    #[inline]
    pub fn allocate_raw(&mut self, size: usize, align: usize) -> AllocationResult {
        let inner = self.inner.get_mut();
        Self::allocate_in(
            inner,
            &self.allocator,
            &self.marking,
            self.policy.as_ref(),
            self.maximum_pages,
            size,
            align,
        )
    }

    pub fn allocate_raw_synchronized(&self, size: usize, align: usize) -> AllocationResult {
        let mut inner = self.inner.lock();
        Self::allocate_in(
            &mut inner,
            &self.allocator,
            &self.marking,
            self.policy.as_ref(),
            self.maximum_pages,
            size,
            align,
        )
    }

    fn allocate_in(
        inner: &mut NewSpaceInner,
        allocator: &MemoryAllocator,
        marking: &MarkingState,
        policy: &dyn GrowthPolicy,
        maximum_pages: usize,
        size: usize,
        align: usize,
    ) -> AllocationResult {
        debug_assert!(size > 0 && size.is_multiple_of(WORD_SIZE));
        debug_assert!(align.is_power_of_two() && align >= WORD_SIZE);

        if size + max_fill_to_align(align) > allocator.page_area_size() {
            return AllocationResult::Retry(AllocationSpace::New);
        }
        loop {
            let filler = fill_to_align(inner.info.top(), align);
            if let Some(start) = inner.info.bump(filler + size) {
                // SAFETY: the bumped range belongs to the window
                let object = unsafe { precede_with_filler(start, filler) };
                inner.allocated_since_flip += filler + size;
                if marking.black_allocation() {
                    let page = allocator.page_from_address(object);
                    allocator.register_black_area(page, object, object + size);
                }
                return AllocationResult::Success(object);
            }
            if !Self::ensure_allocation(inner, allocator, policy, maximum_pages) {
                debug!("new space exhausted for {size} bytes");
                return AllocationResult::Retry(AllocationSpace::New);
            }
        }
    }

    /// Moves the window to the next to-space page, growing the semispaces
    /// if the policy allows it.
    fn ensure_allocation(
        inner: &mut NewSpaceInner,
        allocator: &MemoryAllocator,
        policy: &dyn GrowthPolicy,
        maximum_pages: usize,
    ) -> bool {
        if inner.current + 1 >= inner.to_space.pages.len() {
            let capacity = inner.to_space.pages.len() * allocator.page_area_size();
            let maximum = maximum_pages * allocator.page_area_size();
            if !policy.may_grow(capacity, maximum)
                || !Self::grow_in(inner, allocator, maximum_pages)
            {
                return false;
            }
        }

        let (top, limit) = (inner.info.top(), inner.info.limit());
        // SAFETY: the slack still belongs to the window
        unsafe { create_filler(top, limit - top) };
        inner.allocated_since_flip += limit - top;

        inner.current += 1;
        let page = inner.to_space.pages[inner.current];
        inner
            .info
            .reset(allocator.area_start(page), allocator.area_end(page));
        true
    }

    fn grow_in(inner: &mut NewSpaceInner, allocator: &MemoryAllocator, maximum_pages: usize) -> bool {
        let current = inner.to_space.pages.len();
        let target = (current * 2).min(maximum_pages);
        if target <= current {
            return false;
        }
        let before = inner.to_space.pages.len();
        Self::acquire_pair(
            allocator,
            &mut inner.to_space,
            &mut inner.from_space,
            target - current,
        );
        let grown = inner.to_space.pages.len() > before;
        if grown {
            debug!(
                "new space grew to {} pages per semispace",
                inner.to_space.pages.len()
            );
        }
        grown
    }

    /// Doubles both semispaces up to the maximum. Returns whether any page
    /// was added.
    pub fn grow(&self) -> bool {
        let mut inner = self.inner.lock();
        Self::grow_in(&mut inner, &self.allocator, self.maximum_pages)
    }

    pub fn try_free_last(&mut self, object: Address, size: usize) -> bool {
        let inner = self.inner.get_mut();
        if inner.info.try_free_last(object, size) {
            inner.allocated_since_flip -= size;
            return true;
        }
        false
    }

    /// Swaps the semispaces after a copying collection evacuated the
    /// to-space. Allocation restarts at the first page of the new to-space.
    pub fn flip(&self) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        std::mem::swap(&mut inner.to_space.pages, &mut inner.from_space.pages);
        inner.to_space.set_flags(&self.allocator);
        inner.from_space.set_flags(&self.allocator);
        for &page in &inner.to_space.pages {
            self.allocator.clear_black_bitmap(page);
        }

        let first = inner.to_space.pages[0];
        inner.current = 0;
        inner
            .info
            .reset(self.allocator.area_start(first), self.allocator.area_end(first));
        inner.allocated_since_flip = 0;
        debug!("new space flipped");
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn to_space_contains(&self, addr: Address) -> bool {
        self.allocator
            .page_from_any_address(addr)
            .is_some_and(|page| self.allocator.is_flag_set(page, PageFlags::InToSpace))
    }

    pub fn from_space_contains(&self, addr: Address) -> bool {
        self.allocator
            .page_from_any_address(addr)
            .is_some_and(|page| self.allocator.is_flag_set(page, PageFlags::InFromSpace))
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.to_space_contains(addr) || self.from_space_contains(addr)
    }

    /// Membership by walking the page lists instead of trusting page flags.
    pub fn to_space_contains_slow(&self, addr: Address) -> bool {
        let Some(page) = self.allocator.page_from_any_address(addr) else {
            return false;
        };
        self.inner.lock().to_space.pages.contains(&page)
    }

    pub fn from_space_contains_slow(&self, addr: Address) -> bool {
        let Some(page) = self.allocator.page_from_any_address(addr) else {
            return false;
        };
        self.inner.lock().from_space.pages.contains(&page)
    }

    pub fn contains_slow(&self, addr: Address) -> bool {
        self.to_space_contains_slow(addr) || self.from_space_contains_slow(addr)
    }

    /// Usable bytes of the to-space.
    pub fn capacity(&self) -> usize {
        self.inner.lock().to_space.pages.len() * self.allocator.page_area_size()
    }

    pub fn maximum_capacity(&self) -> usize {
        self.maximum_pages * self.allocator.page_area_size()
    }

    pub fn allocated_since_flip(&self) -> usize {
        self.inner.lock().allocated_since_flip
    }

    /// Bytes left in the to-space: the window plus the untouched pages.
    pub fn available(&self) -> usize {
        let inner = self.inner.lock();
        let untouched = inner.to_space.pages.len() - inner.current - 1;
        inner.info.remaining() + untouched * self.allocator.page_area_size()
    }

    pub fn page_count(&self) -> usize {
        self.inner.lock().to_space.pages.len()
    }

    pub fn allocation_info(&self) -> AllocationInfo {
        self.inner.lock().info
    }
}
