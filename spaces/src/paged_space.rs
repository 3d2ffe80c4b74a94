//! Free-list backed spaces for the old generation (old, map and code).
//!
//! Allocation cascades from the bump window to the free list to a fresh
//! page from the arena. When every tier fails the caller gets a retry
//! signal tagged with the space identity.

use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    Address, AllocationInfo, AllocationResult, AllocationSpace,
    chunk::{MemoryAllocator, PageFlags, PageId},
    free_list::{FreeList, PageCategories},
    marking::MarkingState,
    object::{WORD_SIZE, fill_to_align, max_fill_to_align, precede_with_filler},
    settings::FreeListSettings,
};

/// A page split out of a space together with its free-list categories and
/// its allocated-bytes counter, ready to be added to another space.
#[derive(Debug)]
pub struct DetachedPage {
    pub page: PageId,
    categories: Option<PageCategories>,
    allocated: usize,
}

#[derive(Debug)]
pub struct PagedSpaceInner {
    /// Pages in the order they joined the space.
    pages: Vec<PageId>,
    /// Allocated bytes per page index; `None` for pages of other owners.
    /// The open window counts as allocated until it is closed.
    accounting: Vec<Option<usize>>,
    allocated: usize,
    free_list: FreeList,
    info: AllocationInfo,
}

impl PagedSpaceInner {
    #[inline]
    pub fn pages(&self) -> &[PageId] {
        &self.pages
    }

    #[inline]
    pub fn allocation_info(&self) -> AllocationInfo {
        self.info
    }

    #[inline]
    pub fn contains_page(&self, page: PageId) -> bool {
        matches!(self.accounting.get(page.index()), Some(Some(_)))
    }

    #[inline]
    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    pub fn allocated_on(&self, page: PageId) -> usize {
        self.accounting
            .get(page.index())
            .copied()
            .flatten()
            .unwrap_or(0)
    }

    fn window_page(&self, allocator: &MemoryAllocator) -> Option<PageId> {
        if self.info.is_empty() {
            return None;
        }
        Some(allocator.page_from_allocation_area_address(self.info.limit()))
    }

    fn charge(&mut self, page: PageId, bytes: usize) {
        if let Some(Some(allocated)) = self.accounting.get_mut(page.index()) {
            *allocated += bytes;
            self.allocated += bytes;
        }
    }

    fn uncharge(&mut self, page: PageId, bytes: usize) {
        if let Some(Some(allocated)) = self.accounting.get_mut(page.index()) {
            debug_assert!(*allocated >= bytes, "freeing more than was allocated");
            *allocated -= bytes;
            self.allocated -= bytes;
        }
    }

    /// Gives `[start, start + size)` back to the free list of its page.
    fn free_range(&mut self, allocator: &MemoryAllocator, start: Address, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        let page = allocator.page_from_address(start);
        self.uncharge(page, size);
        self.free_list
            .free(page, start, size, allocator.can_allocate(page))
    }

    fn close_window(&mut self, allocator: &MemoryAllocator) {
        let (top, limit) = (self.info.top(), self.info.limit());
        self.info = AllocationInfo::empty();
        if top != limit {
            self.free_range(allocator, top, limit - top);
        }
    }

    fn attach(&mut self, page: PageId, allocated: usize) {
        if self.accounting.len() <= page.index() {
            self.accounting.resize(page.index() + 1, None);
        }
        debug_assert!(self.accounting[page.index()].is_none(), "page added twice");
        self.accounting[page.index()] = Some(allocated);
        self.allocated += allocated;
        self.pages.push(page);
    }

    fn detach(&mut self, page: PageId) -> Option<usize> {
        let allocated = self.accounting.get_mut(page.index())?.take()?;
        self.allocated -= allocated;
        self.pages.retain(|&p| p != page);
        Some(allocated)
    }
}

#[derive(Debug)]
pub struct PagedSpace {
    identity: AllocationSpace,
    allocator: Arc<MemoryAllocator>,
    marking: Arc<MarkingState>,
    inner: Mutex<PagedSpaceInner>,
}

impl PagedSpace {
    pub fn new(
        identity: AllocationSpace,
        allocator: Arc<MemoryAllocator>,
        marking: Arc<MarkingState>,
        free_list: &FreeListSettings,
    ) -> Self {
        debug_assert!(identity.is_paged());
        let inner = PagedSpaceInner {
            pages: Vec::new(),
            accounting: Vec::new(),
            allocated: 0,
            free_list: FreeList::new(free_list),
            info: AllocationInfo::empty(),
        };
        Self {
            identity,
            allocator,
            marking,
            inner: Mutex::new(inner),
        }
    }

    #[inline]
    pub fn identity(&self) -> AllocationSpace {
        self.identity
    }

    #[inline]
    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    /// Holds the space lock; iterators walk the space through it.
    pub fn lock(&self) -> MutexGuard<'_, PagedSpaceInner> {
        self.inner.lock()
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocation for callers with exclusive access to the space.
    #[inline]
    pub fn allocate_raw(&mut self, size: usize, align: usize) -> AllocationResult {
        let inner = self.inner.get_mut();
        Self::allocate_in(inner, self.identity, &self.allocator, &self.marking, size, align)
    }

    /// Allocation that may race with other threads using this entry point.
    pub fn allocate_raw_synchronized(&self, size: usize, align: usize) -> AllocationResult {
        let mut inner = self.inner.lock();
        Self::allocate_in(
            &mut inner,
            self.identity,
            &self.allocator,
            &self.marking,
            size,
            align,
        )
    }

    fn allocate_in(
        inner: &mut PagedSpaceInner,
        identity: AllocationSpace,
        allocator: &MemoryAllocator,
        marking: &MarkingState,
        size: usize,
        align: usize,
    ) -> AllocationResult {
        debug_assert!(size > 0 && size.is_multiple_of(WORD_SIZE));
        debug_assert!(align.is_power_of_two() && align >= WORD_SIZE);

        let object = Self::bump(&mut inner.info, size, align)
            .or_else(|| Self::allocate_from_free_list(inner, allocator, size, align))
            .or_else(|| Self::expand_and_bump(inner, identity, allocator, size, align));

        let Some(object) = object else {
            debug!("{identity} space exhausted for {size} bytes");
            return AllocationResult::Retry(identity);
        };
        if marking.black_allocation() {
            let page = allocator.page_from_address(object);
            allocator.register_black_area(page, object, object + size);
        }
        AllocationResult::Success(object)
    }

    #[inline(always)]
    fn bump(info: &mut AllocationInfo, size: usize, align: usize) -> Option<Address> {
        if info.is_empty() {
            return None;
        }
        let filler = fill_to_align(info.top(), align);
        let start = info.bump(filler + size)?;
        // SAFETY: the bumped range belongs to the window
        Some(unsafe { precede_with_filler(start, filler) })
    }

    fn allocate_from_free_list(
        inner: &mut PagedSpaceInner,
        allocator: &MemoryAllocator,
        size: usize,
        align: usize,
    ) -> Option<Address> {
        let reserved = size + max_fill_to_align(align);
        let block = inner.free_list.allocate(reserved)?;
        let page = allocator.page_from_address(block);
        inner.charge(page, reserved);

        let pre = fill_to_align(block, align);
        // SAFETY: the block was just taken off the free list
        let object = unsafe { precede_with_filler(block, pre) };
        let excess = reserved - pre - size;
        inner.free_range(allocator, object + size, excess);
        Some(object)
    }

    fn expand_and_bump(
        inner: &mut PagedSpaceInner,
        identity: AllocationSpace,
        allocator: &MemoryAllocator,
        size: usize,
        align: usize,
    ) -> Option<Address> {
        if size + max_fill_to_align(align) > allocator.page_area_size() {
            return None;
        }
        let page = allocator.acquire_page(identity)?;
        inner.close_window(allocator);
        inner.attach(page, 0);
        inner.free_list.initialize_page(page);

        let (start, end) = (allocator.area_start(page), allocator.area_end(page));
        inner.info.reset(start, end);
        inner.charge(page, end - start);
        debug!(
            "{identity} space expanded to {} pages",
            inner.pages.len()
        );
        Self::bump(&mut inner.info, size, align)
    }

    /// Rewinds the window if `object` was the last allocation.
    pub fn try_free_last(&mut self, object: Address, size: usize) -> bool {
        self.inner.get_mut().info.try_free_last(object, size)
    }

    /// Sweeper path: returns `[start, start + size)` to the free list.
    /// Returns the bytes that were too small to keep.
    pub fn free(&self, start: Address, size: usize) -> usize {
        let mut inner = self.inner.lock();
        debug_assert!(inner.contains_page(self.allocator.page_from_address(start)));
        inner.free_range(&self.allocator, start, size)
    }

    /// Seals the bump window; its slack goes back to the free list.
    pub fn close_allocation_window(&self) {
        self.inner.lock().close_window(&self.allocator);
    }

    // ── Page flags ────────────────────────────────────────────────────

    fn flag_and_evict(&self, page: PageId, flag: PageFlags) -> usize {
        let mut inner = self.inner.lock();
        debug_assert!(inner.contains_page(page));
        // flag first so the window slack is not put back on the list
        self.allocator.set_flag(page, flag);
        if inner.window_page(&self.allocator) == Some(page) {
            inner.close_window(&self.allocator);
        }
        inner.free_list.evict_free_list_items(page)
    }

    /// Stops all allocation on `page`; returns the evicted free bytes.
    pub fn mark_never_allocate(&self, page: PageId) -> usize {
        let evicted = self.flag_and_evict(page, PageFlags::NeverAllocateOnPage);
        debug!("{} page {} marked never-allocate", self.identity, page.index());
        evicted
    }

    /// Pins `page`: it can no longer become an evacuation candidate.
    pub fn mark_never_evacuate(&self, page: PageId) {
        debug_assert!(self.contains_page(page));
        self.allocator.set_flag(page, PageFlags::NeverEvacuate);
        debug!("{} page {} pinned", self.identity, page.index());
    }

    /// Flags `page` for evacuation; its free blocks are forfeited. Returns
    /// `None` for pinned pages.
    pub fn mark_evacuation_candidate(&self, page: PageId) -> Option<usize> {
        if self.allocator.is_flag_set(page, PageFlags::NeverEvacuate) {
            debug!(
                "{} page {} is pinned, not evacuating",
                self.identity,
                page.index()
            );
            return None;
        }
        let evicted = self.flag_and_evict(page, PageFlags::EvacuationCandidate);
        debug!(
            "{} page {} marked evacuation candidate",
            self.identity,
            page.index()
        );
        Some(evicted)
    }

    pub fn clear_evacuation_candidate(&self, page: PageId) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.contains_page(page));
        self.allocator.clear_flag(page, PageFlags::EvacuationCandidate);
        self.allocator.set_flag(page, PageFlags::CompactionWasAborted);
        inner.free_list.initialize_page(page);
        debug!(
            "{} page {} no longer an evacuation candidate",
            self.identity,
            page.index()
        );
    }

    // ── Page movement ─────────────────────────────────────────────────

    pub fn unlink_free_list_categories(&self, page: PageId) {
        self.inner.lock().free_list.unlink_page(page);
    }

    pub fn relink_free_list_categories(&self, page: PageId) -> usize {
        self.inner.lock().free_list.relink_page(page)
    }

    /// Splits `page` out of the space, categories included.
    pub fn remove_page(&self, page: PageId) -> Option<DetachedPage> {
        let mut inner = self.inner.lock();
        if inner.window_page(&self.allocator) == Some(page) {
            inner.close_window(&self.allocator);
        }
        let allocated = inner.detach(page)?;
        let categories = inner.free_list.take_page(page);
        Some(DetachedPage {
            page,
            categories,
            allocated,
        })
    }

    /// Adopts a page split out of another space of the same kind.
    pub fn add_page(&self, detached: DetachedPage) -> usize {
        let DetachedPage {
            page,
            categories,
            allocated,
        } = detached;
        let mut inner = self.inner.lock();
        self.allocator.set_owner(page, self.identity);
        inner.attach(page, allocated);
        match categories {
            Some(categories) => inner.free_list.insert_page(page, categories),
            None => {
                inner.free_list.initialize_page(page);
                0
            }
        }
    }

    /// Moves every page of `other` into this space, e.g. a compaction
    /// space into its target after evacuation.
    pub fn merge_from(&self, other: &PagedSpace) {
        other.close_allocation_window();
        let pages = other.lock().pages.clone();
        let count = pages.len();
        for page in pages {
            if let Some(detached) = other.remove_page(page) {
                self.add_page(detached);
            }
        }
        debug!(
            "merged {count} pages of {} space into {} space",
            other.identity, self.identity
        );
    }

    /// Returns `page` to the arena. Live objects on it are dropped.
    pub fn release_page(&self, page: PageId) -> bool {
        let mut inner = self.inner.lock();
        if inner.window_page(&self.allocator) == Some(page) {
            inner.info = AllocationInfo::empty();
        }
        if inner.detach(page).is_none() {
            return false;
        }
        let _ = inner.free_list.take_page(page);
        self.allocator.release_page(page);
        true
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn contains(&self, addr: Address) -> bool {
        self.allocator
            .page_from_any_address(addr)
            .is_some_and(|page| self.contains_page(page))
    }

    pub fn contains_page(&self, page: PageId) -> bool {
        self.inner.lock().contains_page(page)
    }

    pub fn page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Usable bytes of all pages.
    pub fn capacity(&self) -> usize {
        self.page_count() * self.allocator.page_area_size()
    }

    /// Bytes on the free list.
    pub fn available(&self) -> usize {
        self.inner.lock().free_list.available()
    }

    /// Bytes handed out as objects (fillers included), the open window excluded.
    pub fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.allocated - inner.info.remaining()
    }

    /// Bytes neither allocated nor available: undersized fragments and
    /// evicted free blocks.
    pub fn waste(&self) -> usize {
        let inner = self.inner.lock();
        let capacity = inner.pages.len() * self.allocator.page_area_size();
        capacity - inner.allocated - inner.free_list.available()
    }

    pub fn allocation_info(&self) -> AllocationInfo {
        self.inner.lock().info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::HeapObject;

    const PAGE: usize = 16 * 1024;

    fn create_space(pages: usize) -> PagedSpace {
        let allocator = Arc::new(MemoryAllocator::new(PAGE, pages * PAGE).unwrap());
        PagedSpace::new(
            AllocationSpace::Old,
            allocator,
            Arc::new(MarkingState::new()),
            &FreeListSettings::default(),
        )
    }

    fn init(addr: Address, size: usize) {
        // SAFETY: test allocations are owned by the test
        unsafe { HeapObject::initialize(addr, size) };
    }

    #[test]
    fn bump_allocations_are_contiguous() {
        let mut space = create_space(1);
        let a = space.allocate_raw(16, 8).address().unwrap();
        let b = space.allocate_raw(32, 8).address().unwrap();
        assert_eq!(b, a + 16);
        assert_eq!(space.page_count(), 1);
        assert_eq!(space.size(), 48);
        assert!(space.contains(a));
    }

    #[test]
    fn exhausted_space_retries_with_identity() {
        let mut space = create_space(1);
        let area = space.allocator().page_area_size();
        let _ = space.allocate_raw(16, 8);
        assert_eq!(
            space.allocate_raw(area, 8),
            AllocationResult::Retry(AllocationSpace::Old)
        );
    }

    #[test]
    fn aligned_allocation_inserts_filler() {
        let mut space = create_space(1);
        let a = space.allocate_raw(8, 8).address().unwrap();
        init(a, 8);
        let b = space.allocate_raw(16, 32).address().unwrap();
        assert_eq!(b % 32, 0);
        assert!(HeapObject::from_address(a + 8).is_filler());
    }

    #[test]
    fn undo_rewinds_only_last() {
        let mut space = create_space(1);
        let a = space.allocate_raw(16, 8).address().unwrap();
        let b = space.allocate_raw(16, 8).address().unwrap();
        assert!(!space.try_free_last(a, 16));
        assert!(space.try_free_last(b, 16));
        assert_eq!(space.allocate_raw(16, 8).address(), Some(b));
    }

    #[test]
    fn free_list_serves_after_window_is_spent() {
        let mut space = create_space(1);
        let area = space.allocator().page_area_size();
        let a = space.allocate_raw(64, 8).address().unwrap();
        let rest = space.allocate_raw(area - 64, 8).address().unwrap();
        init(rest, area - 64);

        space.free(a, 64);
        assert_eq!(space.available(), 64);
        assert_eq!(space.allocate_raw(48, 8).address(), Some(a));
        // the 16 byte tail stays on the free list
        assert_eq!(space.available(), 16);
        assert_eq!(space.waste(), 0);
    }

    #[test]
    fn new_page_closes_old_window() {
        let mut space = create_space(2);
        let area = space.allocator().page_area_size();
        let a = space.allocate_raw(area - 256, 8).address().unwrap();
        init(a, area - 256);

        let b = space.allocate_raw(512, 8).address().unwrap();
        assert_eq!(space.page_count(), 2);
        assert_ne!(
            space.allocator().page_from_address(a),
            space.allocator().page_from_address(b)
        );
        // the 256 byte slack of page 0 is now reusable
        assert_eq!(space.available(), 256);
    }

    #[test]
    fn evacuation_candidate_forfeits_free_blocks() {
        let mut space = create_space(1);
        let area = space.allocator().page_area_size();
        let a = space.allocate_raw(area, 8).address().unwrap();
        init(a, area);
        let page = space.allocator().page_from_address(a);

        space.free(a, 128);
        assert_eq!(space.available(), 128);
        assert_eq!(space.mark_evacuation_candidate(page), Some(128));
        assert_eq!(space.available(), 0);
        assert_eq!(space.waste(), 128);
        assert!(space.allocate_raw(16, 8).is_retry());

        // frees on the candidate page are wasted immediately
        assert_eq!(space.free(a + 128, 64), 64);

        space.clear_evacuation_candidate(page);
        space.free(a + 256, 64);
        assert_eq!(space.available(), 64);
    }

    #[test]
    fn pinned_page_is_never_evacuated() {
        let mut space = create_space(1);
        let area = space.allocator().page_area_size();
        let a = space.allocate_raw(area, 8).address().unwrap();
        init(a, area);
        let page = space.allocator().page_from_address(a);
        space.free(a, 128);

        space.mark_never_evacuate(page);
        assert_eq!(space.mark_evacuation_candidate(page), None);
        assert!(
            !space
                .allocator()
                .is_flag_set(page, PageFlags::EvacuationCandidate)
        );
        assert_eq!(space.available(), 128);
    }

    #[test]
    fn unlinked_categories_stop_serving_until_relinked() {
        let mut space = create_space(1);
        let area = space.allocator().page_area_size();
        let a = space.allocate_raw(area, 8).address().unwrap();
        init(a, area);
        let page = space.allocator().page_from_address(a);
        space.free(a, 64);
        space.free(a + 128, 256);
        assert_eq!(space.available(), 320);

        space.unlink_free_list_categories(page);
        assert_eq!(space.available(), 0);
        assert!(space.allocate_raw(48, 8).is_retry());
        // blocks stay with the page while it is unlinked
        assert_eq!(space.lock().free_list().available_in(page), 320);

        assert_eq!(space.relink_free_list_categories(page), 320);
        assert_eq!(space.available(), 320);
        assert_eq!(space.relink_free_list_categories(page), 0);
        assert!(space.allocate_raw(48, 8).address().is_some());
        assert!(space.lock().free_list().verify());
    }

    #[test]
    fn marking_window_page_closes_window() {
        let mut space = create_space(1);
        let a = space.allocate_raw(16, 8).address().unwrap();
        let page = space.allocator().page_from_address(a);
        let evicted = space.mark_never_allocate(page);
        assert_eq!(evicted, 0);
        assert!(space.allocation_info().is_empty());
        assert!(space.allocate_raw(16, 8).is_retry());
    }

    #[test]
    fn black_allocation_registers_ranges() {
        let mut space = create_space(1);
        space.marking.start_black_allocation();
        let a = space.allocate_raw(32, 8).address().unwrap();
        space.marking.finish_black_allocation();
        let b = space.allocate_raw(32, 8).address().unwrap();

        assert!(space.allocator().is_black(a));
        assert!(space.allocator().is_black(a + 24));
        assert!(!space.allocator().is_black(b));
    }

    #[test]
    fn pages_move_between_spaces() {
        let allocator = Arc::new(MemoryAllocator::new(PAGE, 4 * PAGE).unwrap());
        let marking = Arc::new(MarkingState::new());
        let settings = FreeListSettings::default();
        let mut compaction =
            PagedSpace::new(AllocationSpace::Old, allocator.clone(), marking.clone(), &settings);
        let old = PagedSpace::new(AllocationSpace::Old, allocator, marking, &settings);

        let a = compaction.allocate_raw(64, 8).address().unwrap();
        init(a, 64);
        let size = compaction.size();

        old.merge_from(&compaction);
        assert_eq!(compaction.page_count(), 0);
        assert_eq!(old.page_count(), 1);
        assert!(old.contains(a));
        assert_eq!(old.size(), size);
        // window slack came along on the free list
        assert_eq!(old.available(), old.capacity() - size);
    }

    #[test]
    fn released_page_returns_to_arena() {
        let mut space = create_space(1);
        let a = space.allocate_raw(16, 8).address().unwrap();
        let page = space.allocator().page_from_address(a);
        assert!(space.release_page(page));
        assert!(!space.release_page(page));
        assert_eq!(space.page_count(), 0);
        assert_eq!(space.allocator().available(), PAGE);
        assert!(space.allocate_raw(16, 8).address().is_some());
    }

    #[test]
    fn synchronized_allocations_never_overlap() {
        use std::{collections::HashSet, thread};

        let space = Arc::new(create_space(16));
        let handles = (0..4)
            .map(|_| {
                let space = space.clone();
                thread::spawn(move || {
                    (0..500)
                        .filter_map(|_| space.allocate_raw_synchronized(48, 8).address())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for handle in handles {
            for addr in handle.join().expect("thread panicked") {
                assert!(seen.insert(addr), "address handed out twice");
            }
        }
        let mut sorted = seen.into_iter().collect::<Vec<_>>();
        sorted.sort_unstable();
        assert!(sorted.windows(2).all(|w| w[1] - w[0] >= 48));
    }
}
