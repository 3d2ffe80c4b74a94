//! Segregated free lists.
//!
//! Reclaimed blocks are threaded through their own memory as free-space
//! records. Each page owns one [`FreeListCategory`] per size class; non-empty
//! categories are chained across pages into one list per class. Categories
//! are addressed by [`PageId`], the chains store page ids instead of
//! pointers into page headers.

use log::trace;

use crate::{
    Address,
    chunk::PageId,
    object::{
        HeapObject, ObjectKind, create_filler, encode_header, free_space_next,
        set_free_space_next, write_word,
    },
    settings::FreeListSettings,
};

/// The blocks of one size class on one page.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeListCategory {
    /// First block, 0 when empty.
    top: Address,
    available: usize,
    prev: Option<PageId>,
    next: Option<PageId>,
}

impl FreeListCategory {
    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// All categories of one page, detachable so a page can move between spaces.
#[derive(Debug)]
pub struct PageCategories(Box<[FreeListCategory]>);

impl PageCategories {
    pub fn available(&self) -> usize {
        self.0.iter().map(FreeListCategory::available).sum()
    }
}

#[derive(Debug)]
pub struct FreeList {
    bounds: Box<[usize]>,
    /// Head page of each class chain.
    tops: Box<[Option<PageId>]>,
    /// Category storage indexed by page index.
    pages: Vec<Option<PageCategories>>,
    /// Bytes in linked categories.
    available: usize,
}

impl FreeList {
    pub fn new(settings: &FreeListSettings) -> Self {
        let bounds: Box<[usize]> = settings.class_lower_bounds.clone().into();
        let tops = vec![None; bounds.len()].into_boxed_slice();
        Self {
            bounds,
            tops,
            pages: Vec::new(),
            available: 0,
        }
    }

    #[inline]
    pub fn class_count(&self) -> usize {
        self.bounds.len()
    }

    #[inline]
    pub fn min_block_size(&self) -> usize {
        self.bounds[0]
    }

    /// Class whose range covers a block of `size` bytes.
    #[inline]
    pub fn class_for_size(&self, size: usize) -> usize {
        debug_assert!(size >= self.min_block_size());
        self.bounds.partition_point(|&bound| bound <= size) - 1
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tops.iter().all(Option::is_none)
    }

    pub fn available_in(&self, page: PageId) -> usize {
        self.page(page).map_or(0, PageCategories::available)
    }

    pub fn category_available(&self, page: PageId, class: usize) -> usize {
        self.page(page).map_or(0, |cats| cats.0[class].available)
    }

    // ── Page registration ─────────────────────────────────────────────

    /// Gives `page` a fresh, empty set of categories.
    pub fn initialize_page(&mut self, page: PageId) {
        if let Some(old) = self.page(page) {
            debug_assert!(old.available() == 0 || !self.has_linked(page));
        }
        self.remove_page_categories(page);
        let cats = vec![FreeListCategory::default(); self.class_count()];
        self.store(page, PageCategories(cats.into_boxed_slice()));
    }

    /// Detaches `page` and hands its categories (blocks included) to the caller.
    pub fn take_page(&mut self, page: PageId) -> Option<PageCategories> {
        self.unlink_page(page);
        self.pages.get_mut(page.index()).and_then(Option::take)
    }

    /// Adopts categories detached from another free list and links the
    /// non-empty ones. Returns the bytes that became available.
    pub fn insert_page(&mut self, page: PageId, cats: PageCategories) -> usize {
        debug_assert_eq!(cats.0.len(), self.class_count());
        self.store(page, cats);
        // detached categories carry stale chain links
        if let Some(cats) = self.page_mut(page) {
            for cat in cats.0.iter_mut() {
                cat.prev = None;
                cat.next = None;
            }
        }
        self.relink_page(page)
    }

    fn remove_page_categories(&mut self, page: PageId) {
        self.unlink_page(page);
        if let Some(slot) = self.pages.get_mut(page.index()) {
            *slot = None;
        }
    }

    fn store(&mut self, page: PageId, cats: PageCategories) {
        if self.pages.len() <= page.index() {
            self.pages.resize_with(page.index() + 1, || None);
        }
        self.pages[page.index()] = Some(cats);
    }

    #[inline]
    fn page(&self, page: PageId) -> Option<&PageCategories> {
        self.pages.get(page.index()).and_then(Option::as_ref)
    }

    #[inline]
    fn page_mut(&mut self, page: PageId) -> Option<&mut PageCategories> {
        self.pages.get_mut(page.index()).and_then(Option::as_mut)
    }

    #[inline]
    fn cat(&self, page: PageId, class: usize) -> &FreeListCategory {
        &self.page(page).expect("page registered with free list").0[class]
    }

    #[inline]
    fn cat_mut(&mut self, page: PageId, class: usize) -> &mut FreeListCategory {
        &mut self
            .page_mut(page)
            .expect("page registered with free list")
            .0[class]
    }

    // ── Category linking ──────────────────────────────────────────────

    pub fn is_linked(&self, page: PageId, class: usize) -> bool {
        let Some(cats) = self.page(page) else {
            return false;
        };
        let cat = &cats.0[class];
        cat.prev.is_some() || cat.next.is_some() || self.tops[class] == Some(page)
    }

    fn has_linked(&self, page: PageId) -> bool {
        (0..self.class_count()).any(|class| self.is_linked(page, class))
    }

    /// Links a category at the head of its class chain. Empty categories
    /// are never linked.
    pub fn add_category(&mut self, page: PageId, class: usize) -> bool {
        if self.cat(page, class).is_empty() || self.is_linked(page, class) {
            return false;
        }
        let old_top = self.tops[class];
        if let Some(top) = old_top {
            self.cat_mut(top, class).prev = Some(page);
        }
        let cat = self.cat_mut(page, class);
        cat.prev = None;
        cat.next = old_top;
        let available = cat.available;
        self.tops[class] = Some(page);
        self.available += available;
        true
    }

    /// Unlinks a category from its class chain; its blocks stay with it.
    pub fn remove_category(&mut self, page: PageId, class: usize) {
        if !self.is_linked(page, class) {
            return;
        }
        let FreeListCategory {
            prev,
            next,
            available,
            ..
        } = *self.cat(page, class);

        match prev {
            Some(prev) => self.cat_mut(prev, class).next = next,
            None => self.tops[class] = next,
        }
        if let Some(next) = next {
            self.cat_mut(next, class).prev = prev;
        }
        let cat = self.cat_mut(page, class);
        cat.prev = None;
        cat.next = None;
        self.available -= available;
    }

    /// Links every non-empty category of `page`. Returns the bytes added.
    pub fn relink_page(&mut self, page: PageId) -> usize {
        if self.page(page).is_none() {
            return 0;
        }
        let mut added = 0;
        for class in 0..self.class_count() {
            if self.add_category(page, class) {
                added += self.cat(page, class).available;
            }
        }
        added
    }

    pub fn unlink_page(&mut self, page: PageId) {
        if self.page(page).is_none() {
            return;
        }
        for class in 0..self.class_count() {
            self.remove_category(page, class);
        }
    }

    /// Drops every block of `page` from the free list. The memory stays
    /// covered by free-space records but the capacity is forfeited.
    pub fn evict_free_list_items(&mut self, page: PageId) -> usize {
        if self.page(page).is_none() {
            return 0;
        }
        let mut evicted = 0;
        for class in 0..self.class_count() {
            self.remove_category(page, class);
            let cat = self.cat_mut(page, class);
            evicted += cat.available;
            cat.reset();
        }
        trace!("evicted {evicted} bytes of page {}", page.index());
        evicted
    }

    /// Forgets all blocks of all pages, e.g. before a full sweep rebuilds them.
    pub fn reset(&mut self) {
        for cats in self.pages.iter_mut().flatten() {
            cats.0.iter_mut().for_each(FreeListCategory::reset);
        }
        self.tops.iter_mut().for_each(|top| *top = None);
        self.available = 0;
    }

    // ── Blocks ────────────────────────────────────────────────────────

    /// Puts `[start, start + size)` of `page` back on the free list.
    /// Blocks below the minimum size, or on pages that may not allocate,
    /// are only made walkable. Returns the wasted bytes.
    pub fn free(
        &mut self,
        page: PageId,
        start: Address,
        size: usize,
        can_allocate: bool,
    ) -> usize {
        if size < self.min_block_size() || !can_allocate {
            // SAFETY: the caller owns the freed range
            unsafe { create_filler(start, size) };
            return size;
        }

        let class = self.class_for_size(size);
        let cat = self.cat_mut(page, class);
        let next = cat.top;
        // SAFETY: the caller owns the freed range, size >= 2 words
        unsafe {
            write_word(start, encode_header(ObjectKind::FreeSpace, size));
            set_free_space_next(start, next);
        }
        cat.top = start;
        cat.available += size;

        if self.is_linked(page, class) {
            self.available += size;
        } else {
            self.add_category(page, class);
        }
        0
    }

    /// Hands out exactly `size` bytes. A larger block is split and its
    /// remainder goes back to the class matching the remainder's size.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        let (page, block, block_size) = self.find_block(size)?;
        debug_assert!(block_size >= size);

        let remainder = block_size - size;
        if remainder > 0 {
            self.free(page, block + size, remainder, true);
        }
        // SAFETY: the block was free and is now exclusively ours
        unsafe { create_filler(block, size) };
        Some(block)
    }

    fn find_block(&mut self, size: usize) -> Option<(PageId, Address, usize)> {
        let classes = self.class_count();
        let first_guaranteed = self.bounds.partition_point(|&bound| bound < size);

        for class in first_guaranteed..classes {
            if let Some(found) = self.pop_from_class(class) {
                return Some(found);
            }
        }

        if size >= self.min_block_size() {
            let own = self.class_for_size(size);
            if own < first_guaranteed
                && let Some(found) = self.search_class(own, size)
            {
                return Some(found);
            }
        }

        let largest = classes - 1;
        let own = self.class_for_size(size.max(self.min_block_size()));
        if largest < first_guaranteed && own != largest {
            return self.search_class(largest, size);
        }
        None
    }

    fn pop_from_class(&mut self, class: usize) -> Option<(PageId, Address, usize)> {
        let page = self.tops[class]?;
        let cat = *self.cat(page, class);
        debug_assert!(!cat.is_empty(), "linked category without blocks");
        let block = cat.top;
        let block_size = HeapObject::from_address(block).size();
        // SAFETY: linked blocks are free-space records
        let next = unsafe { free_space_next(block) };
        self.take_block(page, class, block_size, next, None);
        Some((page, block, block_size))
    }

    /// First fit over every category of `class`.
    fn search_class(
        &mut self,
        class: usize,
        size: usize,
    ) -> Option<(PageId, Address, usize)> {
        let mut page = self.tops[class];
        while let Some(current) = page {
            let cat = *self.cat(current, class);
            let mut prev_block: Option<Address> = None;
            let mut block = cat.top;
            while block != 0 {
                let block_size = HeapObject::from_address(block).size();
                // SAFETY: chained blocks are free-space records
                let next = unsafe { free_space_next(block) };
                if block_size >= size {
                    self.take_block(current, class, block_size, next, prev_block);
                    return Some((current, block, block_size));
                }
                prev_block = Some(block);
                block = next;
            }
            page = cat.next;
        }
        None
    }

    /// Unchains a block whose predecessor is `prev` (or the category top).
    fn take_block(
        &mut self,
        page: PageId,
        class: usize,
        block_size: usize,
        next: Address,
        prev: Option<Address>,
    ) {
        let cat = self.cat_mut(page, class);
        match prev {
            // SAFETY: prev is a free-space record of this category
            Some(prev) => unsafe { set_free_space_next(prev, next) },
            None => cat.top = next,
        }
        cat.available -= block_size;
        let now_empty = cat.is_empty();
        self.available -= block_size;
        if now_empty {
            self.remove_category(page, class);
        }
    }

    /// Walks the blocks of one category and returns their summed size.
    pub fn sum_category(&self, page: PageId, class: usize) -> usize {
        let mut sum = 0;
        let mut block = self.cat(page, class).top;
        while block != 0 {
            sum += HeapObject::from_address(block).size();
            // SAFETY: chained blocks are free-space records
            block = unsafe { free_space_next(block) };
        }
        sum
    }

    /// Checks the size invariant for every category of every page.
    pub fn verify(&self) -> bool {
        self.pages.iter().enumerate().all(|(index, cats)| {
            let Some(cats) = cats else {
                return true;
            };
            let page = PageId::new(index);
            cats.0.iter().enumerate().all(|(class, cat)| {
                let linked = self.is_linked(page, class);
                self.sum_category(page, class) == cat.available
                    && (!linked || !cat.is_empty())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::WORD_SIZE;

    /// Fake "pages" backed by plain heap memory; the free list only needs
    /// writable words, not real arena pages.
    struct TestPages {
        memory: Vec<Box<[u64]>>,
    }

    impl TestPages {
        fn new(count: usize, words: usize) -> Self {
            Self {
                memory: (0..count)
                    .map(|_| vec![0u64; words].into_boxed_slice())
                    .collect(),
            }
        }

        fn addr(&self, page: usize, offset: usize) -> Address {
            self.memory[page].as_ptr() as Address + offset
        }
    }

    fn create_free_list(pages: usize) -> FreeList {
        let mut list = FreeList::new(&FreeListSettings::default());
        for page in 0..pages {
            list.initialize_page(PageId::new(page));
        }
        list
    }

    #[test]
    fn class_for_size_uses_lower_bounds() {
        let list = create_free_list(0);
        assert_eq!(list.class_for_size(16), 0);
        assert_eq!(list.class_for_size(79), 0);
        assert_eq!(list.class_for_size(80), 1);
        assert_eq!(list.class_for_size(2048), 3);
        assert_eq!(list.class_for_size(1 << 20), 5);
    }

    #[test]
    fn free_links_category_and_tracks_available() {
        let mem = TestPages::new(1, 64);
        let mut list = create_free_list(1);
        let page = PageId::new(0);

        assert_eq!(list.free(page, mem.addr(0, 0), 48, true), 0);
        assert_eq!(list.free(page, mem.addr(0, 64), 96, true), 0);

        assert!(list.is_linked(page, 0));
        assert!(list.is_linked(page, 1));
        assert!(!list.is_linked(page, 2));
        assert_eq!(list.available(), 144);
        assert_eq!(list.available_in(page), 144);
        assert!(list.verify());
    }

    #[test]
    fn too_small_blocks_become_waste() {
        let mem = TestPages::new(1, 8);
        let mut list = create_free_list(1);
        let page = PageId::new(0);

        assert_eq!(list.free(page, mem.addr(0, 0), WORD_SIZE, true), WORD_SIZE);
        assert_eq!(list.available(), 0);
        assert!(list.is_empty());
        assert!(HeapObject::from_address(mem.addr(0, 0)).is_filler());
    }

    #[test]
    fn allocate_splits_and_reinserts_remainder() {
        let mem = TestPages::new(1, 16);
        let mut list = create_free_list(1);
        let page = PageId::new(0);
        let block = mem.addr(0, 0);

        list.free(page, block, 48, true);
        let got = list.allocate(32).expect("block of 48 serves 32");
        assert_eq!(got, block);

        let class = list.class_for_size(16);
        assert_eq!(list.category_available(page, class), 16);
        assert_eq!(list.available(), 16);
        let rest = HeapObject::from_address(block + 32);
        assert_eq!(rest.size(), 16);
        assert_eq!(rest.kind(), ObjectKind::FreeSpace);
        assert!(list.verify());
    }

    #[test]
    fn guaranteed_class_is_preferred_over_scan() {
        let mem = TestPages::new(1, 512);
        let mut list = create_free_list(1);
        let page = PageId::new(0);

        // 72 bytes sits in class 0, 256 bytes in class 2
        list.free(page, mem.addr(0, 0), 72, true);
        list.free(page, mem.addr(0, 1024), 256, true);

        let got = list.allocate(64).unwrap();
        assert_eq!(got, mem.addr(0, 1024));
        assert_eq!(list.available(), 72 + 192);
    }

    #[test]
    fn empty_category_is_unlinked_not_deleted() {
        let mem = TestPages::new(1, 16);
        let mut list = create_free_list(1);
        let page = PageId::new(0);

        list.free(page, mem.addr(0, 0), 32, true);
        assert!(list.is_linked(page, 0));
        assert_eq!(list.allocate(32), Some(mem.addr(0, 0)));
        assert!(!list.is_linked(page, 0));
        assert_eq!(list.available_in(page), 0);
        assert_eq!(list.allocate(16), None);

        // the category is still usable afterwards
        list.free(page, mem.addr(0, 64), 16, true);
        assert!(list.is_linked(page, 0));
    }

    #[test]
    fn chains_span_pages() {
        let mem = TestPages::new(3, 16);
        let mut list = create_free_list(3);
        for page in 0..3 {
            list.free(PageId::new(page), mem.addr(page, 0), 32, true);
        }
        assert_eq!(list.available(), 96);

        list.remove_category(PageId::new(1), 0);
        assert_eq!(list.available(), 64);
        assert!(list.is_linked(PageId::new(0), 0));
        assert!(list.is_linked(PageId::new(2), 0));

        let mut got = vec![list.allocate(32).unwrap(), list.allocate(32).unwrap()];
        got.sort();
        let mut expected = vec![mem.addr(0, 0), mem.addr(2, 0)];
        expected.sort();
        assert_eq!(got, expected);
        assert_eq!(list.allocate(32), None);

        assert_eq!(list.relink_page(PageId::new(1)), 32);
        assert_eq!(list.allocate(32), Some(mem.addr(1, 0)));
    }

    #[test]
    fn eviction_forfeits_capacity() {
        let mem = TestPages::new(2, 32);
        let mut list = create_free_list(2);
        list.free(PageId::new(0), mem.addr(0, 0), 128, true);
        list.free(PageId::new(0), mem.addr(0, 128), 32, true);
        list.free(PageId::new(1), mem.addr(1, 0), 64, true);

        assert_eq!(list.evict_free_list_items(PageId::new(0)), 160);
        assert_eq!(list.available(), 64);
        assert_eq!(list.available_in(PageId::new(0)), 0);
        assert_eq!(list.relink_page(PageId::new(0)), 0);
        assert!(list.verify());
    }

    #[test]
    fn pages_move_between_free_lists() {
        let mem = TestPages::new(1, 32);
        let mut from = create_free_list(1);
        let mut to = FreeList::new(&FreeListSettings::default());
        let page = PageId::new(0);

        from.free(page, mem.addr(0, 0), 96, true);
        from.free(page, mem.addr(0, 128), 24, true);

        let cats = from.take_page(page).unwrap();
        assert_eq!(from.available(), 0);
        assert!(from.is_empty());

        assert_eq!(to.insert_page(page, cats), 120);
        assert_eq!(to.available(), 120);
        assert!(to.verify());
    }

    #[test]
    fn free_on_non_allocatable_page_is_wasted() {
        let mem = TestPages::new(1, 16);
        let mut list = create_free_list(1);
        assert_eq!(list.free(PageId::new(0), mem.addr(0, 0), 64, false), 64);
        assert!(list.is_empty());
        assert_eq!(
            HeapObject::from_address(mem.addr(0, 0)).kind(),
            ObjectKind::FreeSpace
        );
    }
}
