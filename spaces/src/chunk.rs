//! Page arena and chunk addressing.
//!
//! Fixed-size pages live in one aligned reservation, so the page owning any
//! interior address is found by masking. Every page begins with a small
//! in-memory header; the bytes after it form the usable area. Metadata that
//! other threads read while allocation runs (owner, flags, black bitmap) is
//! kept in side tables of atomics indexed by [`PageId`].

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use log::debug;
use parking_lot::Mutex;

use crate::{
    Address, AllocationSpace,
    large_object_space::{LargeChunk, LargeObjectSpace},
    object::{WORD_SIZE, WORD_SIZE_LOG2, read_word, write_word},
    system::AlignedReservation,
};

/// Bytes reserved at the start of each page for its header.
pub const PAGE_HEADER_SIZE: usize = 64;
const PAGE_MAGIC: u64 = 0x5041_4745_4844_5221;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const NeverAllocateOnPage = 1 << 0;
        const EvacuationCandidate = 1 << 1;
        const NeverEvacuate = 1 << 2;
        const CompactionWasAborted = 1 << 3;
        /// Some range on the page was registered as allocated black.
        const HasBlackAreas = 1 << 4;
        const InToSpace = 1 << 5;
        const InFromSpace = 1 << 6;
    }
}

/// Stable index of a page slot inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u32);

impl PageId {
    #[inline(always)]
    pub const fn new(index: usize) -> Self {
        Self(index as u32)
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Either a fixed-size page or a dedicated large-object chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    Page(PageId),
    Large(LargeChunk),
}

#[derive(Debug)]
struct PageMeta {
    owner: AtomicU8,
    flags: AtomicU32,
}

/// The lower-level chunk allocator: hands pages of the arena to spaces and
/// charges large-object chunks against the same byte budget.
#[derive(Debug)]
pub struct MemoryAllocator {
    reservation: AlignedReservation,
    page_size: usize,
    page_count: usize,
    capacity: usize,
    committed: AtomicUsize,
    free_pages: Mutex<Vec<PageId>>,
    pages: Box<[PageMeta]>,
    /// One bit per word of every page; set bits are allocated black.
    black_bitmap: Box<[AtomicU64]>,
    bitmap_cells_per_page: usize,
}

impl MemoryAllocator {
    /// Reserves the arena. Returns `None` if the OS refuses the mapping.
    pub fn new(page_size: usize, capacity: usize) -> Option<Self> {
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(capacity.is_multiple_of(page_size));

        let page_count = capacity / page_size;
        let reservation = AlignedReservation::new(capacity, page_size)?;

        let pages = (0..page_count)
            .map(|_| PageMeta {
                owner: AtomicU8::new(0),
                flags: AtomicU32::new(0),
            })
            .collect::<Vec<_>>();

        let words_per_page = page_size / WORD_SIZE;
        let bitmap_cells_per_page = words_per_page.div_ceil(64);
        let mut black_bitmap = Vec::new();
        black_bitmap
            .resize_with(page_count * bitmap_cells_per_page, || AtomicU64::new(0));

        // popped from the back, lowest index first
        let free_pages = (0..page_count).rev().map(PageId::new).collect();

        Some(Self {
            reservation,
            page_size,
            page_count,
            capacity,
            committed: AtomicUsize::new(0),
            free_pages: Mutex::new(free_pages),
            pages: pages.into_boxed_slice(),
            black_bitmap: black_bitmap.into_boxed_slice(),
            bitmap_cells_per_page,
        })
    }

    #[inline(always)]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline(always)]
    pub fn page_area_size(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }

    #[inline(always)]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    /// Bytes that can still be handed out as pages or large chunks.
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.committed())
    }

    // ── Page acquisition ──────────────────────────────────────────────

    /// Takes a free page for `owner`, or `None` when the budget is spent.
    pub fn acquire_page(&self, owner: AllocationSpace) -> Option<PageId> {
        if !self.charge(self.page_size) {
            return None;
        }
        let Some(page) = self.free_pages.lock().pop() else {
            self.uncharge(self.page_size);
            return None;
        };

        let meta = self.meta(page);
        meta.flags.store(0, Ordering::Relaxed);
        meta.owner.store(owner.tag(), Ordering::Release);

        let base = self.page_base(page);
        // SAFETY: the page is inside the reservation and owned by us now
        unsafe {
            write_word(base, PAGE_MAGIC);
            write_word(base + WORD_SIZE, page.index() as u64);
        }
        debug!("acquired page {} for {owner} space", page.index());
        Some(page)
    }

    /// Returns a page to the arena; its flags and black bits are cleared.
    pub fn release_page(&self, page: PageId) {
        let meta = self.meta(page);
        debug_assert_ne!(
            meta.owner.load(Ordering::Relaxed),
            0,
            "releasing an unowned page"
        );
        meta.owner.store(0, Ordering::Release);
        meta.flags.store(0, Ordering::Relaxed);
        self.clear_black_bitmap(page);
        // SAFETY: page header is inside the reservation
        unsafe { write_word(self.page_base(page), 0) };

        self.free_pages.lock().push(page);
        self.uncharge(self.page_size);
        debug!("released page {}", page.index());
    }

    /// Charges `bytes` of large-object memory against the budget.
    pub(crate) fn charge(&self, bytes: usize) -> bool {
        let mut committed = self.committed.load(Ordering::Relaxed);
        loop {
            let Some(next) = committed.checked_add(bytes) else {
                return false;
            };
            if next > self.capacity {
                return false;
            }
            match self.committed.compare_exchange_weak(
                committed,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => committed = current,
            }
        }
    }

    pub(crate) fn uncharge(&self, bytes: usize) {
        let prev = self.committed.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "committed bytes underflow");
    }

    // ── Addressing ────────────────────────────────────────────────────

    #[inline(always)]
    fn meta(&self, page: PageId) -> &PageMeta {
        &self.pages[page.index()]
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.reservation.contains(addr)
    }

    #[inline(always)]
    pub fn page_base(&self, page: PageId) -> Address {
        self.reservation.start() + page.index() * self.page_size
    }

    #[inline(always)]
    pub fn area_start(&self, page: PageId) -> Address {
        self.page_base(page) + PAGE_HEADER_SIZE
    }

    #[inline(always)]
    pub fn area_end(&self, page: PageId) -> Address {
        self.page_base(page) + self.page_size
    }

    /// Masks `addr` down to its page. Only valid for addresses inside the
    /// arena; allocation-area limits equal to `area_end` map to the page
    /// they close.
    #[inline(always)]
    pub fn page_from_address(&self, addr: Address) -> PageId {
        debug_assert!(
            self.contains(addr),
            "address {addr:#x} is not inside the page arena"
        );
        let base = addr & !(self.page_size - 1);
        PageId::new((base - self.reservation.start()) / self.page_size)
    }

    /// Like [`Self::page_from_address`] but accepts a window limit, which may
    /// sit exactly at the end of its page.
    #[inline(always)]
    pub fn page_from_allocation_area_address(&self, addr: Address) -> PageId {
        self.page_from_address(addr - WORD_SIZE)
    }

    /// Resolves `addr` to a page if it lies in the usable area of a page
    /// that currently carries a page header.
    pub fn page_from_any_address(&self, addr: Address) -> Option<PageId> {
        if !self.contains(addr) {
            return None;
        }
        let page = self.page_from_address(addr);
        let base = self.page_base(page);
        if addr - base < PAGE_HEADER_SIZE || !self.has_page_header(page) {
            return None;
        }
        Some(page)
    }

    #[inline]
    fn has_page_header(&self, page: PageId) -> bool {
        if self.meta(page).owner.load(Ordering::Acquire) == 0 {
            return false;
        }
        // SAFETY: the header word lies inside the reservation
        unsafe { read_word(self.page_base(page)) == PAGE_MAGIC }
    }

    // ── Metadata ──────────────────────────────────────────────────────

    #[inline]
    pub fn owner(&self, page: PageId) -> Option<AllocationSpace> {
        AllocationSpace::from_tag(self.meta(page).owner.load(Ordering::Acquire))
    }

    pub(crate) fn set_owner(&self, page: PageId, owner: AllocationSpace) {
        self.meta(page).owner.store(owner.tag(), Ordering::Release);
    }

    #[inline]
    pub fn flags(&self, page: PageId) -> PageFlags {
        PageFlags::from_bits_retain(self.meta(page).flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_flag_set(&self, page: PageId, flag: PageFlags) -> bool {
        self.flags(page).contains(flag)
    }

    #[inline]
    pub fn set_flag(&self, page: PageId, flag: PageFlags) {
        self.meta(page).flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flag(&self, page: PageId, flag: PageFlags) {
        self.meta(page).flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Pages flagged never-allocate or evacuation candidate take no new objects.
    #[inline]
    pub fn can_allocate(&self, page: PageId) -> bool {
        !self.flags(page).intersects(
            PageFlags::NeverAllocateOnPage | PageFlags::EvacuationCandidate,
        )
    }

    // ── Black allocation ──────────────────────────────────────────────

    /// Records `[start, end)` as allocated black on `page`.
    ///
    /// Bits are only ever set, so this can race with a marker reading the
    /// same bitmap.
    pub fn register_black_area(&self, page: PageId, start: Address, end: Address) {
        debug_assert!(start <= end);
        debug_assert!(start >= self.area_start(page) && end <= self.area_end(page));
        if start == end {
            return;
        }
        let base = self.page_base(page);
        let first = (start - base) >> WORD_SIZE_LOG2;
        let last = (end - base) >> WORD_SIZE_LOG2;
        let cells = self.page_cells(page);

        let mut bit = first;
        while bit < last {
            let cell = bit / 64;
            let offset = bit % 64;
            let span = (64 - offset).min(last - bit);
            let mask = if span == 64 {
                u64::MAX
            } else {
                ((1u64 << span) - 1) << offset
            };
            cells[cell].fetch_or(mask, Ordering::Relaxed);
            bit += span;
        }
        self.set_flag(page, PageFlags::HasBlackAreas);
    }

    /// Whether the word at `addr` was registered as allocated black.
    pub fn is_black(&self, addr: Address) -> bool {
        let Some(page) = self.page_from_any_address(addr) else {
            return false;
        };
        let bit = (addr - self.page_base(page)) >> WORD_SIZE_LOG2;
        let cells = self.page_cells(page);
        cells[bit / 64].load(Ordering::Relaxed) & (1u64 << (bit % 64)) != 0
    }

    /// Drops all black registrations of `page`, e.g. once marking finished.
    pub fn clear_black_bitmap(&self, page: PageId) {
        for cell in self.page_cells(page) {
            cell.store(0, Ordering::Relaxed);
        }
        self.clear_flag(page, PageFlags::HasBlackAreas);
    }

    #[inline]
    fn page_cells(&self, page: PageId) -> &[AtomicU64] {
        let start = page.index() * self.bitmap_cells_per_page;
        &self.black_bitmap[start..start + self.bitmap_cells_per_page]
    }
}

/// Resolves any heap address to its owning chunk: masking for fixed pages,
/// the large-object table for everything else.
pub fn chunk_from_any_address(
    allocator: &MemoryAllocator,
    lo_space: &LargeObjectSpace,
    addr: Address,
) -> Option<Chunk> {
    if let Some(page) = allocator.page_from_any_address(addr) {
        return Some(Chunk::Page(page));
    }
    lo_space.find_chunk_thread_safe(addr).map(Chunk::Large)
}
