//! Property-based tests for the allocation invariants.

use std::{collections::HashSet, sync::Arc, thread};

use proptest::prelude::*;
use spaces::{
    Address, AllocationSpace, FreeListSettings, Heap, HeapObject, HeapObjectIterator,
    HeapSettings, LocalAllocationBuffer, MarkingState, MemoryAllocator, PageIterator, PagedSpace,
};

const PAGE: usize = 16 * 1024;

fn create_paged_space(pages: usize) -> PagedSpace {
    let allocator = MemoryAllocator::new(PAGE, pages * PAGE).expect("reserve arena");
    PagedSpace::new(
        AllocationSpace::Old,
        Arc::new(allocator),
        Arc::new(MarkingState::new()),
        &FreeListSettings::default(),
    )
}

#[derive(Debug, Clone)]
enum Op {
    Allocate { words: usize, align_log2: u32 },
    UndoLast,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1usize..64, 3u32..7).prop_map(|(words, align_log2)| Op::Allocate { words, align_log2 }),
        1 => Just(Op::UndoLast),
    ]
}

/// Object sizes in bytes, word multiples.
fn object_sizes() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec((1usize..48).prop_map(|words| words * 8), 1..300)
}

/// Walks every page word by word via the header sizes, jumping over the
/// window, and checks the walk ends exactly at the page end.
fn assert_pages_walkable(space: &PagedSpace) {
    let allocator = space.allocator();
    let info = space.allocation_info();
    let pages = PageIterator::new(space).collect::<Vec<_>>();
    for page in pages {
        let mut cursor = allocator.area_start(page);
        let end = allocator.area_end(page);
        while cursor < end {
            if cursor == info.top() && info.top() != info.limit() {
                cursor = info.limit();
                continue;
            }
            let size = HeapObject::from_address(cursor).size();
            assert!(size > 0, "gap without header at {cursor:#x}");
            cursor += size;
        }
        assert_eq!(cursor, end, "walk overshot page {}", page.index());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// `top` only moves forward, except an undo that restores it exactly.
    #[test]
    fn bump_top_is_monotonic(ops in prop::collection::vec(op(), 1..200)) {
        let mut space = create_paged_space(4);
        let mut last: Option<(Address, usize, Address)> = None;
        for op in ops {
            let before = space.allocation_info();
            match op {
                Op::Allocate { words, align_log2 } => {
                    let size = words * 8;
                    let result = space.allocate_raw(size, 1 << align_log2);
                    let after = space.allocation_info();
                    if let Some(addr) = result.address() {
                        prop_assert_eq!(addr % (1 << align_log2), 0);
                        if before.limit() == after.limit() {
                            prop_assert!(after.top() >= before.top());
                        }
                        last = Some((addr, size, before.top()));
                    }
                }
                Op::UndoLast => {
                    if let Some((addr, size, _)) = last.take() {
                        if space.try_free_last(addr, size) {
                            prop_assert_eq!(space.allocation_info().top(), addr);
                        } else {
                            prop_assert_eq!(space.allocation_info(), before);
                        }
                    }
                }
            }
        }
    }

    /// Every page stays walkable and the iterator sees exactly the live set,
    /// whatever mix of bump, free-list and aligned allocation produced it.
    #[test]
    fn heap_stays_walkable(
        sizes in object_sizes(),
        free_mask in prop::collection::vec(any::<bool>(), 300),
        aligned in prop::collection::vec(any::<bool>(), 300),
    ) {
        let mut space = create_paged_space(16);
        let mut live = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let align = if aligned[i] { 64 } else { 8 };
            if let Some(addr) = space.allocate_raw(size, align).address() {
                // SAFETY: freshly allocated
                unsafe { HeapObject::initialize(addr, size) };
                live.push((addr, size));
            }
        }
        let mut kept = Vec::new();
        for (i, (addr, size)) in live.into_iter().enumerate() {
            if free_mask[i] {
                space.free(addr, size);
            } else {
                kept.push(addr);
            }
        }
        // refill from the free list
        for &size in sizes.iter().take(50) {
            if let Some(addr) = space.allocate_raw(size, 8).address() {
                // SAFETY: freshly allocated
                unsafe { HeapObject::initialize(addr, size) };
                kept.push(addr);
            }
        }

        assert_pages_walkable(&space);
        prop_assert!(space.lock().free_list().verify());

        let mut walked = HeapObjectIterator::new(&space)
            .map(HeapObject::address)
            .collect::<Vec<_>>();
        walked.sort_unstable();
        kept.sort_unstable();
        prop_assert_eq!(walked, kept);
        prop_assert_eq!(
            space.capacity(),
            space.size() + space.available() + space.waste() + space.allocation_info().remaining()
        );
    }

    /// Category sums match their blocks after frees and allocations.
    #[test]
    fn free_list_sizes_match_blocks(
        sizes in object_sizes(),
        requests in prop::collection::vec((2usize..64).prop_map(|w| w * 8), 1..100),
    ) {
        let mut space = create_paged_space(16);
        let objects = sizes
            .iter()
            .filter_map(|&size| space.allocate_raw(size, 8).address().map(|addr| (addr, size)))
            .collect::<Vec<_>>();
        for &(addr, size) in &objects {
            // SAFETY: freshly allocated
            unsafe { HeapObject::initialize(addr, size) };
        }
        space.close_allocation_window();
        for &(addr, size) in objects.iter().step_by(2) {
            space.free(addr, size);
        }
        prop_assert!(space.lock().free_list().verify());

        for size in requests {
            let available = space.available();
            if let Some(addr) = space.allocate_raw(size, 8).address() {
                // SAFETY: freshly allocated
                unsafe { HeapObject::initialize(addr, size) };
                prop_assert!(space.available() <= available);
            }
            prop_assert!(space.lock().free_list().verify());
        }
    }

    /// A buffer never hands out bytes past its limit.
    #[test]
    fn lab_stays_within_window(words in prop::collection::vec(1usize..16, 1..64)) {
        let mut space = create_paged_space(1);
        let mut lab = LocalAllocationBuffer::from_result(space.allocate_raw(512, 8), 512);
        let (start, limit) = (lab.top(), lab.limit());
        let mut used = 0;
        for w in words {
            match lab.allocate_raw_aligned(w * 8, 8) {
                Some(addr) => {
                    prop_assert!(addr >= start && addr + w * 8 <= limit);
                    used += w * 8;
                }
                None => prop_assert!(lab.size() < w * 8),
            }
        }
        prop_assert_eq!(lab.top(), start + used);
    }
}

#[test]
fn concurrent_allocations_never_overlap() {
    let settings = HeapSettings {
        page_size: PAGE,
        capacity: 256 * PAGE,
        semi_space_max_pages: 8,
        ..Default::default()
    };
    let heap = Heap::new(settings).unwrap();

    let ranges = thread::scope(|scope| {
        let handles = (0..4)
            .flat_map(|t| {
                let heap = &heap;
                [AllocationSpace::Old, AllocationSpace::New].map(move |space| {
                    scope.spawn(move || {
                        (0..2000)
                            .filter_map(|i| {
                                let size = 16 + ((i * 7 + t) % 24) * 8;
                                heap.allocate_object(size, space, 8)
                                    .address()
                                    .map(|addr| (addr, size))
                            })
                            .collect::<Vec<_>>()
                    })
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .flat_map(|h| h.join().expect("allocation thread panicked"))
            .collect::<Vec<_>>()
    });

    let mut starts = HashSet::new();
    for &(addr, _) in &ranges {
        assert!(starts.insert(addr), "address {addr:#x} handed out twice");
    }
    let mut sorted = ranges;
    sorted.sort_unstable();
    for pair in sorted.windows(2) {
        let (a, size) = pair[0];
        assert!(a + size <= pair[1].0, "ranges overlap at {a:#x}");
    }
}
