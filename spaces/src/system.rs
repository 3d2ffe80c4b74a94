//! Anonymous memory mappings backing the page arena and large chunks.

use std::ptr::NonNull;

#[cfg(unix)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    /// Returns null when the kernel refuses the mapping.
    ///
    /// # Safety
    /// The caller owns the returned range and must unmap it with `len`.
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: a fresh private anonymous mapping aliases nothing
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// `ptr..ptr + len` must be a live mapping created by `anonymous_mmap`.
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: by contract
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Maps `size` bytes of zeroed, read-write anonymous memory.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: ownership of the range passes to the caller
    let ptr = unsafe { unix::anonymous_mmap(size) };
    NonNull::new(ptr)
}

/// `ptr` and `size` must describe a mapping returned by [`map_memory`].
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: callers only pass back ranges from map_memory
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

/// A mapping whose usable start is rounded up to `alignment`.
///
/// The whole over-sized reservation is kept so it can be unmapped in one go.
#[derive(Debug)]
pub struct AlignedReservation {
    raw: NonNull<u8>,
    raw_size: usize,
    start: usize,
    size: usize,
}

impl AlignedReservation {
    /// Reserves `size` usable bytes starting at a multiple of `alignment`.
    #[must_use]
    pub fn new(size: usize, alignment: usize) -> Option<Self> {
        debug_assert!(alignment.is_power_of_two());
        let raw_size = size.checked_add(alignment)?;
        let raw = map_memory(raw_size)?;
        let start = (raw.as_ptr() as usize + alignment - 1) & !(alignment - 1);
        Some(Self {
            raw,
            raw_size,
            start,
            size,
        })
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }
}

impl Drop for AlignedReservation {
    fn drop(&mut self) {
        unmap_memory(self.raw, self.raw_size);
    }
}

// SAFETY: the reservation is only an address range; access to the memory
// behind it is coordinated by the owning allocator.
unsafe impl Send for AlignedReservation {}
// SAFETY: see above, the struct itself is immutable after creation.
unsafe impl Sync for AlignedReservation {}
