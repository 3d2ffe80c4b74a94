use log::trace;

use crate::{
    Address, AllocationInfo, AllocationResult,
    object::{create_filler, fill_to_align, precede_with_filler},
};

/// A private bump window carved out of one space allocation.
///
/// Single owner, no locking. The unused tail `[top, limit)` always carries
/// a filler so the page stays walkable while the buffer is open.
#[derive(Debug)]
pub struct LocalAllocationBuffer {
    info: AllocationInfo,
}

impl LocalAllocationBuffer {
    /// The buffer handed out when the backing allocation failed.
    #[inline]
    pub const fn invalid() -> Self {
        Self {
            info: AllocationInfo::empty(),
        }
    }

    /// Wraps `[address, address + size)` of a successful allocation.
    pub fn from_result(result: AllocationResult, size: usize) -> Self {
        match result {
            AllocationResult::Success(top) => {
                let lab = Self {
                    info: AllocationInfo::new(top, top + size),
                };
                lab.seal_tail();
                lab
            }
            AllocationResult::Retry(_) => Self::invalid(),
        }
    }

    #[inline]
    fn seal_tail(&self) {
        let (top, limit) = (self.info.top(), self.info.limit());
        // SAFETY: the slack belongs to this buffer
        unsafe { create_filler(top, limit - top) };
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.info.is_empty()
    }

    #[inline]
    pub fn top(&self) -> Address {
        self.info.top()
    }

    #[inline]
    pub fn limit(&self) -> Address {
        self.info.limit()
    }

    /// Bytes left in the window.
    #[inline]
    pub fn size(&self) -> usize {
        self.info.remaining()
    }

    /// Bump allocation inside the buffer. `None` means the buffer is spent;
    /// the caller asks its space for a new one.
    #[inline]
    pub fn allocate_raw_aligned(&mut self, size: usize, align: usize) -> Option<Address> {
        if !self.is_valid() {
            return None;
        }
        let filler = fill_to_align(self.info.top(), align);
        let start = self.info.bump(filler + size)?;
        self.seal_tail();
        // SAFETY: the range lies inside the buffer
        Some(unsafe { precede_with_filler(start, filler) })
    }

    /// Absorbs `other` if it ends exactly where this buffer's `top` is.
    /// `other` is invalidated without sealing its window.
    pub fn try_merge(&mut self, other: &mut LocalAllocationBuffer) -> bool {
        if !self.is_valid() || !other.is_valid() || self.info.top() != other.info.limit() {
            return false;
        }
        trace!(
            "merged lab [{:#x}, {:#x}) into [{:#x}, {:#x})",
            other.info.top(),
            other.info.limit(),
            self.info.top(),
            self.info.limit()
        );
        self.info.reset(other.info.top(), self.info.limit());
        other.info = AllocationInfo::empty();
        true
    }

    pub fn try_free_last(&mut self, object: Address, size: usize) -> bool {
        if !self.is_valid() || !self.info.try_free_last(object, size) {
            return false;
        }
        self.seal_tail();
        true
    }

    /// Seals the unused tail and invalidates the buffer. Returns the sealed bytes.
    pub fn close(&mut self) -> usize {
        if !self.is_valid() {
            return 0;
        }
        let sealed = self.info.remaining();
        self.seal_tail();
        self.info = AllocationInfo::empty();
        sealed
    }
}

impl Drop for LocalAllocationBuffer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllocationSpace, object::HeapObject};

    fn buffer(words: usize) -> Box<[u64]> {
        vec![0u64; words].into_boxed_slice()
    }

    #[test]
    fn allocation_fails_locally_when_spent() {
        let mem = buffer(8);
        let base = mem.as_ptr() as Address;
        let mut lab = LocalAllocationBuffer::from_result(AllocationResult::Success(base), 64);

        assert_eq!(lab.allocate_raw_aligned(24, 8), Some(base));
        assert_eq!(lab.allocate_raw_aligned(24, 8), Some(base + 24));
        assert_eq!(lab.allocate_raw_aligned(24, 8), None);
        assert_eq!(lab.size(), 16);
    }

    #[test]
    fn retry_result_yields_invalid_buffer() {
        let mut lab = LocalAllocationBuffer::from_result(
            AllocationResult::Retry(AllocationSpace::Old),
            64,
        );
        assert!(!lab.is_valid());
        assert_eq!(lab.allocate_raw_aligned(8, 8), None);
        assert_eq!(lab.close(), 0);
    }

    #[test]
    fn merge_requires_adjacency() {
        let mem = buffer(16);
        let base = mem.as_ptr() as Address;
        let mut y = LocalAllocationBuffer::from_result(AllocationResult::Success(base), 64);
        let mut x = LocalAllocationBuffer::from_result(AllocationResult::Success(base + 64), 64);
        let mut z = LocalAllocationBuffer::from_result(AllocationResult::Success(base + 64), 64);

        assert!(!y.try_merge(&mut x));
        let _ = y.allocate_raw_aligned(16, 8);
        assert!(x.try_merge(&mut y));
        assert_eq!(x.top(), base + 16);
        assert_eq!(x.limit(), base + 128);
        assert!(!y.is_valid());
        assert_eq!(y.size(), 0);

        // z does not touch x any more
        assert!(!z.try_merge(&mut x));
        z.close();
    }

    #[test]
    fn close_seals_tail() {
        let mem = buffer(8);
        let base = mem.as_ptr() as Address;
        let mut lab = LocalAllocationBuffer::from_result(AllocationResult::Success(base), 64);
        let a = lab.allocate_raw_aligned(16, 8).unwrap();
        // SAFETY: a is inside mem
        unsafe { HeapObject::initialize(a, 16) };

        assert_eq!(lab.close(), 48);
        let tail = HeapObject::from_address(base + 16);
        assert!(tail.is_filler());
        assert_eq!(tail.size(), 48);
        assert!(!lab.is_valid());
    }

    #[test]
    fn open_buffer_keeps_tail_walkable() {
        let mem = buffer(8);
        let base = mem.as_ptr() as Address;
        let mut lab = LocalAllocationBuffer::from_result(AllocationResult::Success(base), 64);

        let whole = HeapObject::from_address(base);
        assert!(whole.is_filler());
        assert_eq!(whole.size(), 64);

        let a = lab.allocate_raw_aligned(24, 8).unwrap();
        // SAFETY: a is inside mem
        unsafe { HeapObject::initialize(a, 24) };
        let tail = HeapObject::from_address(lab.top());
        assert!(tail.is_filler());
        assert_eq!(tail.size(), 40);

        assert!(lab.try_free_last(a, 24));
        assert_eq!(HeapObject::from_address(base).size(), 64);
        assert!(HeapObject::from_address(base).is_filler());
    }

    #[test]
    fn undo_is_scoped_to_buffer() {
        let mem = buffer(8);
        let base = mem.as_ptr() as Address;
        let mut lab = LocalAllocationBuffer::from_result(AllocationResult::Success(base), 64);
        let a = lab.allocate_raw_aligned(16, 8).unwrap();
        assert!(lab.try_free_last(a, 16));
        assert_eq!(lab.allocate_raw_aligned(16, 8), Some(a));
    }
}
