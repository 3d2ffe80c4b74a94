use std::fmt;

/// A raw heap address.
pub type Address = usize;

/// Identity of a space, carried by retry signals and page ownership.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationSpace {
    New = 1,
    Old = 2,
    /// Metadata (maps/descriptors).
    Map = 3,
    Code = 4,
    Large = 5,
}

impl AllocationSpace {
    pub const ALL: [AllocationSpace; 5] = [
        AllocationSpace::New,
        AllocationSpace::Old,
        AllocationSpace::Map,
        AllocationSpace::Code,
        AllocationSpace::Large,
    ];

    /// Decodes an owner tag stored in page metadata; 0 means unowned.
    #[inline]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(AllocationSpace::New),
            2 => Some(AllocationSpace::Old),
            3 => Some(AllocationSpace::Map),
            4 => Some(AllocationSpace::Code),
            5 => Some(AllocationSpace::Large),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn tag(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn is_paged(self) -> bool {
        matches!(
            self,
            AllocationSpace::Old | AllocationSpace::Map | AllocationSpace::Code
        )
    }
}

impl fmt::Display for AllocationSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocationSpace::New => "new",
            AllocationSpace::Old => "old",
            AllocationSpace::Map => "map",
            AllocationSpace::Code => "code",
            AllocationSpace::Large => "large",
        };
        f.write_str(name)
    }
}

/// Outcome of every allocation entry point.
///
/// `Retry` means every tier of the named space failed; the caller decides
/// whether to collect and re-issue the request or to give up.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationResult {
    Success(Address),
    Retry(AllocationSpace),
}

impl AllocationResult {
    #[inline(always)]
    pub fn is_retry(self) -> bool {
        matches!(self, AllocationResult::Retry(_))
    }

    #[inline(always)]
    pub fn address(self) -> Option<Address> {
        match self {
            AllocationResult::Success(addr) => Some(addr),
            AllocationResult::Retry(_) => None,
        }
    }

    #[inline]
    pub fn retry_space(self) -> Option<AllocationSpace> {
        match self {
            AllocationResult::Success(_) => None,
            AllocationResult::Retry(space) => Some(space),
        }
    }
}

/// A bump-pointer window `[top, limit)`.
///
/// Bytes between `top` and `limit` belong to the owner of the window but do
/// not hold objects yet. An empty window has `top == limit == 0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationInfo {
    top: Address,
    limit: Address,
}

impl AllocationInfo {
    #[inline(always)]
    pub const fn new(top: Address, limit: Address) -> Self {
        debug_assert!(top <= limit);
        Self { top, limit }
    }

    #[inline(always)]
    pub const fn empty() -> Self {
        Self { top: 0, limit: 0 }
    }

    #[inline(always)]
    pub fn top(&self) -> Address {
        self.top
    }

    #[inline(always)]
    pub fn limit(&self) -> Address {
        self.limit
    }

    #[inline(always)]
    pub fn set_top(&mut self, top: Address) {
        debug_assert!(top <= self.limit);
        self.top = top;
    }

    #[inline(always)]
    pub fn reset(&mut self, top: Address, limit: Address) {
        debug_assert!(top <= limit);
        self.top = top;
        self.limit = limit;
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.limit - self.top
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.top == 0 && self.limit == 0
    }

    /// Bumps `top` by `size` if the window has room and returns the old top.
    #[inline(always)]
    pub fn bump(&mut self, size: usize) -> Option<Address> {
        let current = self.top;
        let new_top = current.checked_add(size)?;
        if new_top > self.limit {
            return None;
        }
        self.top = new_top;
        Some(current)
    }

    /// Rewinds `top` to `object` if it was the last `size` bytes handed out.
    #[inline]
    pub fn try_free_last(&mut self, object: Address, size: usize) -> bool {
        if self.top != 0 && self.top.wrapping_sub(size) == object {
            self.top = object;
            return true;
        }
        false
    }
}
