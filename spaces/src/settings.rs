use std::fmt;

use crate::{
    OS_PAGE_SIZE,
    chunk::PAGE_HEADER_SIZE,
    object::{MIN_FREE_BLOCK_SIZE, WORD_SIZE},
};

// ── Free list size classes ────────────────────────────────────────────

/// Size-class boundaries for the segregated free lists.
///
/// `class_lower_bounds[i]` is the smallest block size that lands in class
/// `i`; class `i` covers `[bound[i], bound[i + 1])` and the last class is
/// open ended. The first bound is the minimum block size the free list
/// accepts, anything smaller is wasted as filler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeListSettings {
    pub class_lower_bounds: Vec<usize>,
}

impl Default for FreeListSettings {
    fn default() -> Self {
        Self {
            class_lower_bounds: vec![16, 80, 256, 2048, 16_384, 131_072],
        }
    }
}

impl FreeListSettings {
    #[inline]
    pub fn class_count(&self) -> usize {
        self.class_lower_bounds.len()
    }

    #[inline]
    pub fn min_block_size(&self) -> usize {
        self.class_lower_bounds[0]
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let bounds = &self.class_lower_bounds;
        if bounds.is_empty() {
            return Err(ConfigError::NoSizeClasses);
        }
        if bounds[0] < MIN_FREE_BLOCK_SIZE {
            return Err(ConfigError::MinBlockTooSmall { size: bounds[0] });
        }
        if bounds.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::UnsortedSizeClasses);
        }
        if bounds.iter().any(|bound| !bound.is_multiple_of(WORD_SIZE)) {
            return Err(ConfigError::UnalignedSizeClass);
        }
        Ok(())
    }
}

// ── Heap settings ─────────────────────────────────────────────────────

/// Configuration for the page arena and the spaces carved out of it.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Size of a page, header included. Power of two, multiple of the OS page.
    pub page_size: usize,
    /// Bytes the page arena may hand out, large objects included.
    /// Must be a multiple of `page_size`.
    pub capacity: usize,
    /// Pages per semispace when the heap starts.
    pub semi_space_initial_pages: usize,
    /// Upper bound for semispace growth.
    pub semi_space_max_pages: usize,
    /// Objects above this size are placed in the large-object space.
    /// `None` means half of a page's usable area.
    pub max_regular_object_size: Option<usize>,
    pub free_list: FreeListSettings,
    /// Window size for buffers handed out by `Heap::new_lab`.
    pub lab_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            page_size: 262_144,    // 256 KB = 2^18
            capacity: 67_108_864,  // 64 MB
            semi_space_initial_pages: 1,
            semi_space_max_pages: 8,
            max_regular_object_size: None,
            free_list: FreeListSettings::default(),
            lab_size: 4096,
        }
    }
}

impl HeapSettings {
    #[inline]
    pub fn page_area_size(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }

    #[inline]
    pub fn max_regular_object_size(&self) -> usize {
        self.max_regular_object_size
            .unwrap_or(self.page_area_size() / 2)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.capacity == 0 || self.lab_size == 0 {
            return Err(ConfigError::ZeroSize);
        }
        if !self.page_size.is_power_of_two()
            || !self.page_size.is_multiple_of(OS_PAGE_SIZE)
        {
            return Err(ConfigError::PageSize {
                page_size: self.page_size,
            });
        }
        if !self.capacity.is_multiple_of(self.page_size) {
            return Err(ConfigError::Capacity {
                capacity: self.capacity,
                page_size: self.page_size,
            });
        }
        if self.semi_space_initial_pages == 0
            || self.semi_space_initial_pages > self.semi_space_max_pages
        {
            return Err(ConfigError::SemiSpacePages {
                initial: self.semi_space_initial_pages,
                maximum: self.semi_space_max_pages,
            });
        }
        let max_regular = self.max_regular_object_size();
        if max_regular == 0 || max_regular > self.page_area_size() {
            return Err(ConfigError::MaxRegularObjectSize { size: max_regular });
        }
        if !self.lab_size.is_multiple_of(WORD_SIZE)
            || self.lab_size > self.page_area_size()
        {
            return Err(ConfigError::LabSize {
                lab_size: self.lab_size,
            });
        }
        self.free_list.validate()
    }
}

// ── Errors ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    ZeroSize,
    PageSize { page_size: usize },
    Capacity { capacity: usize, page_size: usize },
    SemiSpacePages { initial: usize, maximum: usize },
    MaxRegularObjectSize { size: usize },
    LabSize { lab_size: usize },
    NoSizeClasses,
    MinBlockTooSmall { size: usize },
    UnsortedSizeClasses,
    UnalignedSizeClass,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "sizes must be > 0"),
            Self::PageSize { page_size } => write!(
                f,
                "page size {page_size} must be a power of two and a multiple of {OS_PAGE_SIZE}"
            ),
            Self::Capacity {
                capacity,
                page_size,
            } => write!(
                f,
                "capacity {capacity} must be a multiple of the page size {page_size}"
            ),
            Self::SemiSpacePages { initial, maximum } => write!(
                f,
                "semispace pages must satisfy 0 < initial ({initial}) <= maximum ({maximum})"
            ),
            Self::MaxRegularObjectSize { size } => write!(
                f,
                "max regular object size {size} must fit into one page area"
            ),
            Self::LabSize { lab_size } => write!(
                f,
                "lab size {lab_size} must be word aligned and fit into one page area"
            ),
            Self::NoSizeClasses => write!(f, "free list needs at least one size class"),
            Self::MinBlockTooSmall { size } => write!(
                f,
                "minimum free block {size} cannot hold a free-list link"
            ),
            Self::UnsortedSizeClasses => {
                write!(f, "size class bounds must be strictly ascending")
            }
            Self::UnalignedSizeClass => {
                write!(f, "size class bounds must be word aligned")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    Config(ConfigError),
    ReservationFailed { bytes: usize },
    /// The arena could not supply the initial semispace pages.
    InitialPages { pages: usize },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid heap settings: {err}"),
            Self::ReservationFailed { bytes } => {
                write!(f, "failed to reserve {bytes} bytes for the page arena")
            }
            Self::InitialPages { pages } => {
                write!(f, "capacity too small for {pages} initial semispace pages")
            }
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::ReservationFailed { .. } | Self::InitialPages { .. } => None,
        }
    }
}

impl From<ConfigError> for HeapError {
    fn from(err: ConfigError) -> Self {
        HeapError::Config(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        assert_eq!(HeapSettings::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_page_size() {
        let settings = HeapSettings {
            page_size: 3 * OS_PAGE_SIZE,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::PageSize { .. })
        ));
    }

    #[test]
    fn rejects_capacity_not_multiple_of_page() {
        let settings = HeapSettings {
            capacity: 262_144 + 8,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Capacity { .. })
        ));
    }

    #[test]
    fn rejects_semispace_bounds() {
        let settings = HeapSettings {
            semi_space_initial_pages: 4,
            semi_space_max_pages: 2,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::SemiSpacePages { .. })
        ));
    }

    #[test]
    fn rejects_bad_size_classes() {
        let mut settings = HeapSettings::default();
        settings.free_list.class_lower_bounds = vec![8, 64];
        assert_eq!(
            settings.validate(),
            Err(ConfigError::MinBlockTooSmall { size: 8 })
        );

        settings.free_list.class_lower_bounds = vec![16, 16];
        assert_eq!(
            settings.validate(),
            Err(ConfigError::UnsortedSizeClasses)
        );

        settings.free_list.class_lower_bounds = vec![];
        assert_eq!(settings.validate(), Err(ConfigError::NoSizeClasses));
    }

    #[test]
    fn max_regular_object_defaults_to_half_page_area() {
        let settings = HeapSettings::default();
        assert_eq!(
            settings.max_regular_object_size(),
            (settings.page_size - PAGE_HEADER_SIZE) / 2
        );
    }

    #[test]
    fn heap_error_displays_source() {
        let err = HeapError::from(ConfigError::ZeroSize);
        assert_eq!(err.to_string(), "invalid heap settings: sizes must be > 0");
    }
}
