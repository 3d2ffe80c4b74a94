use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

/// State shared with the incremental/concurrent marker.
///
/// While black allocation is active every space registers freshly handed
/// out ranges as already marked, so the marker does not have to discover
/// them and a concurrent sweep does not reclaim them.
#[derive(Debug, Default)]
pub struct MarkingState {
    black_allocation: AtomicBool,
}

impl MarkingState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn black_allocation(&self) -> bool {
        self.black_allocation.load(Ordering::Acquire)
    }

    pub fn start_black_allocation(&self) {
        self.black_allocation.store(true, Ordering::Release);
        debug!("black allocation started");
    }

    pub fn finish_black_allocation(&self) {
        self.black_allocation.store(false, Ordering::Release);
        debug!("black allocation finished");
    }
}
