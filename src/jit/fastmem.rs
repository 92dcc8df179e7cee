//! Tracking of guest memory access sites that must not use the fastmem
//! fast path.
//!
//! A site that faulted once is marked here so the emitter picks the
//! out-of-line call sequence the next time the block is compiled. Markers
//! survive `ClearCache`: a wholesale cache reset is no evidence that the
//! access stopped faulting.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::ir::LocationDescriptor;

/// Identifies one fastmem site: the owning block and the site's byte
/// offset inside it. Identity is by value, never by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DoNotFastmemMarker {
    pub location: LocationDescriptor,
    pub offset: usize,
}

/// The set of sites banned from the fast path.
///
/// Marking can happen from inside the fault handler while the emitter
/// thread is reading, so the set is guarded internally.
pub struct FastmemManager {
    do_not_fastmem: Mutex<HashSet<DoNotFastmemMarker>>,
}

impl FastmemManager {
    pub fn new() -> Self {
        FastmemManager {
            do_not_fastmem: Mutex::new(HashSet::new()),
        }
    }

    /// Whether the host can deliver recoverable faults at all.
    pub fn supports_fastmem(&self) -> bool {
        cfg!(all(target_os = "linux", target_arch = "aarch64"))
    }

    /// Ban a site from the fast path.
    pub fn mark_do_not_fastmem(&self, marker: DoNotFastmemMarker) {
        log::debug!(
            "fastmem disabled for block {} offset {:#x}",
            marker.location,
            marker.offset
        );
        self.do_not_fastmem
            .lock()
            .expect("fastmem marker set poisoned")
            .insert(marker);
    }

    /// Consulted by the emitter before choosing an inline access.
    pub fn should_fastmem(&self, marker: DoNotFastmemMarker) -> bool {
        !self
            .do_not_fastmem
            .lock()
            .expect("fastmem marker set poisoned")
            .contains(&marker)
    }

    pub fn marker_count(&self) -> usize {
        self.do_not_fastmem
            .lock()
            .expect("fastmem marker set poisoned")
            .len()
    }
}

impl Default for FastmemManager {
    fn default() -> Self {
        Self::new()
    }
}
