//! The instrumented allocator family and the quarantine ring ("morgue"): §4.4.
//!
//! Grounded on `libafl_frida::asan::alloc::Allocator` (allocate/release,
//! `AllocationMetadata`, the `hashbrown` tracking map) generalized to the
//! full redzone-kind palette and the morgue described in §3/§9, and on
//! `libc/log/asan.c`'s `__asan_allocate`/`__asan_deallocate` for the exact
//! byte-level layout and the deallocation-fault check this spec's Open
//! Question (§9) requires preserving unaltered.

use std::ffi::c_void;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::backing::{backing_free, backing_memalign, backing_realloc, backing_usable_size, round_up};
use crate::config::SanitizerOptions;
use crate::poison::PoisonKind;
use crate::redzone::{self, read_shadow_byte};
use crate::report;
use crate::shadow::{shadow, ShadowMap};

/// Diagnostic side-table entry for one allocation. Never consulted to decide
/// addressability (that's always re-derived from shadow, per I5) — purely
/// for `malloc_usable_size` cross-checks in tests and for naming allocation
/// sites in fault messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationMetadata {
    pub address: usize,
    pub size: usize,
    pub actual_size: usize,
    #[serde(skip)]
    pub allocation_site_backtrace: Option<backtrace::Backtrace>,
    #[serde(skip)]
    pub release_site_backtrace: Option<backtrace::Backtrace>,
    pub freed: bool,
}

/// Fixed-capacity ring of recently-freed pointers (§3 Morgue). Displacing a
/// slot is the only way a freed pointer is actually returned to the backing
/// allocator — everything still in the ring stays shadow-poisoned and keeps
/// trapping use-after-free.
pub struct Morgue {
    slots: [Option<usize>; Self::CAPACITY],
    next: usize,
}

impl Morgue {
    pub const CAPACITY: usize = 16;

    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [None; Self::CAPACITY],
            next: 0,
        }
    }

    /// Inserts `ptr`, returning whichever pointer it displaced (I4).
    pub fn push(&mut self, ptr: usize) -> Option<usize> {
        let evicted = self.slots[self.next].replace(ptr);
        self.next = (self.next + 1) & (Self::CAPACITY - 1);
        evicted
    }

    #[must_use]
    pub fn contains(&self, ptr: usize) -> bool {
        self.slots.iter().any(|slot| *slot == Some(ptr))
    }
}

impl Default for Morgue {
    fn default() -> Self {
        Self::new()
    }
}

/// malloc/free/realloc/memalign/calloc/valloc/pvalloc plus usable-size
/// inference, all layered on [`ShadowMap`] + [`crate::redzone`].
pub struct InstrumentedAllocator {
    options: SanitizerOptions,
    allocations: HashMap<usize, AllocationMetadata>,
    morgue: Morgue,
    total_allocation_size: usize,
    page_size: usize,
}

impl InstrumentedAllocator {
    #[must_use]
    pub fn new(options: SanitizerOptions) -> Self {
        Self {
            options,
            allocations: HashMap::new(),
            morgue: Morgue::new(),
            total_allocation_size: 0,
            page_size: mmap_rs::MmapOptions::page_size(),
        }
    }

    /// `allocate(align, size, underrun_kind, overrun_kind)`. Returns null on
    /// backing-allocator failure or when the request is rejected by the
    /// configured size caps.
    pub fn allocate(
        &mut self,
        shadow_map: &mut ShadowMap,
        align: usize,
        size: usize,
        underrun: PoisonKind,
        overrun: PoisonKind,
    ) -> *mut c_void {
        log::trace!("asan: allocate(align={align:#x}, size={size:#x})");

        if size > self.options.max_allocation {
            if self.options.max_allocation_panics {
                panic!("asan: allocation of {size:#x} bytes exceeds max_allocation");
            }
            log::warn!("asan: rejecting allocation of {size:#x} bytes (max_allocation exceeded)");
            return std::ptr::null_mut();
        }

        let rounded_body = round_up(size, 8);
        let backing_size = rounded_body + 16;
        if self.total_allocation_size + backing_size > self.options.max_total_allocation {
            log::warn!("asan: rejecting allocation, max_total_allocation exceeded");
            return std::ptr::null_mut();
        }

        let base = unsafe { backing_memalign(align.max(16), backing_size) };
        if base.is_null() {
            log::error!("asan: backing allocator failed for size {backing_size:#x}");
            return std::ptr::null_mut();
        }
        let address = base as usize;

        // Shadow must cover the 16 bytes before `address` too: that's where
        // the (virtual) left redzone is painted, even though those bytes are
        // not part of this backing allocation (see module docs in
        // `crate::redzone`).
        shadow_map.map_shadow(address - 16, backing_size + 16);

        unsafe {
            redzone::write_shadow_byte(address - 16, underrun.as_byte());
            redzone::write_shadow_byte(address - 8, underrun.as_byte());
            redzone::unpoison(address, size);
            redzone::fill_shadow(address + rounded_body, 2, overrun.as_byte());
        }

        self.total_allocation_size += backing_size;
        let mut metadata = AllocationMetadata {
            address,
            size,
            actual_size: backing_size,
            freed: false,
            ..AllocationMetadata::default()
        };
        if self.options.allocation_backtraces {
            metadata.allocation_site_backtrace = Some(backtrace::Backtrace::new_unresolved());
        }
        self.allocations.insert(address, metadata);

        base
    }

    #[must_use]
    pub fn malloc(&mut self, shadow_map: &mut ShadowMap, size: usize) -> *mut c_void {
        self.allocate(shadow_map, 16, size, PoisonKind::HeapUnderrun, PoisonKind::HeapOverrun)
    }

    #[must_use]
    pub fn memalign(&mut self, shadow_map: &mut ShadowMap, align: usize, size: usize) -> *mut c_void {
        self.allocate(shadow_map, align, size, PoisonKind::HeapUnderrun, PoisonKind::HeapOverrun)
    }

    #[must_use]
    pub fn valloc(&mut self, shadow_map: &mut ShadowMap, size: usize) -> *mut c_void {
        self.memalign(shadow_map, self.page_size, size)
    }

    #[must_use]
    pub fn pvalloc(&mut self, shadow_map: &mut ShadowMap, size: usize) -> *mut c_void {
        let page = self.page_size;
        self.memalign(shadow_map, page, round_up(size, page))
    }

    /// `calloc(n, m)`: overflowing products saturate to `usize::MAX`, which
    /// the backing allocator will refuse, yielding null (§4.4, scenario 5).
    #[must_use]
    pub fn calloc(&mut self, shadow_map: &mut ShadowMap, n: usize, m: usize) -> *mut c_void {
        let size = n.checked_mul(m).unwrap_or(usize::MAX);
        let ptr = self.malloc(shadow_map, size);
        if !ptr.is_null() {
            unsafe { ptr.write_bytes(0, size) };
        }
        ptr
    }

    /// `realloc(p, n)` per §4.4.
    pub fn realloc(&mut self, shadow_map: &mut ShadowMap, ptr: *mut c_void, size: usize) -> *mut c_void {
        if ptr.is_null() {
            return self.malloc(shadow_map, size);
        }
        if size == 0 {
            self.free(shadow_map, ptr);
            return std::ptr::null_mut();
        }

        let new_ptr = self.malloc(shadow_map, size);
        if new_ptr.is_null() {
            // Old pointer remains live; null propagated, per §4.4.
            return std::ptr::null_mut();
        }

        let old_usable = unsafe { backing_usable_size(ptr) };
        let copy_len = size.min(old_usable);
        unsafe { std::ptr::copy_nonoverlapping(ptr as *const u8, new_ptr as *mut u8, copy_len) };

        self.deallocate(ptr, PoisonKind::HeapRelocated);
        new_ptr
    }

    /// `free(p)`: null is a no-op.
    pub fn free(&mut self, _shadow_map: &mut ShadowMap, ptr: *mut c_void) {
        if !ptr.is_null() {
            self.deallocate(ptr, PoisonKind::HeapFree);
        }
    }

    /// `deallocate(p, kind)` per §4.4, including the Open Question check
    /// (§9) preserved exactly as the original: a byte that is negative *and*
    /// not `HeapOverrun`, or `>= 8`, is a deallocation fault.
    fn deallocate(&mut self, ptr: *mut c_void, kind: PoisonKind) {
        let address = ptr as usize;
        let byte = unsafe { read_shadow_byte(address) };

        if (byte < 0 && byte != PoisonKind::HeapOverrun.as_byte()) || byte >= 8 {
            log::error!("asan: deallocation fault at {ptr:?}, shadow byte {byte}");
            report::report_deallocate_fault(address, byte);
        }

        let usable = unsafe { backing_usable_size(ptr) };
        unsafe { redzone::fill_shadow(address, usable / 8, kind.as_byte()) };

        if let Some(metadata) = self.allocations.get_mut(&address) {
            metadata.freed = true;
            if self.options.allocation_backtraces {
                metadata.release_site_backtrace = Some(backtrace::Backtrace::new_unresolved());
            }
        }

        log::debug!("asan: quarantining {ptr:?}");
        if let Some(evicted) = self.morgue.push(address) {
            log::trace!("asan: morgue evicting {evicted:#x} to backing allocator");
            self.allocations.remove(&evicted);
            unsafe { backing_free(evicted as *mut c_void) };
        }
    }

    /// `malloc_usable_size(p)`: walk shadow bytes forward from `shadow(p)`,
    /// per §4.4's exact algorithm — never consults `self.allocations`.
    #[must_use]
    pub fn malloc_usable_size(ptr: *mut c_void) -> usize {
        let mut address = ptr as usize;
        let mut total = 0usize;
        loop {
            let byte = unsafe { read_shadow_byte(address) };
            if byte == 0 {
                total += 8;
                address += 8;
            } else if byte > 0 {
                total += (byte & 7) as usize;
                break;
            } else {
                break;
            }
        }
        total
    }

    /// Exposed for tests and diagnostics only; not part of the addressability
    /// model (see [`AllocationMetadata`] docs).
    #[must_use]
    pub fn tracked(&self, ptr: *mut c_void) -> Option<&AllocationMetadata> {
        self.allocations.get(&(ptr as usize))
    }

    #[must_use]
    pub fn is_quarantined(&self, ptr: *mut c_void) -> bool {
        self.morgue.contains(ptr as usize)
    }
}

#[inline]
#[must_use]
pub(crate) fn shadow_of(ptr: *mut c_void) -> usize {
    shadow(ptr as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poison::{decode, ShadowState};
    use serial_test::serial;

    fn byte_at(ptr: *mut c_void, offset: isize) -> i8 {
        unsafe { read_shadow_byte((ptr as isize + offset) as usize) }
    }

    #[test]
    #[serial]
    fn p1_round_trip_and_redzones() {
        let mut shadow_map = ShadowMap::new();
        let mut alloc = InstrumentedAllocator::new(SanitizerOptions::default());
        let p = alloc.malloc(&mut shadow_map, 20);
        assert!(!p.is_null());

        for i in 0..20 {
            match decode(byte_at(p, i)) {
                ShadowState::Addressable | ShadowState::Partial(_) => {}
                other => panic!("offset {i} expected addressable, got {other:?}"),
            }
        }
        for i in -16..0 {
            assert_eq!(decode(byte_at(p, i)), ShadowState::Poisoned(Some(PoisonKind::HeapUnderrun)));
        }
        // 20 rounds up to 24; overrun covers [24, 24+16).
        for i in 24..40 {
            assert_eq!(decode(byte_at(p, i)), ShadowState::Poisoned(Some(PoisonKind::HeapOverrun)));
        }
    }

    #[test]
    #[serial]
    fn p2_use_after_free_poisons_heap_free() {
        let mut shadow_map = ShadowMap::new();
        let mut alloc = InstrumentedAllocator::new(SanitizerOptions::default());
        let p = alloc.malloc(&mut shadow_map, 16);
        alloc.free(&mut shadow_map, p);
        for i in 0..16 {
            assert_eq!(decode(byte_at(p, i)), ShadowState::Poisoned(Some(PoisonKind::HeapFree)));
        }
    }

    #[test]
    #[serial]
    fn p3_realloc_relocates() {
        let mut shadow_map = ShadowMap::new();
        let mut alloc = InstrumentedAllocator::new(SanitizerOptions::default());
        let p = alloc.malloc(&mut shadow_map, 8);
        unsafe { (p as *mut u8).write_bytes(0x42, 8) };
        let q = alloc.realloc(&mut shadow_map, p, 64);
        assert!(!q.is_null());
        assert_ne!(p, q);
        assert_eq!(decode(byte_at(p, 0)), ShadowState::Poisoned(Some(PoisonKind::HeapRelocated)));
        let copied = unsafe { (q as *const u8).read() };
        assert_eq!(copied, 0x42);
    }

    #[test]
    #[serial]
    fn p4_usable_size_agrees_with_shadow_scan() {
        let mut shadow_map = ShadowMap::new();
        let mut alloc = InstrumentedAllocator::new(SanitizerOptions::default());
        let p = alloc.malloc(&mut shadow_map, 13);
        let usable = InstrumentedAllocator::malloc_usable_size(p);
        assert!(usable >= 13);
    }

    #[test]
    #[serial]
    fn p5_morgue_ring_releases_after_capacity_plus_one() {
        let mut shadow_map = ShadowMap::new();
        let mut alloc = InstrumentedAllocator::new(SanitizerOptions::default());

        let mut pointers = Vec::new();
        for _ in 0..Morgue::CAPACITY {
            let p = alloc.malloc(&mut shadow_map, 32);
            alloc.free(&mut shadow_map, p);
            pointers.push(p as usize);
        }
        // After exactly 16 frees, the ring is full but nothing evicted yet:
        // every pointer is still quarantined (still poisoned, still trapped).
        for p in &pointers {
            assert!(alloc.is_quarantined(*p as *mut c_void));
        }

        let seventeenth = alloc.malloc(&mut shadow_map, 32);
        alloc.free(&mut shadow_map, seventeenth);
        // The 17th free evicted exactly the first of the original sixteen.
        assert!(!alloc.is_quarantined(pointers[0] as *mut c_void));
        for p in &pointers[1..] {
            assert!(alloc.is_quarantined(*p as *mut c_void));
        }
    }

    #[test]
    #[serial]
    fn p6_redzone_partial_byte_for_malloc_13() {
        let mut shadow_map = ShadowMap::new();
        let mut alloc = InstrumentedAllocator::new(SanitizerOptions::default());
        let p = alloc.malloc(&mut shadow_map, 13);
        assert_eq!(byte_at(p, 0), 0);
        assert_eq!(byte_at(p, 8), 5);
        assert_eq!(decode(byte_at(p, 16)), ShadowState::Poisoned(Some(PoisonKind::HeapOverrun)));
        assert_eq!(decode(byte_at(p, 24)), ShadowState::Poisoned(Some(PoisonKind::HeapOverrun)));
    }

    #[test]
    #[serial]
    fn calloc_overflow_saturates_and_fails() {
        let mut shadow_map = ShadowMap::new();
        let mut alloc = InstrumentedAllocator::new(SanitizerOptions::default());
        let p = alloc.calloc(&mut shadow_map, usize::MAX / 2, 4);
        assert!(p.is_null());
    }

    #[test]
    #[serial]
    fn realloc_null_pointer_behaves_like_malloc() {
        let mut shadow_map = ShadowMap::new();
        let mut alloc = InstrumentedAllocator::new(SanitizerOptions::default());
        let p = alloc.realloc(&mut shadow_map, std::ptr::null_mut(), 16);
        assert!(!p.is_null());
    }

    #[test]
    #[serial]
    fn realloc_to_zero_frees_and_returns_null() {
        let mut shadow_map = ShadowMap::new();
        let mut alloc = InstrumentedAllocator::new(SanitizerOptions::default());
        let p = alloc.malloc(&mut shadow_map, 16);
        let q = alloc.realloc(&mut shadow_map, p, 0);
        assert!(q.is_null());
        assert_eq!(decode(byte_at(p, 0)), ShadowState::Poisoned(Some(PoisonKind::HeapFree)));
    }
}
