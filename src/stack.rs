//! Stack-slot and dynamic-alloca lifecycle: §4.6.
//!
//! Grounded on `libc/log/asan.c`'s `__asan_poison_stack_memory`/
//! `__asan_unpoison_stack_memory`/`__asan_alloca_poison`/
//! `__asan_allocas_unpoison`/`__asan_stack_malloc`/`__asan_stack_free`. The
//! fake-stack entry points are non-goals (§1) and stubbed exactly as the
//! original stubs them (`addr_is_in_fake_stack` / `get_current_fake_stack`
//! both report "none").

use std::ffi::c_void;

use crate::poison::PoisonKind;
use crate::redzone::{fill_shadow, poison_redzone, write_shadow_byte};
use crate::shadow::ShadowMap;
use crate::InstrumentedAllocator;

/// `poison_stack_memory(p, n)`: marks `n` bytes `Unscoped`. The trailing
/// fragment (if `n` isn't a multiple of 8) gets a *negative* partial —
/// unlike [`unpoison_stack_memory`]'s positive partial, poisoning must make
/// the fragment unaddressable, not partially addressable (§4.6, §9).
///
/// # Safety
/// The shadow range covering `[p, p + round_up(n, 8))` must be mapped.
pub unsafe fn poison_stack_memory(p: usize, n: usize) {
    log::trace!("asan: poison_stack_memory(p={p:#x}, n={n:#x})");
    fill_shadow(p, n / 8, PoisonKind::Unscoped.as_byte());
    let remainder = n % 8;
    if remainder != 0 {
        write_shadow_byte(p + n, (8 - remainder) as i8 * -1);
    }
}

/// `unpoison_stack_memory(p, n)`: marks `n` bytes addressable, with a
/// *positive* partial for the trailing fragment.
///
/// # Safety
/// Same preconditions as [`poison_stack_memory`].
pub unsafe fn unpoison_stack_memory(p: usize, n: usize) {
    log::trace!("asan: unpoison_stack_memory(p={p:#x}, n={n:#x})");
    fill_shadow(p, n / 8, 0);
    let remainder = n % 8;
    if remainder != 0 {
        write_shadow_byte(p + n, remainder as i8);
    }
}

/// `alloca_poison(addr, size)`: equivalent to
/// `poison_redzone(addr, size, size + 32, AllocaOverrun)`.
///
/// # Safety
/// The shadow range covering `[addr, addr + size + 32)` must be mapped.
pub unsafe fn alloca_poison(addr: usize, size: usize) {
    log::trace!("asan: alloca_poison(addr={addr:#x}, size={size:#x})");
    poison_redzone(addr, size, size + 32, PoisonKind::AllocaOverrun);
}

/// `allocas_unpoison(top, bottom)`: zeroes the shadow for a run of unwound
/// dynamic allocas.
///
/// # Safety
/// The shadow range covering `[top, bottom)` must be mapped.
pub unsafe fn allocas_unpoison(top: usize, bottom: usize) {
    log::trace!("asan: allocas_unpoison(top={top:#x}, bottom={bottom:#x})");
    if bottom > top {
        fill_shadow(top, (bottom - top) / 8, 0);
    }
}

/// `stack_malloc(size, classid)`: the minimal fake-stack-free implementation
/// routes to the heap allocator with stack-kind redzones (§4.6).
#[must_use]
pub fn stack_malloc(
    allocator: &mut InstrumentedAllocator,
    shadow_map: &mut ShadowMap,
    size: usize,
    _classid: i32,
) -> *mut c_void {
    allocator.allocate(shadow_map, 32, size, PoisonKind::StackUnderrun, PoisonKind::StackOverrun)
}

/// `stack_free(p, size, classid)`.
pub fn stack_free(
    allocator: &mut InstrumentedAllocator,
    shadow_map: &mut ShadowMap,
    ptr: *mut c_void,
    _size: usize,
    _classid: i32,
) {
    allocator.free(shadow_map, ptr);
}

/// Always "none": no fake-stack feature (§1, §4.6).
#[must_use]
pub fn addr_is_in_fake_stack(_fake_stack: *mut c_void, _addr: *mut c_void) -> Option<(usize, usize)> {
    None
}

/// Always "none": no fake-stack feature.
#[must_use]
pub fn get_current_fake_stack() -> *mut c_void {
    std::ptr::null_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SanitizerOptions;
    use crate::poison::{decode, ShadowState};
    use crate::redzone::read_shadow_byte;
    use serial_test::serial;

    #[test]
    #[serial]
    fn poison_then_unpoison_round_trips_on_aligned_size() {
        let mut shadow_map = ShadowMap::new();
        let addr = 0x5000_0000usize;
        shadow_map.map_shadow(addr, 64);

        unsafe { poison_stack_memory(addr, 16) };
        for offset in [0, 8] {
            assert_eq!(decode(unsafe { read_shadow_byte(addr + offset) }), ShadowState::Poisoned(Some(crate::poison::PoisonKind::Unscoped)));
        }

        unsafe { unpoison_stack_memory(addr, 16) };
        for offset in [0, 8] {
            assert_eq!(decode(unsafe { read_shadow_byte(addr + offset) }), ShadowState::Addressable);
        }
    }

    #[test]
    #[serial]
    fn poison_partial_tail_is_negative_unpoison_partial_tail_is_positive() {
        let mut shadow_map = ShadowMap::new();
        let addr = 0x5000_1000usize;
        shadow_map.map_shadow(addr, 64);

        unsafe { poison_stack_memory(addr, 11) };
        assert_eq!(unsafe { read_shadow_byte(addr + 11) }, -5);

        unsafe { unpoison_stack_memory(addr, 11) };
        assert_eq!(unsafe { read_shadow_byte(addr + 11) }, 3);
    }

    #[test]
    #[serial]
    fn alloca_poison_paints_overrun_band() {
        let mut shadow_map = ShadowMap::new();
        let addr = 0x5000_2000usize;
        shadow_map.map_shadow(addr, 128);

        unsafe { alloca_poison(addr, 24) };
        assert_eq!(
            decode(unsafe { read_shadow_byte(addr + 24) }),
            ShadowState::Poisoned(Some(crate::poison::PoisonKind::AllocaOverrun))
        );
    }

    #[test]
    #[serial]
    fn stack_malloc_and_free_route_through_heap_allocator() {
        let mut shadow_map = ShadowMap::new();
        let mut allocator = InstrumentedAllocator::new(SanitizerOptions::default());
        let p = stack_malloc(&mut allocator, &mut shadow_map, 40, 3);
        assert!(!p.is_null());
        stack_free(&mut allocator, &mut shadow_map, p, 40, 3);
        assert!(allocator.is_quarantined(p));
    }

    #[test]
    fn fake_stack_is_always_none() {
        assert!(addr_is_in_fake_stack(std::ptr::null_mut(), std::ptr::null_mut()).is_none());
        assert!(get_current_fake_stack().is_null());
    }
}
