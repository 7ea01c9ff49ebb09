//! Painting poison bands around a live object: §4.3.
//!
//! Grounded on `libafl_frida::asan::alloc::Allocator::{poison, unpoison}`,
//! generalized from the teacher's fixed 0x00/0xff encoding to the full
//! signed palette in [`crate::poison`], and on the partial-byte trick in
//! `libc/log/asan.c`'s `__asan_poison_redzone`.

use crate::poison::PoisonKind;
use crate::shadow::shadow;

/// Writes `value` to the shadow byte at `shadow(addr)`.
///
/// # Safety
/// `shadow(addr)` must already be backed by a mapped, writable shadow page
/// (see [`crate::shadow::ShadowMap::map_shadow`]).
#[inline]
pub(crate) unsafe fn write_shadow_byte(addr: usize, value: i8) {
    (shadow(addr) as *mut i8).write(value);
}

/// Reads the raw shadow byte for application address `addr`.
///
/// # Safety
/// `shadow(addr)` must already be backed by a mapped shadow page.
#[inline]
pub(crate) unsafe fn read_shadow_byte(addr: usize) -> i8 {
    (shadow(addr) as *const i8).read()
}

/// Writes `len` shadow bytes starting at the shadow address for `addr`, all
/// set to `value`.
///
/// # Safety
/// The shadow range `[shadow(addr), shadow(addr)+len)` must be mapped.
pub(crate) unsafe fn fill_shadow(addr: usize, len: usize, value: i8) {
    if len == 0 {
        return;
    }
    std::slice::from_raw_parts_mut(shadow(addr) as *mut i8, len).fill(value);
}

/// Marks `[addr, addr+size)` fully addressable, writing a partial byte for
/// any trailing fragment shorter than a full 8-byte word. This is the
/// "positive partial" form used when growing an addressable region (object
/// bodies, `unpoison_stack_memory`).
///
/// # Safety
/// The shadow range covering `[addr, addr + round_up(size, 8))` must be mapped.
pub unsafe fn unpoison(addr: usize, size: usize) {
    log::trace!("asan: unpoison(addr={addr:#x}, size={size:#x})");
    fill_shadow(addr, size / 8, 0);
    let remainder = (size % 8) as u8;
    if remainder > 0 {
        write_shadow_byte(addr + (size / 8) * 8, remainder as i8);
    }
}

/// Paints `poison_redzone(addr, size, total_size, kind)` per §4.3: the
/// `[size, total_size)` band around an object becomes poisoned with `kind`,
/// and the 8-byte word straddling `size` gets a partial-addressable byte so
/// bytes `0..size` stay addressable without losing overrun detection past
/// `size`.
///
/// # Safety
/// The shadow range covering `[round_down(addr,8), round_down(addr,8) + round_up(w+total_size,8))`
/// must already be mapped.
pub unsafe fn poison_redzone(addr: usize, size: usize, total_size: usize, kind: PoisonKind) {
    log::trace!("asan: poison_redzone(addr={addr:#x}, size={size:#x}, total_size={total_size:#x}, kind={kind:?})");
    let w = addr % 8;
    let p = addr - w;
    let a = w + size;
    let b = w + total_size;

    let mut cursor = p + a;
    if a % 8 != 0 {
        write_shadow_byte(cursor, (a % 8) as i8);
        cursor += 8 - (a % 8);
    }
    let round_up = |x: usize| (x + 7) / 8 * 8;
    let words = (round_up(b) - round_up(a)) / 8;
    fill_shadow(cursor, words, kind.as_byte());
}
