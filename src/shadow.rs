//! The shadow address space: `shadow(a) = (a >> 3) + OFFSET`, and the lazy
//! page-provisioning routine that keeps the shadow pages backing a given
//! application range actually mapped.
//!
//! Grounded on `libafl_frida::asan::alloc::Allocator::map_shadow_for_region`,
//! generalized from that struct's dynamically-probed `shadow_bit` to the
//! fixed ABI offset this spec mandates (§6), and from raw `mmap`/`nix` calls
//! to the `mmap-rs` crate the teacher also uses for its `MmapMut` shadow
//! backing.

use rangemap::RangeSet;

/// The standard sanitizer shadow offset. External ABI (§6): the compiler
/// instrumentation pass hard-codes this same constant.
pub const OFFSET: usize = 0x7fff_8000;

/// `shadow(a) = (a >> 3) + OFFSET`. Pure, no bounds check.
#[inline]
#[must_use]
pub const fn shadow(addr: usize) -> usize {
    (addr >> 3) + OFFSET
}

/// Tracks which shadow page-frames have been mapped, and lazily provisions
/// new ones on demand.
pub struct ShadowMap {
    page_size: usize,
    mapped: RangeSet<usize>,
    // Keeps the backing mappings alive for the process lifetime; the shadow
    // region is never unmapped once provisioned (mirrors the teacher, which
    // never releases `self.mappings` entries for shadow pages either).
    regions: Vec<mmap_rs::MmapMut>,
}

impl ShadowMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            page_size: mmap_rs::MmapOptions::page_size(),
            mapped: RangeSet::new(),
            regions: Vec::new(),
        }
    }

    #[inline]
    fn round_down(&self, value: usize) -> usize {
        (value / self.page_size) * self.page_size
    }

    #[inline]
    fn round_up(&self, value: usize) -> usize {
        self.round_down(value + self.page_size - 1)
    }

    /// Ensures shadow pages covering the application range `[addr, addr+size)`
    /// are mapped, requesting fresh anonymous read-write pages for any gap.
    /// Idempotent: already-mapped frames are a no-op. Aborts the process on
    /// mapping failure (§4.1 Failure).
    pub fn map_shadow(&mut self, addr: usize, size: usize) {
        if size == 0 {
            return;
        }
        let shadow_start = self.round_down(shadow(addr));
        let shadow_end = self.round_up(shadow(addr + size - 1) + 1);

        let gaps: Vec<_> = self.mapped.gaps(&(shadow_start..shadow_end)).collect();
        for gap in gaps {
            log::debug!(
                "asan: mapping shadow frame 0x{:x}..0x{:x}",
                gap.start,
                gap.end
            );
            let mapping = unsafe {
                mmap_rs::MmapOptions::new(gap.end - gap.start)
                    .expect("shadow frame size must be representable")
                    .with_address(gap.start)
                    .map_mut()
            };
            match mapping {
                Ok(m) => self.regions.push(m),
                Err(err) => {
                    log::error!("asan: failed to map shadow page at 0x{:x}: {err}", gap.start);
                    std::process::abort();
                }
            }
        }
        self.mapped.insert(shadow_start..shadow_end);
    }

    /// True if every shadow frame covering `[addr, addr+size)` has already
    /// been provisioned.
    #[must_use]
    pub fn is_mapped(&self, addr: usize, size: usize) -> bool {
        if size == 0 {
            return true;
        }
        let shadow_start = self.round_down(shadow(addr));
        let shadow_end = self.round_up(shadow(addr + size - 1) + 1);
        self.mapped.gaps(&(shadow_start..shadow_end)).next().is_none()
    }
}

impl Default for ShadowMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_formula() {
        assert_eq!(shadow(0), OFFSET);
        assert_eq!(shadow(8), OFFSET + 1);
        assert_eq!(shadow(16), OFFSET + 2);
    }

    #[test]
    fn map_is_idempotent_and_lazy() {
        let mut map = ShadowMap::new();
        assert!(!map.is_mapped(0x1000_0000, 64));
        map.map_shadow(0x1000_0000, 64);
        assert!(map.is_mapped(0x1000_0000, 64));
        // Mapping again must not panic or double-insert.
        map.map_shadow(0x1000_0000, 64);
        assert!(map.is_mapped(0x1000_0000, 64));
    }
}
