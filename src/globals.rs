//! Global-variable redzone lifecycle: §4.5.
//!
//! Grounded on `libc/log/asan.c`'s `__asan_register_globals`/
//! `__asan_unregister_globals`, generalized to the typed
//! [`crate::poison::PoisonKind`] palette and to a `Result`-returning
//! validation pass (§2b) the C original has no room for.

use crate::backing::round_up;
use crate::error::SanitizerError;
use crate::poison::PoisonKind;
use crate::redzone::{fill_shadow, poison_redzone};

/// External ABI shape shared with the compiler instrumentation pass (§6):
/// `(addr, size, size_with_redzone, name, module_name, has_cxx_init,
/// location, odr_indicator)`.
#[derive(Debug, Clone)]
pub struct GlobalDescriptor {
    pub addr: usize,
    pub size: usize,
    pub size_with_redzone: usize,
    pub name: String,
    pub module_name: String,
    pub has_cxx_init: bool,
    pub location: Option<SourceLocation>,
    /// ODR-violation detection is a non-goal (§1); retained only so the ABI
    /// shape round-trips through the compiler pass unchanged.
    pub odr_indicator: usize,
}

#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub filename: String,
    pub line: u32,
    pub column: u32,
}

fn validate(global: &GlobalDescriptor) -> Result<(), SanitizerError> {
    if global.size_with_redzone < global.size {
        return Err(SanitizerError::MalformedGlobal {
            name: global.name.clone(),
            size: global.size,
            size_with_redzone: global.size_with_redzone,
        });
    }
    Ok(())
}

/// `register_globals(g[])` (§4.5): paints the right redzone past `size` for
/// each global. Left-side redzones are the compiler's responsibility (it
/// arranges adjacent globals so the padding before one global is the
/// previous global's right redzone).
///
/// # Safety
/// Every global's shadow range `[shadow(addr), shadow(addr+size_with_redzone))`
/// must already be mapped (done once at [`crate::SanitizerRuntime::init`]
/// time for the program image).
pub unsafe fn register_globals(globals: &[GlobalDescriptor]) -> Result<(), SanitizerError> {
    log::trace!("asan: register_globals({} entries)", globals.len());
    for global in globals {
        validate(global)?;
        poison_redzone(
            global.addr,
            global.size,
            global.size_with_redzone,
            PoisonKind::GlobalOverrun,
        );
    }
    Ok(())
}

/// `unregister_globals(g[])` (§4.5): reclaims the 8-byte-aligned inner span
/// of each global with `GlobalUnregistered`, leaving fractional edges alone.
///
/// # Safety
/// Same preconditions as [`register_globals`].
pub unsafe fn unregister_globals(globals: &[GlobalDescriptor]) -> Result<(), SanitizerError> {
    log::trace!("asan: unregister_globals({} entries)", globals.len());
    for global in globals {
        validate(global)?;
        let a = round_up(global.addr, 8);
        let b = (global.addr + global.size_with_redzone) & !7usize;
        if b > a {
            fill_shadow(a, (b - a) / 8, PoisonKind::GlobalUnregistered.as_byte());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poison::{decode, ShadowState};
    use crate::redzone::read_shadow_byte;
    use crate::shadow::ShadowMap;
    use serial_test::serial;

    fn global(addr: usize, size: usize, size_with_redzone: usize) -> GlobalDescriptor {
        GlobalDescriptor {
            addr,
            size,
            size_with_redzone,
            name: "g".into(),
            module_name: "m".into(),
            has_cxx_init: false,
            location: None,
            odr_indicator: 0,
        }
    }

    #[test]
    #[serial]
    fn register_rejects_malformed_sizes() {
        let g = global(0x4000_0000, 64, 32);
        let err = unsafe { register_globals(std::slice::from_ref(&g)) }.unwrap_err();
        assert!(matches!(err, SanitizerError::MalformedGlobal { .. }));
    }

    #[test]
    #[serial]
    fn p7_unregister_register_unregister_is_idempotent() {
        let mut shadow_map = ShadowMap::new();
        let addr = 0x4100_0000usize;
        shadow_map.map_shadow(addr, 128);
        let g = global(addr, 40, 64);

        unsafe { unregister_globals(std::slice::from_ref(&g)) }.unwrap();
        let once: Vec<i8> = (0..64).step_by(8).map(|o| unsafe { read_shadow_byte(addr + o) }).collect();

        unsafe { register_globals(std::slice::from_ref(&g)) }.unwrap();
        unsafe { unregister_globals(std::slice::from_ref(&g)) }.unwrap();
        let twice: Vec<i8> = (0..64).step_by(8).map(|o| unsafe { read_shadow_byte(addr + o) }).collect();

        assert_eq!(once, twice);
    }

    #[test]
    #[serial]
    fn register_paints_overrun_past_size() {
        let mut shadow_map = ShadowMap::new();
        let addr = 0x4200_0000usize;
        shadow_map.map_shadow(addr, 64);
        let g = global(addr, 20, 36);

        unsafe { register_globals(std::slice::from_ref(&g)) }.unwrap();
        assert_eq!(
            decode(unsafe { read_shadow_byte(addr + 24) }),
            ShadowState::Poisoned(Some(crate::poison::PoisonKind::GlobalOverrun))
        );
    }
}
