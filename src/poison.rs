//! Shadow-byte encoding: addressability of an 8-byte application word packed
//! into a single signed byte.
//!
//! The palette is external ABI shared with the compiler instrumentation pass
//! (see `crate::shadow` for the offset/scale it is paired with). Values are
//! the well-known LLVM compiler-rt/AddressSanitizer magic bytes, reused here
//! verbatim so third-party instrumentation targeting real ASan shadow memory
//! keeps working against this runtime. Two kinds (`HeapRelocated`,
//! `GlobalUnregistered`) have no dedicated byte in the upstream palette; we
//! assign them unused bytes from the same family.

use std::fmt;

/// A poisoned shadow byte's kind, i.e. *why* the covered word is unaddressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum PoisonKind {
    /// Freed heap word (use-after-free zone). `kAsanHeapFreeMagic`.
    HeapFree = -3,
    /// Freed by realloc (use-after-relocate). Crate-local extension.
    HeapRelocated = -2,
    /// Heap left redzone. `kAsanHeapLeftRedzoneMagic`.
    HeapUnderrun = -6,
    /// Heap right redzone. `kAsanHeapRightRedzoneMagic`.
    HeapOverrun = -5,
    /// Compiler-emitted global redzone. `kAsanGlobalRedzoneMagic`.
    GlobalOverrun = -7,
    /// Global whose registration was withdrawn. Crate-local extension.
    GlobalUnregistered = -16,
    /// Freed fake-stack slot. `kAsanStackAfterReturnMagic`.
    StackFree = -11,
    /// Stack allocation left redzone. `kAsanStackLeftRedzoneMagic`.
    StackUnderrun = -15,
    /// Stack allocation right redzone. `kAsanStackRightRedzoneMagic`.
    StackOverrun = -13,
    /// Dynamic alloca redzone. `kAsanAllocaLeftMagic`.
    AllocaOverrun = -54,
    /// Stack slot currently out of lexical scope. `kAsanStackUseAfterScopeMagic`.
    Unscoped = -8,
}

impl PoisonKind {
    /// All kinds, for table-driven tests and the fixed lookup table below.
    pub const ALL: [PoisonKind; 11] = [
        PoisonKind::HeapFree,
        PoisonKind::HeapRelocated,
        PoisonKind::HeapUnderrun,
        PoisonKind::HeapOverrun,
        PoisonKind::GlobalOverrun,
        PoisonKind::GlobalUnregistered,
        PoisonKind::StackFree,
        PoisonKind::StackUnderrun,
        PoisonKind::StackOverrun,
        PoisonKind::AllocaOverrun,
        PoisonKind::Unscoped,
    ];

    #[must_use]
    pub const fn as_byte(self) -> i8 {
        self as i8
    }

    /// Looks up a kind by its raw byte value. Returns `None` for `byte >= 0`
    /// or for a negative value outside the fixed table (treated as generic
    /// "poisoned" by callers that only need a description, per §4.2).
    #[must_use]
    pub fn from_byte(byte: i8) -> Option<PoisonKind> {
        Self::ALL.into_iter().find(|k| k.as_byte() == byte)
    }

    /// Human description used when diagnosing a faulting *load/store*.
    #[must_use]
    pub const fn access_description(self) -> &'static str {
        match self {
            PoisonKind::HeapFree => "heap use after free",
            PoisonKind::HeapRelocated => "heap use after relocate",
            PoisonKind::HeapUnderrun => "heap underrun",
            PoisonKind::HeapOverrun => "heap overrun",
            PoisonKind::GlobalOverrun => "global overrun",
            PoisonKind::GlobalUnregistered => "global unregistered",
            PoisonKind::StackFree => "stack use after release",
            PoisonKind::StackUnderrun => "stack underflow",
            PoisonKind::StackOverrun => "stack overflow",
            PoisonKind::AllocaOverrun => "alloca overflow",
            PoisonKind::Unscoped => "unscoped",
        }
    }

    /// Human description used when diagnosing a faulting *deallocation*.
    #[must_use]
    pub const fn free_description(self) -> &'static str {
        match self {
            PoisonKind::HeapFree => "heap double free",
            PoisonKind::HeapRelocated => "free after relocate",
            PoisonKind::StackFree => "stack double free",
            _ => "invalid pointer",
        }
    }
}

impl fmt::Display for PoisonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.access_description())
    }
}

/// The decoded meaning of a single shadow byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    /// All 8 bytes of the covered word are addressable.
    Addressable,
    /// Only the first `n` bytes (1..=7) of the covered word are addressable.
    Partial(u8),
    /// The entire word is poisoned, tagged with a kind. `None` if the byte
    /// was negative but not one of the known kinds.
    Poisoned(Option<PoisonKind>),
}

/// Decodes a raw shadow byte per §4.2.
#[must_use]
pub fn decode(byte: i8) -> ShadowState {
    if byte == 0 {
        ShadowState::Addressable
    } else if byte > 0 && byte < 8 {
        ShadowState::Partial(byte as u8)
    } else {
        ShadowState::Poisoned(PoisonKind::from_byte(byte))
    }
}

/// Describes a byte for the *access* (load/store) fault path, defaulting to
/// "poisoned" for negative values the fixed table doesn't name, matching the
/// original runtime's `default: return "poisoned"`.
#[must_use]
pub fn describe_access(byte: i8) -> &'static str {
    match decode(byte) {
        ShadowState::Poisoned(Some(kind)) => kind.access_description(),
        _ => "poisoned",
    }
}

/// Describes a byte for the *deallocation* fault path, defaulting to
/// "invalid pointer" exactly like the original runtime.
#[must_use]
pub fn describe_free(byte: i8) -> &'static str {
    match PoisonKind::from_byte(byte) {
        Some(kind) => kind.free_description(),
        None => "invalid pointer",
    }
}
