//! Decodes a shadow byte into a human diagnostic and terminates the process:
//! §4.7, §5 Re-entrancy, §7.
//!
//! Grounded on `libc/log/asan.c`'s `__asan_report_memory_fault`/
//! `__asan_report_deallocate_fault`/`__asan_die`, and on the teacher's use of
//! `backtrace::Backtrace`/`backtrace::resolve` for symbolization
//! (`libafl_frida::asan_rt::AsanRuntime::handle`) in place of the spec's
//! out-of-scope "symbol-table loader".
//!
//! Per §5, this module must not take any lock that allocator operations
//! take — a corrupted allocator could be what caused the fault. It writes
//! directly to stderr rather than going through `log`, and reads the
//! faulting shadow byte directly rather than calling back into
//! [`crate::allocator`].

use std::io::Write;

use crate::poison::{decode, describe_access, describe_free, ShadowState};
use crate::redzone::read_shadow_byte;

/// Exit code for any detected sanitizer fault (§6).
pub const FAULT_EXIT_CODE: i32 = 66;

/// Stands in for the compiler-emitted shadow probe that would normally
/// precede every instrumented load/store (§2 "Data flow"): reads the shadow
/// byte at `addr`, and only calls into [`report_memory_fault`] if the access
/// isn't fully covered by addressable (or sufficiently-partial) bytes.
/// Exposed so a caller without compiler instrumentation — the bundled demo
/// binary, and probe-level tests — can still exercise the fault path.
pub fn check_access(addr: usize, size: usize, access_kind: &'static str) {
    let byte = unsafe { read_shadow_byte(addr) };
    let ok = match decode(byte) {
        ShadowState::Addressable => true,
        ShadowState::Partial(n) => size <= n as usize,
        ShadowState::Poisoned(_) => false,
    };
    if !ok {
        report_memory_fault(addr, size, access_kind);
    }
}

/// `report_load_n`/`report_store_n` (§6): decodes the shadow byte at `addr`
/// and reports a load/store access fault. Never returns.
pub fn report_memory_fault(addr: usize, size: usize, access_kind: &'static str) -> ! {
    let byte = unsafe { read_shadow_byte(addr) };
    let description = describe_access(byte);
    let message = format!(
        "error: {description} {size}-byte {access_kind} at 0x{addr:016x}\n"
    );
    die(&message);
}

/// `report_deallocate_fault` (§4.7): reports an invalid/double free.
pub fn report_deallocate_fault(addr: usize, byte: i8) -> ! {
    let description = describe_free(byte);
    let message = format!("error: {description} {byte} at 0x{addr:016x}\n");
    die(&message);
}

/// Writes `message` to stderr, prints a symbolized backtrace, and exits with
/// [`FAULT_EXIT_CODE`]. Never returns.
fn die(message: &str) -> ! {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_all(message.as_bytes());
    let _ = handle.flush();

    print_backtrace();

    std::process::exit(FAULT_EXIT_CODE);
}

fn print_backtrace() {
    let bt = backtrace::Backtrace::new();
    eprintln!("{bt:?}");
}
