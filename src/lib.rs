//! In-process shadow-memory address sanitizer runtime.
//!
//! See `SPEC_FULL.md` for the full component design. The module layout
//! mirrors the component table in §2: [`shadow`] and [`poison`] are the pure
//! encoding layer, [`redzone`] paints bands on top of them, [`allocator`]
//! and [`globals`]/[`stack`] are the three lifecycle surfaces that call into
//! it, and [`report`] is the terminating fault path.
//!
//! Grounded on `maxammann-LibAFL`'s `libafl_frida::asan_rt::AsanRuntime`'s
//! `static mut ALLOCATOR_SINGLETON: Option<RefCell<Allocator>>` pattern,
//! generalized to a single [`SanitizerRuntime`] owning both the shadow map
//! and the allocator, since the compiler ABI (§6) needs both from one
//! process-wide handle.

pub mod allocator;
pub mod backing;
pub mod config;
pub mod error;
pub mod globals;
pub mod poison;
pub mod redzone;
pub mod report;
pub mod shadow;
pub mod stack;

use std::cell::RefCell;
use std::ffi::{c_char, c_void};

pub use allocator::{AllocationMetadata, InstrumentedAllocator, Morgue};
pub use config::SanitizerOptions;
pub use error::SanitizerError;
pub use globals::{register_globals, unregister_globals, GlobalDescriptor, SourceLocation};
pub use poison::{decode, describe_access, describe_free, PoisonKind, ShadowState};
pub use shadow::{shadow, ShadowMap, OFFSET};

/// Conservative span of the main thread's stack mapped at `init` time, 8 MiB
/// (the common default `ulimit -s`), rounded to the platform frame size.
const INIT_STACK_SPAN: usize = 8 * 1024 * 1024;

/// Process-wide sanitizer state: the shadow map and the instrumented
/// allocator the compiler-emitted hooks drive (§4.7, §9 "Global mutable
/// state"). Constructed once via [`init`]; a second call is rejected with
/// [`SanitizerError::AlreadyInitialized`] rather than silently replacing it.
pub struct SanitizerRuntime {
    shadow_map: ShadowMap,
    allocator: InstrumentedAllocator,
}

impl SanitizerRuntime {
    fn new(options: SanitizerOptions) -> Self {
        Self {
            shadow_map: ShadowMap::new(),
            allocator: InstrumentedAllocator::new(options),
        }
    }

    /// Maps shadow for the ranges `init` is responsible for pre-provisioning
    /// (§4.7): the initial stack span; for each argv/envp string, the bytes
    /// of the string itself (the pointer arrays are provided by the
    /// platform's C runtime and are not sanitizer-managed); and the
    /// auxiliary vector, an array of `(key, value)` word pairs terminated by
    /// a zero key (`AT_NULL`) per the platform ABI.
    fn map_startup_regions(&mut self, argv: &[*const c_char], envp: &[*const c_char], auxv: &[usize]) {
        let rsp = current_stack_pointer();
        let stack_base = (rsp / INIT_STACK_SPAN) * INIT_STACK_SPAN;
        log::debug!("asan: mapping initial stack span at {stack_base:#x}");
        self.shadow_map.map_shadow(stack_base, INIT_STACK_SPAN);

        for &arg in argv {
            map_c_string(&mut self.shadow_map, arg);
        }
        for &var in envp {
            map_c_string(&mut self.shadow_map, var);
        }
        if !auxv.is_empty() {
            let span = auxv.len() * std::mem::size_of::<usize>();
            log::debug!("asan: mapping auxv ({} entries)", auxv.len());
            self.shadow_map.map_shadow(auxv.as_ptr() as usize, span);
        }
    }

    #[must_use]
    pub fn allocator(&mut self) -> &mut InstrumentedAllocator {
        &mut self.allocator
    }

    #[must_use]
    pub fn shadow_map(&mut self) -> &mut ShadowMap {
        &mut self.shadow_map
    }
}

fn map_c_string(shadow_map: &mut ShadowMap, ptr: *const c_char) {
    if ptr.is_null() {
        return;
    }
    let len = unsafe { libc::strlen(ptr) } + 1;
    shadow_map.map_shadow(ptr as usize, len);
}

#[inline]
fn current_stack_pointer() -> usize {
    let probe = 0u8;
    std::ptr::addr_of!(probe) as usize
}

// Single-threaded process-wide singleton: the compiler-emitted ABI (§6) is
// free functions with no `self`, so the runtime they drive must live
// somewhere reachable without a handle. `RefCell` turns a double-borrow
// (e.g. re-entering `malloc` from inside a `log` backend that itself
// allocates) into a clean panic rather than silent corruption.
static mut RUNTIME: Option<RefCell<SanitizerRuntime>> = None;

/// One-shot setup (§4.7, §9): constructs the [`SanitizerRuntime`], maps
/// shadow for the startup regions (stack, argv, envp, auxv), installs it as
/// the process-wide singleton the ABI entry points below dispatch through,
/// and installs the allocator hooks.
///
/// # Safety
/// Must be called at most once, before any other function in this crate,
/// and before any other thread can observe the ABI entry points.
pub unsafe fn init(
    options: SanitizerOptions,
    argv: &[*const c_char],
    envp: &[*const c_char],
    auxv: &[usize],
) -> Result<(), SanitizerError> {
    if RUNTIME.is_some() {
        return Err(SanitizerError::AlreadyInitialized);
    }
    let mut runtime = SanitizerRuntime::new(options);
    runtime.map_startup_regions(argv, envp, auxv);
    RUNTIME = Some(RefCell::new(runtime));
    install_malloc_hooks();
    log::debug!("asan: runtime initialized");
    Ok(())
}

fn with_runtime<R>(f: impl FnOnce(&mut SanitizerRuntime) -> R) -> R {
    let cell = unsafe { RUNTIME.as_ref() }.expect("asan: runtime not initialized");
    let mut runtime = cell.borrow_mut();
    f(&mut runtime)
}

/// The weak-hook configuration surface described in §9 Design Notes: in the
/// original runtime these are weak symbol globals the uninstrumented libc
/// defaults to and `init` overwrites; here they're a plain function-pointer
/// table, since Rust has no weak-symbol equivalent a library crate can rely
/// on portably.
pub struct AllocatorHooks {
    pub free: unsafe extern "C" fn(*mut c_void),
    pub malloc: unsafe extern "C" fn(usize) -> *mut c_void,
    pub calloc: unsafe extern "C" fn(usize, usize) -> *mut c_void,
    pub valloc: unsafe extern "C" fn(usize) -> *mut c_void,
    pub pvalloc: unsafe extern "C" fn(usize) -> *mut c_void,
    pub realloc: unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void,
    pub memalign: unsafe extern "C" fn(usize, usize) -> *mut c_void,
    pub malloc_usable_size: unsafe extern "C" fn(*mut c_void) -> usize,
}

static mut HOOKS: Option<AllocatorHooks> = None;

unsafe extern "C" fn hook_free(ptr: *mut c_void) {
    free(ptr);
}

unsafe extern "C" fn hook_malloc(size: usize) -> *mut c_void {
    malloc(size)
}

unsafe extern "C" fn hook_calloc(n: usize, m: usize) -> *mut c_void {
    calloc(n, m)
}

unsafe extern "C" fn hook_valloc(size: usize) -> *mut c_void {
    valloc(size)
}

unsafe extern "C" fn hook_pvalloc(size: usize) -> *mut c_void {
    pvalloc(size)
}

unsafe extern "C" fn hook_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    realloc(ptr, size)
}

unsafe extern "C" fn hook_memalign(align: usize, size: usize) -> *mut c_void {
    memalign(align, size)
}

unsafe extern "C" fn hook_malloc_usable_size(ptr: *mut c_void) -> usize {
    malloc_usable_size(ptr)
}

/// `install_malloc_hooks()` (§4.7): overwrites the process's weak allocator
/// hooks so the standard `malloc`/`free`/… family routes into this runtime.
/// Called once from [`init`].
fn install_malloc_hooks() {
    unsafe {
        HOOKS = Some(AllocatorHooks {
            free: hook_free,
            malloc: hook_malloc,
            calloc: hook_calloc,
            valloc: hook_valloc,
            pvalloc: hook_pvalloc,
            realloc: hook_realloc,
            memalign: hook_memalign,
            malloc_usable_size: hook_malloc_usable_size,
        });
    }
    log::debug!("asan: allocator hooks installed");
}

/// The currently-installed allocator hook table, if [`init`] has run.
#[must_use]
pub fn allocator_hooks() -> Option<&'static AllocatorHooks> {
    unsafe { HOOKS.as_ref() }
}

/// `report_load_n(addr, size)` (§6). Never returns.
pub fn report_load_n(addr: usize, size: usize) -> ! {
    report::report_memory_fault(addr, size, "load");
}

/// `report_store_n(addr, size)` (§6). Never returns.
pub fn report_store_n(addr: usize, size: usize) -> ! {
    report::report_memory_fault(addr, size, "store");
}

/// Stand-in for the compiler-emitted probe ahead of an instrumented load or
/// store (§2 "Data flow"); terminates via [`report_load_n`]/[`report_store_n`]
/// if the access isn't fully addressable. See [`report::check_access`].
pub fn check_load(addr: usize, size: usize) {
    report::check_access(addr, size, "load");
}

/// Stand-in for the compiler-emitted probe ahead of an instrumented store.
pub fn check_store(addr: usize, size: usize) {
    report::check_access(addr, size, "store");
}

/// `register_globals(g[], n)` (§6). Panics (rather than propagating
/// [`SanitizerError`]) on a malformed table, since this entry point's ABI
/// shape has no room for a `Result` — the compiler-emitted constructor that
/// calls it cannot do anything with one anyway.
///
/// # Safety
/// `globals` must be valid for the duration of the call.
pub unsafe fn register_globals_abi(globals: &[GlobalDescriptor]) {
    globals::register_globals(globals).expect("asan: malformed global descriptor table");
}

/// `unregister_globals(g[], n)` (§6).
///
/// # Safety
/// `globals` must be valid for the duration of the call.
pub unsafe fn unregister_globals_abi(globals: &[GlobalDescriptor]) {
    globals::unregister_globals(globals).expect("asan: malformed global descriptor table");
}

/// `poison_stack_memory(p, n)` (§6).
///
/// # Safety
/// The shadow range covering `[p, p + round_up(n, 8))` must be mapped.
pub unsafe fn poison_stack_memory(p: usize, n: usize) {
    stack::poison_stack_memory(p, n);
}

/// `unpoison_stack_memory(p, n)` (§6).
///
/// # Safety
/// Same preconditions as [`poison_stack_memory`].
pub unsafe fn unpoison_stack_memory(p: usize, n: usize) {
    stack::unpoison_stack_memory(p, n);
}

/// `alloca_poison(addr, size)` (§6).
///
/// # Safety
/// The shadow range covering `[addr, addr + size + 32)` must be mapped.
pub unsafe fn alloca_poison(addr: usize, size: usize) {
    stack::alloca_poison(addr, size);
}

/// `allocas_unpoison(top, bottom)` (§6).
///
/// # Safety
/// The shadow range covering `[top, bottom)` must be mapped.
pub unsafe fn allocas_unpoison(top: usize, bottom: usize) {
    stack::allocas_unpoison(top, bottom);
}

/// `stack_malloc(size, classid)` (§6), routed through the singleton runtime.
#[must_use]
pub fn stack_malloc(size: usize, classid: i32) -> *mut c_void {
    with_runtime(|runtime| {
        let SanitizerRuntime { shadow_map, allocator } = runtime;
        stack::stack_malloc(allocator, shadow_map, size, classid)
    })
}

/// `stack_free(p, size, classid)` (§6).
pub fn stack_free(ptr: *mut c_void, size: usize, classid: i32) {
    with_runtime(|runtime| {
        let SanitizerRuntime { shadow_map, allocator } = runtime;
        stack::stack_free(allocator, shadow_map, ptr, size, classid);
    });
}

/// `addr_is_in_fake_stack(...)` (§6): always "none".
#[must_use]
pub fn addr_is_in_fake_stack(fake_stack: *mut c_void, addr: *mut c_void) -> Option<(usize, usize)> {
    stack::addr_is_in_fake_stack(fake_stack, addr)
}

/// `get_current_fake_stack()` (§6): always "none".
#[must_use]
pub fn get_current_fake_stack() -> *mut c_void {
    stack::get_current_fake_stack()
}

/// `malloc(size)`, routed through the singleton runtime and the weak-hook
/// surface described in §9 Design Notes.
#[must_use]
pub fn malloc(size: usize) -> *mut c_void {
    with_runtime(|runtime| {
        let SanitizerRuntime { shadow_map, allocator } = runtime;
        allocator.malloc(shadow_map, size)
    })
}

/// `free(p)`.
pub fn free(ptr: *mut c_void) {
    with_runtime(|runtime| {
        let SanitizerRuntime { shadow_map, allocator } = runtime;
        allocator.free(shadow_map, ptr);
    });
}

/// `calloc(n, m)`.
#[must_use]
pub fn calloc(n: usize, m: usize) -> *mut c_void {
    with_runtime(|runtime| {
        let SanitizerRuntime { shadow_map, allocator } = runtime;
        allocator.calloc(shadow_map, n, m)
    })
}

/// `realloc(p, n)`.
#[must_use]
pub fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    with_runtime(|runtime| {
        let SanitizerRuntime { shadow_map, allocator } = runtime;
        allocator.realloc(shadow_map, ptr, size)
    })
}

/// `memalign(align, size)`.
#[must_use]
pub fn memalign(align: usize, size: usize) -> *mut c_void {
    with_runtime(|runtime| {
        let SanitizerRuntime { shadow_map, allocator } = runtime;
        allocator.memalign(shadow_map, align, size)
    })
}

/// `valloc(size)`.
#[must_use]
pub fn valloc(size: usize) -> *mut c_void {
    with_runtime(|runtime| {
        let SanitizerRuntime { shadow_map, allocator } = runtime;
        allocator.valloc(shadow_map, size)
    })
}

/// `pvalloc(size)`.
#[must_use]
pub fn pvalloc(size: usize) -> *mut c_void {
    with_runtime(|runtime| {
        let SanitizerRuntime { shadow_map, allocator } = runtime;
        allocator.pvalloc(shadow_map, size)
    })
}

/// `malloc_usable_size(p)`: a pure shadow scan, no singleton needed (§4.4).
#[must_use]
pub fn malloc_usable_size(ptr: *mut c_void) -> usize {
    InstrumentedAllocator::malloc_usable_size(ptr)
}

/// Ensures the shadow range covering `[addr, addr+size)` is mapped, for
/// callers (e.g. the demo binary, or a compiler pass priming a new mmap'd
/// region) that need to provision shadow ahead of first use.
///
/// # Safety
/// None beyond what [`ShadowMap::map_shadow`] itself requires; callers must
/// not race this against another thread's shadow writes (§5).
pub unsafe fn ensure_shadow_mapped(addr: usize, size: usize) {
    with_runtime(|runtime| runtime.shadow_map.map_shadow(addr, size));
}
