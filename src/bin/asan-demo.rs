//! Manual demo and integration-test subprocess target: §2d, §8 end-to-end
//! scenarios. Each `--scenario` deliberately trips one detectable fault (or,
//! for `calloc-overflow`, deliberately does not) and exits accordingly.
//!
//! Grounded on the teacher's `unitfuzzer` binary for the overall shape
//! (`clap`-parsed options struct, `env_logger::init()` at the top of
//! `main`).

use asan_rt::SanitizerOptions;
use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// `p = malloc(10); p[10] = 1;`
    HeapOverrun,
    /// `p = malloc(8); free(p); free(p);`
    DoubleFree,
    /// `p = malloc(32); free(p); x = p[0];`
    UseAfterFree,
    /// `p = malloc(1000); q = realloc(p, 2000); p[0];`
    UseAfterRelocate,
    /// `calloc(SIZE_MAX/2, 4)` — returns null, no fault.
    CallocOverflow,
    /// `p = malloc(13); for i in 0..13 { p[i] = i; } p[13];`
    OffByOneOverrun,
}

#[derive(Debug, Parser)]
#[command(name = "asan-demo")]
struct Args {
    #[command(flatten)]
    options: SanitizerOptions,

    #[arg(long, value_enum)]
    scenario: Scenario,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    unsafe {
        asan_rt::init(args.options, &[], &[], &[]).expect("asan: init failed");
    }

    match args.scenario {
        Scenario::HeapOverrun => {
            let p = asan_rt::malloc(10) as *mut u8;
            let target = unsafe { p.add(10) };
            asan_rt::check_store(target as usize, 1);
            unsafe { target.write(1) };
        }
        Scenario::DoubleFree => {
            let p = asan_rt::malloc(8);
            asan_rt::free(p);
            asan_rt::free(p);
        }
        Scenario::UseAfterFree => {
            let p = asan_rt::malloc(32) as *mut u8;
            asan_rt::free(p as *mut std::ffi::c_void);
            asan_rt::check_load(p as usize, 1);
            let _x = unsafe { p.read() };
        }
        Scenario::UseAfterRelocate => {
            let p = asan_rt::malloc(1000);
            let q = asan_rt::realloc(p, 2000);
            assert!(!q.is_null());
            asan_rt::check_load(p as usize, 1);
            let _x = unsafe { (p as *const u8).read() };
        }
        Scenario::CallocOverflow => {
            let p = asan_rt::calloc(usize::MAX / 2, 4);
            assert!(p.is_null());
            println!("ok: calloc overflow returned null, no fault");
        }
        Scenario::OffByOneOverrun => {
            let p = asan_rt::malloc(13) as *mut u8;
            for i in 0..13u8 {
                unsafe { p.add(i as usize).write(i) };
            }
            let target = unsafe { p.add(13) };
            asan_rt::check_store(target as usize, 1);
            unsafe { target.write(0) };
        }
    }
}
