//! Deployment-tunable knobs, additive to the fixed ABI constants in
//! [`crate::shadow`] and [`crate::poison`]. Grounded on
//! `libafl_bolts::cli::FuzzerOptions`/`libafl_frida::FridaOptions`, the
//! teacher's equivalent configuration surface, carried through a `clap`
//! derive for the bundled demo binary the same way `unitfuzzer` parses its
//! own `FuzzerOptions`.

use clap::Parser;

/// Runtime-tunable sanitizer behavior. Unlike the shadow offset or the
/// poison palette, none of these are ABI — they only affect policy
/// (resource limits, diagnostic verbosity), never the wire encoding the
/// compiler pass depends on.
#[derive(Debug, Clone, Parser)]
#[command(name = "asan-rt", about = "Shadow-memory address sanitizer runtime")]
pub struct SanitizerOptions {
    /// Reject (return null) allocation requests larger than this, in bytes.
    #[arg(long, env = "ASAN_RT_MAX_ALLOCATION", default_value_t = 1usize << 32)]
    pub max_allocation: usize,

    /// Panic instead of returning null when `max_allocation` is exceeded.
    #[arg(long, env = "ASAN_RT_MAX_ALLOCATION_PANICS", default_value_t = false)]
    pub max_allocation_panics: bool,

    /// Aggregate cap, in bytes, across all live and quarantined allocations.
    #[arg(long, env = "ASAN_RT_MAX_TOTAL_ALLOCATION", default_value_t = 1usize << 36)]
    pub max_total_allocation: usize,

    /// Capture a backtrace at every allocation and free site, for inclusion
    /// in fault diagnostics. Off by default: it roughly doubles allocator
    /// overhead.
    #[arg(long, env = "ASAN_RT_ALLOCATION_BACKTRACES", default_value_t = false)]
    pub allocation_backtraces: bool,
}

impl Default for SanitizerOptions {
    fn default() -> Self {
        Self {
            max_allocation: 1usize << 32,
            max_allocation_panics: false,
            max_total_allocation: 1usize << 36,
            allocation_backtraces: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive_but_bounded() {
        let opts = SanitizerOptions::default();
        assert!(opts.max_allocation > 0);
        assert!(opts.max_total_allocation >= opts.max_allocation);
        assert!(!opts.max_allocation_panics);
        assert!(!opts.allocation_backtraces);
    }
}
