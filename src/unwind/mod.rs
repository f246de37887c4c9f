// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack walking (spec §4.3). The walk is driven by `backtrace`'s
//! unsynchronized frame iterator — calling it from inside a signal handler on
//! the interrupted thread's own stack yields frames starting at the signal
//! trampoline and working back through the crash, which is exactly the shape
//! spec §4.3's crash-IP-trimming algorithm expects.

pub mod frame;
pub mod state;
pub mod threads;

pub use frame::{resolve, StackFrame};
pub use state::BacktraceState;
pub use threads::{collect_thread_inventory, ThreadInfo, ThreadState};

/// Walks frames for the interrupted machine context carried by `state`,
/// recording up to [`crate::constants::MAX_FRAMES`] into it.
///
/// Returns `false` (recording zero frames) when `state` carries no machine
/// context — the terminate-handler / context-absent path (spec §4.3
/// precondition).
///
/// SIGNAL SAFETY: `backtrace`'s frame walk and this function's own logic do
/// not allocate; the crate's symbol *resolution* step (invoked later, not
/// here) is the part that may allocate (spec §5, §9).
///
/// SAFETY: `backtrace::trace_unsynchronized` is not reentrant and must not be
/// called concurrently with another crash-handling function on this or any
/// other thread; the per-signal/process-wide intercepting counters the
/// handler trio holds around `unwind()` guarantee that.
pub fn unwind(state: &mut BacktraceState) -> bool {
    if !state.has_context() {
        return false;
    }

    let crash_ip = state.crash_ip();
    let mut seen_crash_ip = false;

    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let mut ip = frame.ip() as usize;

            if !seen_crash_ip && ip == crash_ip {
                // True top of the user frame stack: everything before this was a
                // signal-trampoline frame, so fold it into `skipped` and restart
                // recording from here (spec §4.3).
                seen_crash_ip = true;
                state.reset_at_crash_ip();
            } else if seen_crash_ip && ip > 0 {
                #[cfg(target_arch = "aarch64")]
                {
                    // Matches the offsets Android's own tooling reports for
                    // AArch64; the adjustment is a fixed 32-bit instruction width.
                    ip -= std::mem::size_of::<u32>();
                }
            }

            #[cfg(all(target_arch = "arm", not(target_arch = "aarch64")))]
            {
                // Clear the Thumb bit before recording (spec §4.3).
                ip &= !1usize;
            }

            state.record_frame(ip)
        });
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwind_without_context_records_nothing() {
        let mut state = BacktraceState::without_context();
        assert!(!unwind(&mut state));
        assert_eq!(state.frame_count(), 0);
    }
}
