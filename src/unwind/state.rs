// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-capture scratch that the unwinder writes into. Lives entirely on
//! the stack/preallocated scratch buffer — no heap allocation on the
//! record-frame hot path (spec §3, §5).

use crate::constants::MAX_FRAMES;
use crate::registers;

/// Bounded scratch holding the unwound instruction pointers for one capture.
/// See spec §3 "BacktraceState".
pub struct BacktraceState {
    frames: [usize; MAX_FRAMES],
    frame_count: usize,
    skipped: usize,
    crash_ip: usize,
    /// Present for a fatal-signal capture, absent for a terminate-handler
    /// capture (spec §3: "may be absent for terminate-handler paths").
    ucontext: Option<*const libc::ucontext_t>,
    siginfo: Option<libc::siginfo_t>,
}

// SAFETY: the ucontext/siginfo pointers are only read, never retained past
// the signal handler's stack frame that constructed this state.
unsafe impl Send for BacktraceState {}

impl BacktraceState {
    /// A capture with no machine context — the terminate-handler / ANR
    /// "disabled" path.
    pub fn without_context() -> Self {
        BacktraceState {
            frames: [0; MAX_FRAMES],
            frame_count: 0,
            skipped: 0,
            crash_ip: 0,
            ucontext: None,
            siginfo: None,
        }
    }

    /// A capture anchored to a signal-delivery context.
    ///
    /// SAFETY: `ucontext` must outlive this `BacktraceState` and point at a
    /// live `ucontext_t` as delivered to a `SA_SIGINFO` handler.
    pub unsafe fn with_context(
        ucontext: *const libc::ucontext_t,
        siginfo: libc::siginfo_t,
    ) -> Self {
        let crash_ip = if ucontext.is_null() {
            0
        } else {
            registers::crash_ip(ucontext)
        };
        BacktraceState {
            frames: [0; MAX_FRAMES],
            frame_count: 0,
            skipped: 0,
            crash_ip,
            ucontext: if ucontext.is_null() { None } else { Some(ucontext) },
            siginfo: Some(siginfo),
        }
    }

    pub fn has_context(&self) -> bool {
        self.ucontext.is_some()
    }

    pub fn ucontext(&self) -> Option<*const libc::ucontext_t> {
        self.ucontext
    }

    pub fn siginfo(&self) -> Option<libc::siginfo_t> {
        self.siginfo
    }

    pub fn crash_ip(&self) -> usize {
        self.crash_ip
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.frame_count]
    }

    /// Resets the recorded-frame count to zero, preserving the skipped
    /// counter contribution from frames seen before the reset (spec §4.3:
    /// "when it sees a frame whose IP equals the recorded crash IP ... it
    /// resets the frame count to 0 and records the count of frames skipped
    /// up to that point").
    pub(crate) fn reset_at_crash_ip(&mut self) {
        self.skipped += self.frame_count;
        self.frame_count = 0;
    }

    /// Bounded insertion into the frame ring (spec §4.3 "record_frame").
    /// Returns `false` once the ring is full, which terminates the walk.
    /// Duplicate-of-previous and null-after-first are accepted but not
    /// stored; both increment `skipped` instead.
    pub(crate) fn record_frame(&mut self, ip: usize) -> bool {
        if self.frame_count >= MAX_FRAMES {
            return false;
        }

        if self.frame_count > 0 {
            if ip == 0 {
                self.skipped += 1;
                return true;
            }
            if ip == self.frames[self.frame_count - 1] {
                self.skipped += 1;
                return true;
            }
        }

        self.frames[self.frame_count] = ip;
        self.frame_count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_and_null_frames_are_skipped_not_stored() {
        let mut state = BacktraceState::without_context();
        for ip in [0xA, 0xB, 0xB, 0xC, 0, 0xD] {
            state.record_frame(ip);
        }
        assert_eq!(state.frames(), &[0xA, 0xB, 0xC, 0xD]);
        assert_eq!(state.skipped(), 2);
    }

    #[test]
    fn ring_full_stops_recording() {
        let mut state = BacktraceState::without_context();
        for i in 1..=(MAX_FRAMES + 5) {
            let kept = state.record_frame(i);
            if i > MAX_FRAMES {
                assert!(!kept);
            }
        }
        assert_eq!(state.frame_count(), MAX_FRAMES);
    }

    #[test]
    fn reset_at_crash_ip_folds_into_skipped() {
        let mut state = BacktraceState::without_context();
        state.record_frame(1);
        state.record_frame(2);
        state.record_frame(3);
        state.reset_at_crash_ip();
        assert_eq!(state.frame_count(), 0);
        assert_eq!(state.skipped(), 3);
        state.record_frame(4);
        assert_eq!(state.frames(), &[4]);
    }

    #[test]
    fn without_context_has_no_machine_state() {
        let state = BacktraceState::without_context();
        assert!(!state.has_context());
        assert_eq!(state.crash_ip(), 0);
    }
}
