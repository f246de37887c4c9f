// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thin wrappers over `sigaltstack`/`sigprocmask`/`sigaction`, plus the
//! (signal, code) → human description table required by spec §4.2.
//!
//! PRECONDITIONS: callers own the returned [`AltStack`]/[`SigAction`] values
//! and are responsible for their lifetime.
//! SAFETY: installing/uninstalling handlers is not reentrant; callers must
//! serialize calls (the handler trio does this via the process-wide mutex).

#![cfg(unix)]

use libc::{c_void, mmap, sigaltstack, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ,
    PROT_WRITE, SIGSTKSZ};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::ptr;

/// Owns the memory backing an alternate signal stack. The caller releases it
/// at shutdown by dropping (or explicitly calling [`AltStack::release`]).
pub struct AltStack {
    base: *mut c_void,
    mapped_len: usize,
}

// Safety: the pointer is only ever touched by munmap in `release`, which the
// owner calls from a single thread during shutdown.
unsafe impl Send for AltStack {}

impl AltStack {
    /// Allocates a zero-initialized alternate signal stack of `size` bytes
    /// (plus one guard page) and installs it for the current thread.
    pub fn install(size: usize) -> anyhow::Result<Self> {
        let page = page_size();
        let mapped_len = size + page;
        let base = unsafe {
            mmap(
                ptr::null_mut(),
                mapped_len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        anyhow::ensure!(base != MAP_FAILED, "failed to allocate alternate signal stack");

        // Inspired by https://github.com/rust-lang/rust/pull/69969/files: a
        // no-access guard page at the low end catches a stack overflow while
        // already handling a signal, rather than silently corrupting memory.
        let guard_rc = unsafe { libc::mprotect(base, page, PROT_NONE) };
        if guard_rc != 0 {
            unsafe { libc::munmap(base, mapped_len) };
            anyhow::bail!("failed to set up alternate-stack guard page");
        }

        let usable = unsafe { base.add(page) };
        let stack = libc::stack_t {
            ss_sp: usable,
            ss_flags: 0,
            ss_size: size.max(SIGSTKSZ),
        };
        let rc = unsafe { sigaltstack(&stack, ptr::null_mut()) };
        if rc != 0 {
            unsafe { libc::munmap(base, mapped_len) };
            anyhow::bail!("sigaltstack() failed: {rc}");
        }

        Ok(AltStack { base, mapped_len })
    }

    /// Unmaps the backing memory. Only safe to call once all signal handlers
    /// that might run on this stack have been uninstalled.
    pub fn release(self) {
        // Drop does the work; this method exists so callers can name the
        // intent explicitly at a shutdown call site.
        drop(self);
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.mapped_len);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let rc = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if rc <= 0 {
        4096
    } else {
        rc as usize
    }
}

/// Blocks `signo` on the calling thread.
pub fn block_signal(signo: Signal) -> anyhow::Result<()> {
    let mut set = SigSet::empty();
    set.add(signo);
    signal::pthread_sigmask(signal::SigmaskHow::SIG_BLOCK, Some(&set), None)?;
    Ok(())
}

/// Unblocks `signo` on the calling thread.
pub fn unblock_signal(signo: Signal) -> anyhow::Result<()> {
    let mut set = SigSet::empty();
    set.add(signo);
    signal::pthread_sigmask(signal::SigmaskHow::SIG_UNBLOCK, Some(&set), None)?;
    Ok(())
}

/// Installs `action` with `SA_SIGINFO | extra_flags`, returning the
/// previously installed disposition so the caller can chain to it or restore
/// it later.
///
/// SAFETY: `action` must be safe to invoke from within a signal handler for
/// as long as it remains installed.
pub unsafe fn install_handler(
    signo: Signal,
    action: SigHandler,
    extra_flags: SaFlags,
) -> anyhow::Result<SigAction> {
    let sig_action = SigAction::new(action, SaFlags::SA_SIGINFO | extra_flags, SigSet::empty());
    let previous = signal::sigaction(signo, &sig_action)?;
    Ok(previous)
}

/// Restores a disposition captured by [`install_handler`].
///
/// SAFETY: `previous` must have come from a prior `sigaction` call for the
/// same `signo`.
pub unsafe fn uninstall_handler(signo: Signal, previous: &SigAction) -> anyhow::Result<()> {
    signal::sigaction(signo, previous)?;
    Ok(())
}

/// siginfo `si_code` origin for `tgkill`/`tkill`-raised signals. Overrides
/// the per-signal table regardless of which signal carries it (spec §4.2).
const SI_TKILL: i32 = -6;

mod codes {
    pub mod ill {
        pub const ILLOPC: i32 = 1;
        pub const ILLOPN: i32 = 2;
        pub const ILLADR: i32 = 3;
        pub const ILLTRP: i32 = 4;
        pub const PRVOPC: i32 = 5;
        pub const PRVREG: i32 = 6;
        pub const COPROC: i32 = 7;
        pub const BADSTK: i32 = 8;
    }
    pub mod segv {
        pub const MAPERR: i32 = 1;
        pub const ACCERR: i32 = 2;
    }
    pub mod bus {
        pub const ADRALN: i32 = 1;
        pub const ADRERR: i32 = 2;
        pub const OBJERR: i32 = 3;
    }
    pub mod trap {
        pub const BRKPT: i32 = 1;
        pub const TRACE: i32 = 2;
    }
    pub mod fpe {
        pub const INTDIV: i32 = 1;
        pub const INTOVF: i32 = 2;
        pub const FLTDIV: i32 = 3;
        pub const FLTOVF: i32 = 4;
        pub const FLTUND: i32 = 5;
        pub const FLTRES: i32 = 6;
        pub const FLTINV: i32 = 7;
        pub const FLTSUB: i32 = 8;
    }
}

/// The bare signal name, e.g. `"SIGSEGV"`. Used whenever `code` is the
/// sentinel `-1`, and as the `signalInfo.signalName` field of a report.
pub fn signal_name(signo: i32) -> &'static str {
    match signo {
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGBUS => "SIGBUS",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGINT => "SIGINT",
        libc::SIGKILL => "SIGKILL",
        _ => "UNKNOWN",
    }
}

/// Human-readable description for a `(signal, code)` pair (spec §4.2). When
/// `code` is `-1` this is just the signal name; the tkill origin code
/// (`-6`) always maps to `"SIG_TKILL"`, regardless of signal.
pub fn describe(signo: i32, code: i32) -> &'static str {
    if code == -1 {
        return signal_name(signo);
    }
    if code == SI_TKILL {
        return "SIG_TKILL";
    }
    match signo {
        libc::SIGILL => match code {
            codes::ill::ILLOPC => "Illegal opcode",
            codes::ill::ILLOPN => "Illegal operand",
            codes::ill::ILLADR => "Illegal addressing mode",
            codes::ill::ILLTRP => "Illegal trap",
            codes::ill::PRVOPC => "Privileged opcode",
            codes::ill::PRVREG => "Privileged register",
            codes::ill::COPROC => "Coprocessor error",
            codes::ill::BADSTK => "Internal stack error",
            _ => "Illegal operation",
        },
        libc::SIGTRAP => match code {
            codes::trap::BRKPT => "Process breakpoint",
            codes::trap::TRACE => "Process trace trap",
            _ => "Trap",
        },
        libc::SIGABRT => "Process abort signal",
        libc::SIGSEGV => match code {
            codes::segv::MAPERR => "Address not mapped to object",
            codes::segv::ACCERR => "Invalid permissions for mapped object",
            _ => "Segmentation violation",
        },
        libc::SIGFPE => match code {
            codes::fpe::INTDIV => "Integer divide by zero",
            codes::fpe::INTOVF => "Integer overflow",
            codes::fpe::FLTDIV => "Floating-point divide by zero",
            codes::fpe::FLTOVF => "Floating-point overflow",
            codes::fpe::FLTUND => "Floating-point underflow",
            codes::fpe::FLTRES => "Floating-point inexact result",
            codes::fpe::FLTINV => "Invalid floating-point operation",
            codes::fpe::FLTSUB => "Subscript out of range",
            _ => "Floating-point exception",
        },
        libc::SIGBUS => match code {
            codes::bus::ADRALN => "Invalid address alignment",
            codes::bus::ADRERR => "Nonexistent physical address",
            codes::bus::OBJERR => "Object-specific hardware error",
            _ => "Bus error",
        },
        libc::SIGQUIT => "Terminal quit signal (ANR)",
        _ => signal_name(signo),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_sentinel_code_is_bare_name() {
        assert_eq!(describe(libc::SIGSEGV, -1), "SIGSEGV");
        assert_eq!(describe(libc::SIGFPE, -1), "SIGFPE");
    }

    #[test]
    fn describe_tkill_overrides_any_signal() {
        assert_eq!(describe(libc::SIGSEGV, SI_TKILL), "SIG_TKILL");
        assert_eq!(describe(libc::SIGQUIT, SI_TKILL), "SIG_TKILL");
    }

    #[test]
    fn describe_known_subcodes() {
        assert_eq!(describe(libc::SIGSEGV, codes::segv::MAPERR), "Address not mapped to object");
        assert_eq!(
            describe(libc::SIGSEGV, codes::segv::ACCERR),
            "Invalid permissions for mapped object"
        );
        assert_eq!(describe(libc::SIGFPE, codes::fpe::INTDIV), "Integer divide by zero");
        assert_eq!(describe(libc::SIGBUS, codes::bus::ADRALN), "Invalid address alignment");
        assert_eq!(describe(libc::SIGTRAP, codes::trap::BRKPT), "Process breakpoint");
    }

    #[test]
    fn block_and_unblock_roundtrip() {
        block_signal(Signal::SIGUSR1).unwrap();
        unblock_signal(Signal::SIGUSR1).unwrap();
    }

    #[test]
    fn install_and_uninstall_roundtrip() {
        extern "C" fn noop(_: i32) {}
        unsafe {
            let previous =
                install_handler(Signal::SIGUSR2, SigHandler::Handler(noop), SaFlags::empty())
                    .unwrap();
            uninstall_handler(Signal::SIGUSR2, &previous).unwrap();
        }
    }
}
