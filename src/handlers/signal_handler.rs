// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The fatal-signal handler trio (spec §4.5 "Fatal-signal handler").
//!
//! SIGNAL SAFETY: using a `std::sync::Mutex` inside a signal handler is not
//! allowed — a signal delivered to a thread that is already holding the lock
//! (e.g. mid-`init()`/`shutdown()`) would deadlock the handler forever. So,
//! matching the teacher's `collector/crash_handler.rs` (`OLD_HANDLERS`,
//! `RECEIVER`, `CONFIG`: "Using mutexes inside a signal handler is not
//! allowed, so use `AtomicPtr` instead to get atomicity"), every value the
//! hot path reads is a `Box::into_raw`'d pointer behind an `AtomicPtr`, loaded
//! with a single atomic load and never locked. Building the report (unwind →
//! resolve → serialize) allocates, which spec §5/§9 explicitly tolerates for
//! symbolization; the scratch [`BacktraceState`] and output buffer themselves
//! do not allocate on this path.

use crate::config::Context;
use crate::constants::{MAX_THREADS, SIGNAL_INSTALL_THREAD_NAME};
use crate::handlers::atomguard::AtomGuard;
use crate::handlers::saguard::SaGuard;
use crate::report::{Backtrace, ExceptionInfo, FrameRecord, ReportKind, SignalInfo, ThreadRecord};
use crate::signal_utils::{self, AltStack};
use crate::unwind::{self, state::BacktraceState, threads::collect_thread_inventory};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, Signal};
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::OnceLock;

const OBSERVED_SIGNALS: [Signal; 6] = [
    Signal::SIGILL,
    Signal::SIGTRAP,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGBUS,
    Signal::SIGSEGV,
];

struct SignalEntry {
    signo: Signal,
    intercepting: AtomicU64,
    /// Always either `ptr::null_mut()` or a pointer obtained from
    /// `Box::into_raw`. Only `install_all` (store) and `shutdown` (swap +
    /// `Box::from_raw`) ever write it; the hot path only loads and derefs.
    previous: AtomicPtr<SigAction>,
}

struct SharedState {
    context: Context,
    alt_stack: Option<AltStack>,
}

static PROCESS_INTERCEPTING: AtomicU64 = AtomicU64::new(0);
static TABLE: OnceLock<Vec<SignalEntry>> = OnceLock::new();
/// Always either `ptr::null_mut()` or a pointer obtained from
/// `Box::into_raw`, set once by `init` and cleared by `shutdown`.
static SHARED: AtomicPtr<SharedState> = AtomicPtr::new(ptr::null_mut());

fn table() -> &'static Vec<SignalEntry> {
    TABLE.get_or_init(|| {
        OBSERVED_SIGNALS
            .iter()
            .map(|&signo| SignalEntry {
                signo,
                intercepting: AtomicU64::new(0),
                previous: AtomicPtr::new(ptr::null_mut()),
            })
            .collect()
    })
}

/// Installs the alternate stack and the fatal-signal table (spec §4.5
/// "Initialization"). Spawns and joins a short-lived worker thread so that by
/// the time this returns, every observed signal has a handler installed.
pub fn init(context: Context) -> anyhow::Result<()> {
    let alt_stack = AltStack::install(2 * libc::SIGSTKSZ)?;

    signal_utils::block_signal(Signal::SIGQUIT)?;

    let worker = std::thread::Builder::new()
        .name(SIGNAL_INSTALL_THREAD_NAME.to_string())
        .spawn(install_all)?;
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("signal-install worker thread panicked"))??;

    signal_utils::unblock_signal(Signal::SIGQUIT)?;

    let boxed = Box::into_raw(Box::new(SharedState {
        context,
        alt_stack: Some(alt_stack),
    }));
    let old = SHARED.swap(boxed, Ordering::SeqCst);
    if !old.is_null() {
        // Safety: only ever created by a prior `Box::into_raw` here.
        unsafe { drop(Box::from_raw(old)) };
    }
    Ok(())
}

fn install_all() -> anyhow::Result<()> {
    for entry in table() {
        let previous = unsafe {
            signal_utils::install_handler(
                entry.signo,
                SigHandler::SigAction(trampoline),
                SaFlags::SA_ONSTACK,
            )?
        };
        let boxed = Box::into_raw(Box::new(previous));
        let old = entry.previous.swap(boxed, Ordering::SeqCst);
        if !old.is_null() {
            unsafe { drop(Box::from_raw(old)) };
        }
    }
    Ok(())
}

/// Restores every previous disposition and releases the alternate stack
/// (spec §4.5, testable property 7).
pub fn shutdown() -> anyhow::Result<()> {
    for entry in table() {
        let ptr = entry.previous.swap(ptr::null_mut(), Ordering::SeqCst);
        if !ptr.is_null() {
            // Safety: only ever created by `Box::into_raw` in `install_all`.
            let previous = unsafe { Box::from_raw(ptr) };
            unsafe { signal_utils::uninstall_handler(entry.signo, &previous)? };
        }
    }
    let ptr = SHARED.swap(ptr::null_mut(), Ordering::SeqCst);
    if !ptr.is_null() {
        // Safety: only ever created by `Box::into_raw` in `init`.
        let state = unsafe { Box::from_raw(ptr) };
        if let Some(alt_stack) = state.alt_stack {
            alt_stack.release();
        }
    }
    Ok(())
}

extern "C" fn trampoline(signo: i32, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    if PROCESS_INTERCEPTING.load(Ordering::SeqCst) != 0 {
        chain_to_previous(signo, info, ctx);
        return;
    }

    let Ok(_process_guard) = AtomGuard::new(&PROCESS_INTERCEPTING) else {
        chain_to_previous(signo, info, ctx);
        return;
    };

    if let Some(entry) = table().iter().find(|e| e.signo as i32 == signo) {
        let count = entry.intercepting.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            build_and_spill(signo, info, ctx);
        }
        uninstall_self(entry);
        chain_to_previous(signo, info, ctx);
        entry.intercepting.fetch_sub(1, Ordering::SeqCst);
    } else {
        chain_to_previous(signo, info, ctx);
    }
}

/// Restores the previous disposition without clearing the slot (spec §9's
/// resolved open question: `uninstall_handler` must not zero the saved
/// previous disposition, since `shutdown()` still needs to read/free it).
fn uninstall_self(entry: &SignalEntry) {
    let ptr = entry.previous.load(Ordering::SeqCst);
    if ptr.is_null() {
        return;
    }
    // Safety: only ever created by `Box::into_raw` in `install_all`, and kept
    // alive until `shutdown` takes it; never freed on this path.
    let previous = unsafe { &*ptr };
    unsafe {
        let _ = signal_utils::uninstall_handler(entry.signo, previous);
    }
}

fn chain_to_previous(signo: i32, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let Some(entry) = table().iter().find(|e| e.signo as i32 == signo) else {
        return;
    };
    let ptr = entry.previous.load(Ordering::SeqCst);
    if ptr.is_null() {
        unsafe {
            let _ = libc::raise(signo);
        }
        return;
    }
    // Safety: see `uninstall_self`.
    let previous = unsafe { &*ptr };
    match previous.handler() {
        SigHandler::SigDfl => unsafe {
            let _ = libc::raise(signo);
        },
        SigHandler::SigIgn => {}
        SigHandler::Handler(f) => f(signo),
        SigHandler::SigAction(f) => f(signo, info, ctx),
    }
}

fn build_and_spill(signo: i32, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let _sa_guard = SaGuard::new(&[Signal::SIGCHLD, Signal::SIGPIPE]);

    let shared_ptr = SHARED.load(Ordering::SeqCst);
    if shared_ptr.is_null() {
        return;
    }
    // Safety: only ever created by `Box::into_raw` in `init`, and kept alive
    // until `shutdown` takes it; never freed on this path.
    let state = unsafe { &*shared_ptr };

    let siginfo = if info.is_null() {
        None
    } else {
        Some(unsafe { *info })
    };
    let ucontext = ctx as *const libc::ucontext_t;

    let mut bt_state = match siginfo {
        Some(si) if !ucontext.is_null() => unsafe { BacktraceState::with_context(ucontext, si) },
        _ => BacktraceState::without_context(),
    };
    unwind::unwind(&mut bt_state);

    let pid = std::process::id() as i32;
    let tid = crashing_tid();

    let frames: Vec<FrameRecord> = bt_state
        .frames()
        .iter()
        .enumerate()
        .map(|(i, &ip)| FrameRecord::from(&unwind::resolve(i, ip)))
        .collect();

    let mut threads: Vec<ThreadRecord> = collect_thread_inventory(pid, tid)
        .iter()
        .map(|info| {
            let stack = if info.crashed { frames.clone() } else { Vec::new() };
            ThreadRecord::new(info, stack)
        })
        .collect();
    threads.truncate(MAX_THREADS);

    let (code, fault_address) = match siginfo {
        Some(si) => (si.si_code, unsafe { si.si_addr() } as usize),
        None => (-1, 0),
    };
    let cause = signal_utils::describe(signo, code);
    let exception = ExceptionInfo {
        name: "Native exception",
        cause,
        signal_info: Some(SignalInfo {
            signal_name: signal_utils::signal_name(signo),
            signal_code: code,
            fault_address,
        }),
    };

    let registers = if ucontext.is_null() {
        None
    } else {
        unsafe { crate::registers::capture_registers(ucontext) }
    };

    let backtrace = Backtrace::new(
        crate::procfs::process_name(pid),
        cause,
        current_unix_time(),
        pid,
        unsafe { libc::getppid() },
        unsafe { libc::getuid() },
        state.context.build_id.clone(),
        state.context.session_id.clone(),
        exception,
        registers,
        threads,
    );

    let outcome = crate::report::serialize(&backtrace);
    let path = crate::report::spill_path(
        &state.context.reports_dir,
        ReportKind::Crash,
        chrono::Utc::now(),
    );
    let _ = crate::report::spill(&path, &outcome.document);
}

fn crashing_tid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

fn current_unix_time() -> i64 {
    chrono::Utc::now().timestamp()
}
