// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ANR coordinator (spec §4.5 "ANR coordinator"): detects the host
//! runtime's "Signal Catcher" thread, intercepts the SIGQUIT it uses to
//! request an ANR report, emits this library's own report, then hands
//! SIGQUIT back to that thread via `tgkill` so the runtime's own reporter
//! still runs.

use crate::config::Context;
use crate::constants::{
    ANR_POLL_INTERVAL_MS, ANR_SIGBLK_BIT, ANR_TARGET_THREAD_NAME, ANR_WATCHDOG_THREAD_NAME,
    MAX_THREADS,
};
use crate::procfs;
use crate::report::{Backtrace, ExceptionInfo, FrameRecord, ReportKind, ThreadRecord};
use crate::handlers::saguard::SaGuard;
use crate::signal_utils;
use crate::unwind::{self, state::BacktraceState, threads::collect_thread_inventory};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, Signal};
use std::fs;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

struct Semaphore(*mut libc::sem_t);

// SAFETY: POSIX unnamed semaphores are explicitly designed for cross-thread
// wait/post; the raw pointer is never aliased mutably except through the
// semaphore's own synchronization.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    fn new() -> Option<Self> {
        let ptr = Box::into_raw(Box::new(unsafe { std::mem::zeroed::<libc::sem_t>() }));
        let rc = unsafe { libc::sem_init(ptr, 0, 0) };
        if rc == 0 {
            Some(Semaphore(ptr))
        } else {
            unsafe { drop(Box::from_raw(ptr)) };
            None
        }
    }

    fn wait(&self) {
        unsafe {
            libc::sem_wait(self.0);
        }
    }

    fn post(&self) -> bool {
        unsafe { libc::sem_post(self.0) == 0 }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.0);
            drop(Box::from_raw(self.0));
        }
    }
}

struct AnrState {
    enabled: AtomicBool,
    detected_tid: AtomicI32,
    poll_trigger: AtomicBool,
    sem: Option<Semaphore>,
    /// Always either `ptr::null_mut()` or a pointer from `Box::into_raw`
    /// (spec §5/§9: no `Mutex` on a path a signal handler can reach — see
    /// `signal_handler.rs`'s module doc for the same pattern).
    previous_sigquit: AtomicPtr<SigAction>,
    context: Context,
}

static STATE: OnceLock<AnrState> = OnceLock::new();
static WATCHDOG: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

/// Scans `pid`'s threads for one named "Signal Catcher" whose `SigBlk:` bit
/// 0x1000 is set (spec §4.5 "Detection"). Returns `None` (non-fatal) if no
/// such thread is found.
fn detect_signal_catcher(pid: i32) -> Option<i32> {
    let task_path = procfs::task_path(pid);
    let entries = fs::read_dir(&task_path).ok()?;
    for entry in entries.flatten() {
        let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        let name = procfs::thread_name(pid, tid);
        if !name.starts_with(ANR_TARGET_THREAD_NAME) {
            continue;
        }
        if let Some(mask) = procfs::thread_sigblk(pid, tid) {
            if mask & ANR_SIGBLK_BIT != 0 {
                return Some(tid);
            }
        }
    }
    None
}

/// Initializes the ANR coordinator: detects the target thread (soft-fail),
/// sets up the semaphore/poll notifier, installs the non-chaining SIGQUIT
/// handler, and spawns the watchdog (spec §4.5 "Trigger architecture").
pub fn init(context: Context) -> anyhow::Result<()> {
    let pid = std::process::id() as i32;
    let detected = detect_signal_catcher(pid);
    if detected.is_none() {
        log::warn!("anr: no \"Signal Catcher\" thread detected; ANR reporting disabled");
    }

    let sem = Semaphore::new();
    if sem.is_none() {
        log::warn!("anr: semaphore creation failed, falling back to poll mode");
    }

    let previous = unsafe {
        signal_utils::install_handler(Signal::SIGQUIT, SigHandler::SigAction(on_sigquit), SaFlags::empty())?
    };

    let state = STATE.get_or_init(|| AnrState {
        enabled: AtomicBool::new(true),
        detected_tid: AtomicI32::new(detected.unwrap_or(-1)),
        poll_trigger: AtomicBool::new(false),
        sem,
        previous_sigquit: AtomicPtr::new(Box::into_raw(Box::new(previous))),
        context,
    });

    signal_utils::unblock_signal(Signal::SIGQUIT)?;

    let handle = std::thread::Builder::new()
        .name(ANR_WATCHDOG_THREAD_NAME.to_string())
        .spawn(move || watchdog_loop(state))?;
    *WATCHDOG.lock().unwrap() = Some(handle);

    Ok(())
}

fn watchdog_loop(state: &'static AnrState) {
    loop {
        match &state.sem {
            Some(sem) => sem.wait(),
            None => {
                while !state.poll_trigger.swap(false, Ordering::SeqCst) {
                    if !state.enabled.load(Ordering::SeqCst) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(ANR_POLL_INTERVAL_MS));
                }
            }
        }

        if !state.enabled.load(Ordering::SeqCst) {
            return;
        }

        let target = state.detected_tid.load(Ordering::SeqCst);
        if target >= 0 {
            let pid = std::process::id() as i32;
            unsafe {
                libc::syscall(libc::SYS_tgkill, pid, target, libc::SIGQUIT);
            }
        }
        let _ = signal_utils::unblock_signal(Signal::SIGQUIT);
    }
}

extern "C" fn on_sigquit(_signo: i32, _info: *mut libc::siginfo_t, ctx: *mut std::ffi::c_void) {
    let _ = signal_utils::block_signal(Signal::SIGQUIT);

    let Some(state) = STATE.get() else { return };
    if state.enabled.load(Ordering::SeqCst) {
        build_and_spill(state, ctx as *const libc::ucontext_t);
    }

    state.poll_trigger.store(true, Ordering::SeqCst);
    if let Some(sem) = &state.sem {
        sem.post();
    }
}

fn build_and_spill(state: &AnrState, ucontext: *const libc::ucontext_t) {
    let _sa_guard = SaGuard::new(&[Signal::SIGCHLD, Signal::SIGPIPE]);

    let pid = std::process::id() as i32;
    let tid = unsafe { libc::syscall(libc::SYS_gettid) as i32 };

    let mut bt_state = if ucontext.is_null() {
        BacktraceState::without_context()
    } else {
        let siginfo = unsafe { std::mem::zeroed::<libc::siginfo_t>() };
        unsafe { BacktraceState::with_context(ucontext, siginfo) }
    };
    unwind::unwind(&mut bt_state);

    let frames: Vec<FrameRecord> = bt_state
        .frames()
        .iter()
        .enumerate()
        .map(|(i, &ip)| FrameRecord::from(&unwind::resolve(i, ip)))
        .collect();

    let mut threads: Vec<ThreadRecord> = collect_thread_inventory(pid, tid)
        .iter()
        .map(|t| {
            let stack = if t.crashed { frames.clone() } else { Vec::new() };
            ThreadRecord::new(t, stack)
        })
        .collect();
    threads.truncate(MAX_THREADS);

    let exception = ExceptionInfo {
        name: "Application Not Responding",
        cause: "Terminal quit signal (ANR)",
        signal_info: None,
    };
    let registers = if ucontext.is_null() {
        None
    } else {
        unsafe { crate::registers::capture_registers(ucontext) }
    };

    let backtrace = Backtrace::new(
        procfs::process_name(pid),
        "Terminal quit signal (ANR)",
        chrono::Utc::now().timestamp(),
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
    let path =
        crate::report::spill_path(&state.context.reports_dir, ReportKind::Anr, chrono::Utc::now());
    let _ = crate::report::spill(&path, &outcome.document);
}

/// Cooperative shutdown (spec §4.5 "Shutdown"): disables capture, wakes and
/// joins the watchdog, restores the previous SIGQUIT disposition, and resets
/// the detected thread id.
pub fn shutdown() -> anyhow::Result<()> {
    let Some(state) = STATE.get() else {
        return Ok(());
    };
    state.enabled.store(false, Ordering::SeqCst);
    state.poll_trigger.store(true, Ordering::SeqCst);
    if let Some(sem) = &state.sem {
        sem.post();
    }
    if let Some(handle) = WATCHDOG.lock().unwrap().take() {
        let _ = handle.join();
    }
    let ptr = state.previous_sigquit.swap(ptr::null_mut(), Ordering::SeqCst);
    if !ptr.is_null() {
        // Safety: only ever created by `Box::into_raw` in `init`.
        let previous = unsafe { Box::from_raw(ptr) };
        unsafe { signal_utils::uninstall_handler(Signal::SIGQUIT, &previous)? };
    }
    state.detected_tid.store(-1, Ordering::SeqCst);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_wait_unblocks_after_post() {
        let sem = Semaphore::new().expect("semaphore creation should succeed in tests");
        assert!(sem.post());
        sem.wait();
    }

    #[test]
    fn detect_signal_catcher_is_none_when_absent() {
        // This process (a cargo test binary) has no "Signal Catcher" thread.
        let pid = std::process::id() as i32;
        assert_eq!(detect_signal_catcher(pid), None);
    }
}
