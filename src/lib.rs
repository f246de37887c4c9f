// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Captures native crashes, unhandled panics, and ANR notifications from
//! within a hosted runtime, and spills structured reports to disk for a
//! separate upload pipeline to pick up on the process's next start.
//!
//! The crate is built from five cooperating pieces (module list mirrors
//! them): [`procfs`] (read-only `/proc` queries), [`signal_utils`] (alt-stack
//! / sigaction / human-readable signal descriptions), [`unwind`] (frame
//! walking, symbol resolution, thread inventory), [`report`] (the document
//! model, apostrophe-quoted serializer, and spill-to-disk sink), and
//! [`handlers`] (the fatal-signal handler, the panic-hook "terminate"
//! handler, and the ANR coordinator). [`config`] carries the initialization
//! contract the hosting runtime supplies.
//!
//! Public surface: [`start`], [`stop`], [`dump_stack`], and the
//! self-test hook [`crash_now`].

#![cfg(unix)]

pub mod config;
pub mod constants;
pub mod handlers;
pub mod procfs;
pub mod registers;
pub mod report;
pub mod signal_utils;
pub mod unwind;

use report::{Backtrace, ExceptionInfo, FrameRecord, ThreadRecord};
use std::sync::{Mutex, OnceLock};

pub use config::Context;

/// Guards init/shutdown only; the capture fast path never takes this lock
/// (spec §5 "Shared resources", §9 "Global mutable state"). Per spec §9's
/// resolved open question, this mutex is never destroyed.
static INIT_LOCK: Mutex<bool> = Mutex::new(false);
static ACTIVE_CONTEXT: OnceLock<Context> = OnceLock::new();

/// Installs the fatal-signal handler, the panic-hook terminate handler, and
/// (if `context.anr_monitor_enabled`) the ANR coordinator. Returns `false` on
/// any unrecoverable initialization failure (spec §6, §7 "initialization
/// failure"); partial failures (ANR detection, semaphore creation) are
/// logged and degrade gracefully rather than failing `start`.
pub fn start(context: Context) -> bool {
    let mut started = INIT_LOCK.lock().unwrap();
    if *started {
        log::warn!("start() called while already started; ignoring");
        return false;
    }

    let result: anyhow::Result<()> = (|| {
        handlers::signal_handler::init(context.clone())?;
        handlers::terminate_handler::init(context.clone());
        if context.anr_monitor_enabled {
            if let Err(err) = handlers::anr::init(context.clone()) {
                log::warn!("anr coordinator failed to start, ANR reporting disabled: {err}");
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            let _ = ACTIVE_CONTEXT.set(context);
            *started = true;
            true
        }
        Err(err) => {
            log::error!("native-crash-core failed to start: {err}");
            false
        }
    }
}

/// Cooperative shutdown (spec §4.5 "Shutdown", testable property 7):
/// restores every previous disposition, joins the ANR watchdog, and releases
/// the alternate signal stack. Calling this when not started is a no-op.
pub fn stop() {
    let mut started = INIT_LOCK.lock().unwrap();
    if !*started {
        return;
    }
    if let Err(err) = handlers::anr::shutdown() {
        log::warn!("anr coordinator shutdown failed: {err}");
    }
    if let Err(err) = handlers::signal_handler::shutdown() {
        log::warn!("signal handler shutdown failed: {err}");
    }
    *started = false;
}

/// Builds and returns (without spilling) a report document for the calling
/// thread's current stack, for on-demand diagnostics (spec §6).
pub fn dump_stack() -> String {
    let pid = std::process::id() as i32;
    let tid = unsafe { libc::syscall(libc::SYS_gettid) as i32 };

    let mut addresses = Vec::new();
    backtrace::trace(|frame| {
        addresses.push(frame.ip() as usize);
        addresses.len() < constants::MAX_FRAMES
    });
    let frames: Vec<FrameRecord> = addresses
        .iter()
        .enumerate()
        .map(|(i, &ip)| FrameRecord::from(&unwind::resolve(i, ip)))
        .collect();

    let mut threads: Vec<ThreadRecord> = unwind::collect_thread_inventory(pid, tid)
        .iter()
        .map(|t| {
            let stack = if t.crashed { frames.clone() } else { Vec::new() };
            ThreadRecord::new(t, stack)
        })
        .collect();
    threads.truncate(constants::MAX_THREADS);

    let exception = ExceptionInfo {
        name: "Diagnostic dump",
        cause: "dump_stack requested",
        signal_info: None,
    };
    let (build_id, session_id) = ACTIVE_CONTEXT
        .get()
        .map(|c| (c.build_id.clone(), c.session_id.clone()))
        .unwrap_or_default();

    let backtrace = Backtrace::new(
        procfs::process_name(pid),
        "dump_stack requested",
        chrono::Utc::now().timestamp(),
        pid,
        unsafe { libc::getppid() },
        unsafe { libc::getuid() },
        build_id,
        session_id,
        exception,
        None,
        threads,
    );

    let outcome = report::serialize(&backtrace);
    let without_nul = &outcome.document[..outcome.document.len() - 1];
    String::from_utf8_lossy(without_nul).into_owned()
}

/// Failure-injection hook for the hosting runtime's self-tests (spec §6):
/// deliberately triggers a SIGSEGV so the fatal-signal path can be exercised
/// end-to-end. `cause` is logged before the fault for correlation.
pub fn crash_now(cause: &str) {
    log::warn!("crash_now invoked by self-test: {cause}");
    unsafe {
        let p: *mut i32 = std::ptr::null_mut();
        std::ptr::write_volatile(p, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_stack_produces_valid_json_with_this_pid() {
        let text = dump_stack();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["backtrace"]["pid"], std::process::id());
    }
}
