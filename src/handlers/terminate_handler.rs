// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Translation of the "uncaught-language-exception" handler (spec §4.5) onto
//! Rust's closest equivalent: a panic hook. There is no Rust analogue of a
//! C++ terminate handler that lets the runtime rethrow and recover, so this
//! captures the same *data* (no machine context, demangled panic payload)
//! and follows the same shutdown shape (chain to the previous hook, then
//! abort if that hook returns).

use crate::config::Context;
use crate::constants::MAX_THREADS;
use crate::report::{Backtrace, ExceptionInfo, FrameRecord, ReportKind, ThreadRecord};
use crate::unwind::threads::collect_thread_inventory;
use std::panic::PanicHookInfo;
use std::sync::OnceLock;

static CONTEXT: OnceLock<Context> = OnceLock::new();

/// Installs the panic hook (spec §4.5 "Terminate handler", steps 1-4): the
/// previously installed hook is captured and chained after ours runs, and
/// control never returns past this hook (step 5, "unconditionally abort").
pub fn init(context: Context) {
    let _ = CONTEXT.set(context);
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        on_panic(info);
        previous(info);
        std::process::abort();
    }));
}

fn on_panic(info: &PanicHookInfo<'_>) {
    let Some(context) = CONTEXT.get() else {
        return;
    };

    let payload = describe_payload(info);
    log::error!("uncaught panic, building exception report: {payload}");

    let pid = std::process::id() as i32;
    let tid = unsafe { libc::syscall(libc::SYS_gettid) as i32 };

    // No signal-delivery machine context is available here, so the stack is
    // captured via the platform unwinder's unsynchronized full walk instead
    // of the crash-IP-anchored one `unwind::unwind` performs (spec §3: "may
    // be absent for terminate-handler paths").
    let mut addresses = Vec::new();
    backtrace::trace(|frame| {
        addresses.push(frame.ip() as usize);
        addresses.len() < crate::constants::MAX_FRAMES
    });
    let frames: Vec<FrameRecord> = addresses
        .iter()
        .enumerate()
        .map(|(i, &ip)| FrameRecord::from(&crate::unwind::resolve(i, ip)))
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
        name: "Uncaught exception",
        cause: "unhandled panic",
        signal_info: None,
    };

    let backtrace = Backtrace::new(
        crate::procfs::process_name(pid),
        "unhandled panic",
        chrono::Utc::now().timestamp(),
        pid,
        unsafe { libc::getppid() },
        unsafe { libc::getuid() },
        context.build_id.clone(),
        context.session_id.clone(),
        exception,
        None,
        threads,
    );

    let outcome = crate::report::serialize(&backtrace);
    let path = crate::report::spill_path(&context.reports_dir, ReportKind::Exception, chrono::Utc::now());
    let _ = crate::report::spill(&path, &outcome.document);
}

fn describe_payload(info: &PanicHookInfo<'_>) -> String {
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_unwind_observes_the_panic_payload() {
        let result = std::panic::catch_unwind(|| {
            std::panic::panic_any("boom");
        });
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    }
}
