// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Maximum number of frames recorded per captured stack (spec §3, §6).
pub const MAX_FRAMES: usize = 100;

/// Maximum number of threads enumerated into a single report (spec §3, §6).
pub const MAX_THREADS: usize = 100;

/// Maximum serialized document size, in bytes. Reports are truncated and
/// null-terminated at this boundary (spec §3, §4.4).
pub const MAX_REPORT_BYTES: usize = 1024 * 1024;

/// Filename prefix for a fatal-signal capture (spec §6).
pub const PREFIX_CRASH: &str = "crash-";
/// Filename prefix for an uncaught-exception capture (spec §6).
pub const PREFIX_EXCEPTION: &str = "ex-";
/// Filename prefix for an ANR capture (spec §6).
pub const PREFIX_ANR: &str = "anr-";

/// Name of the worker thread that installs the fatal-signal handler table (spec §4.5).
pub const SIGNAL_INSTALL_THREAD_NAME: &str = "NR-Sig-Handler";
/// Name of the ANR watchdog worker thread (spec §4.5).
pub const ANR_WATCHDOG_THREAD_NAME: &str = "NR-ANR-Handler";

/// Well-known host-runtime thread the ANR coordinator looks for (spec §4.5, GLOSSARY).
pub const ANR_TARGET_THREAD_NAME: &str = "Signal Catcher";
/// `/proc/<pid>/task/<tid>/status` field the coordinator inspects to confirm the target.
pub const ANR_SIGBLK_FIELD: &str = "SigBlk:";
/// Bit within `SigBlk:` that identifies the runtime's SIGQUIT-blocking ANR reporter.
pub const ANR_SIGBLK_BIT: u64 = 0x1000;

/// Poll interval used by the ANR watchdog when semaphore creation fails (spec §4.5).
pub const ANR_POLL_INTERVAL_MS: u64 = 100;

pub const PLATFORM_LITERAL: &str = "android";
