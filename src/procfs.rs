// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-only queries over `/proc`. Every function here is a pure function of
//! a pid/tid pair: it opens a file, reads it, and returns owned text. Failures
//! are swallowed into the literal `"<unknown>"` and logged — callers building
//! a crash report should never have to special-case a missing `/proc` entry.

#![cfg(unix)]

use std::fs::File;
use std::io::Read;

const UNKNOWN: &str = "<unknown>";

/// Strips trailing space/tab/CR/LF, matching the original agent's
/// `trim_trailing_ws` rather than `str::trim` (which would also eat leading
/// whitespace the original never touched, e.g. padding inside `/proc/<pid>/cmdline`).
fn trim_trailing_ws(s: &str) -> &str {
    s.trim_end_matches([' ', '\t', '\r', '\n'])
}

fn read_trimmed(path: &str) -> Option<String> {
    let mut buf = String::new();
    File::open(path).ok()?.read_to_string(&mut buf).ok()?;
    Some(trim_trailing_ws(&buf).to_string())
}

/// Path the caller would open to enumerate `pid`'s threads.
pub fn task_path(pid: i32) -> String {
    format!("/proc/{pid}/task")
}

/// Path the caller would open to read `tid`'s `/proc` status line.
pub fn thread_status_path(pid: i32, tid: i32) -> String {
    format!("/proc/{pid}/task/{tid}/status")
}

fn thread_stat_path(pid: i32, tid: i32) -> String {
    format!("/proc/{pid}/task/{tid}/stat")
}

fn process_stat_path(pid: i32) -> String {
    format!("/proc/{pid}/stat")
}

fn cmdline_path(pid: i32) -> String {
    format!("/proc/{pid}/cmdline")
}

fn comm_path(pid: i32, tid: i32) -> String {
    format!("/proc/{pid}/task/{tid}/comm")
}

/// The nul/newline-trimmed command line of `pid`.
pub fn process_name(pid: i32) -> String {
    match read_trimmed(&cmdline_path(pid)) {
        Some(name) if !name.is_empty() => name.replace('\0', " ").trim().to_string(),
        _ => {
            log::warn!("procfs::process_name: could not read cmdline for pid {pid}");
            UNKNOWN.to_string()
        }
    }
}

/// The nul/newline-trimmed `comm` of `tid` within `pid`.
pub fn thread_name(pid: i32, tid: i32) -> String {
    match read_trimmed(&comm_path(pid, tid)) {
        Some(name) if !name.is_empty() => name,
        _ => {
            log::warn!("procfs::thread_name: could not read comm for pid {pid} tid {tid}");
            UNKNOWN.to_string()
        }
    }
}

/// The full single-line `/proc/<pid>/task/<tid>/stat` record.
pub fn thread_stat(pid: i32, tid: i32) -> String {
    read_trimmed(&thread_stat_path(pid, tid)).unwrap_or_else(|| {
        log::warn!("procfs::thread_stat: could not read stat for pid {pid} tid {tid}");
        UNKNOWN.to_string()
    })
}

/// The full single-line `/proc/<pid>/stat` record.
pub fn process_stat(pid: i32) -> String {
    read_trimmed(&process_stat_path(pid)).unwrap_or_else(|| {
        log::warn!("procfs::process_stat: could not read stat for pid {pid}");
        UNKNOWN.to_string()
    })
}

/// Reads the `SigBlk:` field (hex bitmask) out of a thread's status file.
/// Returns `None` if the thread or the field cannot be found.
pub fn thread_sigblk(pid: i32, tid: i32) -> Option<u64> {
    let status = read_trimmed(&thread_status_path(pid, tid))?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(crate::constants::ANR_SIGBLK_FIELD) {
            return u64::from_str_radix(rest.trim(), 16).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_whitespace_only() {
        assert_eq!(trim_trailing_ws("  hello \t\r\n"), "  hello");
        assert_eq!(trim_trailing_ws("no-trailing"), "no-trailing");
    }

    #[test]
    fn process_name_of_self_is_not_unknown() {
        let pid = std::process::id() as i32;
        let name = process_name(pid);
        assert_ne!(name, UNKNOWN);
    }

    #[test]
    fn missing_pid_yields_unknown() {
        // pid 0 has no /proc entry of its own on Linux.
        assert_eq!(process_name(0), UNKNOWN);
    }

    #[test]
    fn task_path_is_well_formed() {
        assert_eq!(task_path(123), "/proc/123/task");
        assert_eq!(thread_status_path(123, 456), "/proc/123/task/456/status");
    }
}
