// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Enumerates every thread of the current process by scanning its task
//! directory, and parses each thread's `/proc/.../stat` line into a
//! [`ThreadInfo`] (spec §3, §4.3 "collect_thread_inventory").

use crate::constants::MAX_THREADS;
use crate::procfs;
use crate::unwind::state::BacktraceState;
use serde::Serialize;
use std::fs;

/// One thread's sched state, normalized from the single-character `/proc`
/// state code (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadState {
    Running,
    Sleeping,
    Zombie,
    Stopped,
    Dead,
    Waking,
    WakeKill,
    Parked,
    Unknown,
}

impl ThreadState {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::Running => "RUNNING",
            ThreadState::Sleeping => "SLEEPING",
            ThreadState::Zombie => "ZOMBIE",
            ThreadState::Stopped => "STOPPED",
            ThreadState::Dead => "DEAD",
            ThreadState::Waking => "WAKING",
            ThreadState::WakeKill => "WAKE KILL",
            ThreadState::Parked => "PARKED",
            ThreadState::Unknown => "unknown",
        }
    }

    fn from_proc_code(c: char) -> ThreadState {
        match c {
            'R' => ThreadState::Running,
            'S' | 'D' => ThreadState::Sleeping,
            'Z' => ThreadState::Zombie,
            'T' | 't' => ThreadState::Stopped,
            'X' | 'x' => ThreadState::Dead,
            'W' => ThreadState::Waking,
            'K' => ThreadState::WakeKill,
            'P' => ThreadState::Parked,
            _ => ThreadState::Unknown,
        }
    }
}

/// Per-thread record captured at crash time (spec §3 "ThreadInfo").
#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub tid: i32,
    pub name: String,
    pub state: ThreadState,
    pub priority: i64,
    pub stack_base: usize,
    pub crashed: bool,
    #[serde(skip)]
    pub backtrace: Option<BacktraceState>,
}

/// Parses the tail of a `/proc/.../stat` line (the part after the
/// parenthesized `comm`) into the fields spec §4.3 names: state (field 3),
/// priority (field 18), kernel-stack base (field 28).
///
/// `comm` may itself contain spaces or parentheses, so the split is anchored
/// on the *last* `)` rather than tokenizing naively.
fn parse_stat_tail(stat: &str) -> Option<(char, i64, usize)> {
    let close = stat.rfind(')')?;
    let rest = stat.get(close + 1..)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // `rest` starts at field 3 (state); field 18 is index 15, field 28 is index 25.
    let state = fields.first()?.chars().next()?;
    let priority: i64 = fields.get(15)?.parse().ok()?;
    let stack_base: usize = fields.get(25)?.parse().ok()?;
    Some((state, priority, stack_base))
}

/// Builds a [`ThreadInfo`] for `tid`, marking it crashed iff it equals
/// `crashing_tid`.
fn thread_info(pid: i32, tid: i32, crashing_tid: i32) -> ThreadInfo {
    let name = procfs::thread_name(pid, tid);
    let stat = procfs::thread_stat(pid, tid);
    let (state, priority, stack_base) = parse_stat_tail(&stat).unwrap_or(('?', 0, 0));

    ThreadInfo {
        tid,
        name,
        state: ThreadState::from_proc_code(state),
        priority,
        stack_base,
        crashed: tid == crashing_tid,
        backtrace: None,
    }
}

/// Enumerates the current process's threads (spec §4.3
/// "collect_thread_inventory"), capped at [`MAX_THREADS`] entries.
pub fn collect_thread_inventory(pid: i32, crashing_tid: i32) -> Vec<ThreadInfo> {
    let task_path = procfs::task_path(pid);
    let entries = match fs::read_dir(&task_path) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("collect_thread_inventory: could not read {task_path}: {err}");
            return Vec::new();
        }
    };

    let mut threads = Vec::new();
    for entry in entries.flatten() {
        if threads.len() >= MAX_THREADS {
            log::warn!("collect_thread_inventory: truncated at {MAX_THREADS} threads");
            break;
        }
        let name = entry.file_name();
        let Some(tid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        threads.push(thread_info(pid, tid, crashing_tid));
    }
    threads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_stat_line() {
        // Fields 1..30, comm padded with a space to exercise the anchor-on-last-paren logic.
        let mut fields = vec!["1234".to_string(), "(my thread)".to_string(), "S".to_string()];
        for i in 4..=30 {
            fields.push(i.to_string());
        }
        // overwrite priority (index in fields vec corresponding to stat field 18)
        let stat = fields.join(" ");
        let (state, _priority, _stack_base) = parse_stat_tail(&stat).unwrap();
        assert_eq!(state, 'S');
    }

    #[test]
    fn comm_with_parens_does_not_confuse_the_anchor() {
        // `rest` (everything after the last ')') starts at field 3 (index 0);
        // field 18 (priority) is index 15, field 28 (stack base) is index 25.
        let mut tail: Vec<String> = (0..29).map(|i| i.to_string()).collect();
        tail[0] = "R".to_string();
        tail[15] = "7".to_string();
        tail[25] = "4096".to_string();
        let stat = format!("99 (weird (name)) {}", tail.join(" "));
        let (state, priority, stack_base) = parse_stat_tail(&stat).unwrap();
        assert_eq!(state, 'R');
        assert_eq!(priority, 7);
        assert_eq!(stack_base, 4096);
    }

    #[test]
    fn state_token_mapping_matches_spec() {
        assert_eq!(ThreadState::from_proc_code('R').as_str(), "RUNNING");
        assert_eq!(ThreadState::from_proc_code('S').as_str(), "SLEEPING");
        assert_eq!(ThreadState::from_proc_code('Z').as_str(), "ZOMBIE");
        assert_eq!(ThreadState::from_proc_code('T').as_str(), "STOPPED");
        assert_eq!(ThreadState::from_proc_code('X').as_str(), "DEAD");
        assert_eq!(ThreadState::from_proc_code('W').as_str(), "WAKING");
        assert_eq!(ThreadState::from_proc_code('K').as_str(), "WAKE KILL");
        assert_eq!(ThreadState::from_proc_code('P').as_str(), "PARKED");
        assert_eq!(ThreadState::from_proc_code('?').as_str(), "unknown");
    }

    #[test]
    fn inventory_marks_exactly_the_crashing_thread() {
        let pid = std::process::id() as i32;
        let crashing_tid = pid; // main thread tid == pid
        let threads = collect_thread_inventory(pid, crashing_tid);
        assert!(!threads.is_empty());
        let crashed: Vec<_> = threads.iter().filter(|t| t.crashed).collect();
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].tid, crashing_tid);
    }
}
