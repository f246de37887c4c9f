// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The document shape spec §3 ("Backtrace") and §6 ("Report content") define.
//! Field names mirror the original agent's `emitter.cpp` key choices
//! (`so_base`, `sym_addr`, `cstr`, ...) since those are the wire contract the
//! upload pipeline (out of scope here) still has to parse.

use crate::constants::{PLATFORM_LITERAL, PREFIX_ANR, PREFIX_CRASH, PREFIX_EXCEPTION};
use crate::registers::RegisterFile;
use crate::unwind::frame::StackFrame;
use crate::unwind::threads::ThreadInfo;
use serde::Serialize;

/// Which of the three capture paths produced a report (spec §9 "Polymorphism
/// over capture kind"). The only differences between them are the filename
/// prefix and whether a machine context is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Crash,
    Exception,
    Anr,
}

impl ReportKind {
    pub fn filename_prefix(self) -> &'static str {
        match self {
            ReportKind::Crash => PREFIX_CRASH,
            ReportKind::Exception => PREFIX_EXCEPTION,
            ReportKind::Anr => PREFIX_ANR,
        }
    }
}

/// `signalInfo` sub-object (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct SignalInfo {
    pub signal_name: &'static str,
    pub signal_code: i32,
    pub fault_address: usize,
}

/// `exception` object (spec §4.4, §6).
#[derive(Debug, Clone, Serialize)]
pub struct ExceptionInfo {
    pub name: &'static str,
    pub cause: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_info: Option<SignalInfo>,
}

/// One resolved frame, in the wire shape the original emitter used
/// (`cstr`/`so_base`/`sym_addr`/...).
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub cstr: String,
    pub index: usize,
    pub address: usize,
    pub pc: usize,
    pub so_base: usize,
    pub sym_addr: usize,
    pub sym_addr_offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub so_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sym_name: Option<String>,
}

impl From<&StackFrame> for FrameRecord {
    fn from(frame: &StackFrame) -> Self {
        FrameRecord {
            cstr: frame.to_line(),
            index: frame.index,
            address: frame.address,
            pc: frame.pc,
            so_base: frame.module_base,
            sym_addr: frame.symbol_address,
            sym_addr_offset: frame.symbol_offset,
            so_path: frame.module_path.clone(),
            sym_name: frame.symbol_name.clone(),
        }
    }
}

/// One thread record (spec §6: `{threadNumber, threadId, state, priority,
/// crashed, stack}`). Field naming mirrors the original emitter exactly
/// (`emitter.cpp`: `'threadNumber':%d` from `thread.tid`, `'threadId':'%s'`
/// from `thread.thread_name`) even though it reads backwards — `threadNumber`
/// carries the numeric kernel thread id and `threadId` carries the thread's
/// name.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadRecord {
    pub thread_number: i32,
    pub thread_id: String,
    pub state: &'static str,
    pub priority: i64,
    pub crashed: bool,
    pub stack: Vec<FrameRecord>,
}

impl ThreadRecord {
    /// Builds a thread record, pairing `info` with its resolved frames
    /// (resolution happens separately since it may allocate — spec §5, §9).
    pub fn new(info: &ThreadInfo, stack: Vec<FrameRecord>) -> Self {
        ThreadRecord {
            thread_number: info.tid,
            thread_id: info.name.clone(),
            state: info.state.as_str(),
            priority: info.priority,
            crashed: info.crashed,
            stack,
        }
    }
}

/// The top-level captured document (spec §3 "Backtrace", §6 "Report
/// content").
#[derive(Debug, Clone, Serialize)]
pub struct Backtrace {
    pub name: String,
    pub description: &'static str,
    pub timestamp: i64,
    pub abi: &'static str,
    pub pid: i32,
    pub ppid: i32,
    pub uid: u32,
    pub buildid: String,
    pub sessionid: String,
    pub platform: &'static str,
    pub exception: ExceptionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registers: Option<RegisterFile>,
    pub threads: Vec<ThreadRecord>,
}

impl Backtrace {
    pub fn new(
        name: String,
        description: &'static str,
        timestamp: i64,
        pid: i32,
        ppid: i32,
        uid: u32,
        buildid: String,
        sessionid: String,
        exception: ExceptionInfo,
        registers: Option<RegisterFile>,
        threads: Vec<ThreadRecord>,
    ) -> Self {
        Backtrace {
            name,
            description,
            timestamp,
            abi: crate::registers::current_arch().as_str(),
            pid,
            ppid,
            uid,
            buildid,
            sessionid,
            platform: PLATFORM_LITERAL,
            exception,
            registers,
            threads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_prefixes_match_spec() {
        assert_eq!(ReportKind::Crash.filename_prefix(), "crash-");
        assert_eq!(ReportKind::Exception.filename_prefix(), "ex-");
        assert_eq!(ReportKind::Anr.filename_prefix(), "anr-");
    }
}
