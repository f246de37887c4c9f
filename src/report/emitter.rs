// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Composes the report document the way the original agent's `emitter.cpp`
//! did: nested `'key':value` fragments quoted with apostrophes, with a final
//! pass translating every apostrophe to a double quote so the result parses
//! as JSON (spec §4.4). Kept here rather than switched to straight
//! `serde_json::to_string` because the quoting trick is itself one of the
//! emitter's documented behaviors, not an implementation accident.
//!
//! Caveat carried over from the original: a literal apostrophe inside a
//! string *value* (e.g. a thread name) also gets translated, which would
//! corrupt the document. None of the fields this emitter writes are
//! expected to contain one in practice (kernel-supplied names, hex register
//! dumps, resolved symbol names).

use crate::constants::MAX_REPORT_BYTES;
use crate::report::model::{Backtrace, ExceptionInfo, FrameRecord, ThreadRecord};

/// Result of [`serialize`]: the null-terminated document bytes, and whether
/// the 1 MiB cap forced truncation (spec §3, §4.4, §6).
pub struct SerializeOutcome {
    pub document: Vec<u8>,
    pub truncated: bool,
}

fn esc(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn field_str(key: &str, value: &str) -> String {
    format!("'{key}':'{}'", esc(value))
}

fn field_num(key: &str, value: impl std::fmt::Display) -> String {
    format!("'{key}':{value}")
}

fn field_bool(key: &str, value: bool) -> String {
    format!("'{key}':{value}")
}

fn obj(name: Option<&str>, fields: &[String]) -> String {
    let body = fields.join(",");
    match name {
        Some(name) => format!("'{name}':{{{body}}}"),
        None => format!("{{{body}}}"),
    }
}

fn arr(name: &str, items: &[String]) -> String {
    format!("'{name}':[{}]", items.join(","))
}

fn emit_exception(exception: &ExceptionInfo) -> String {
    let mut fields = vec![
        field_str("name", exception.name),
        field_str("cause", exception.cause),
    ];
    if let Some(info) = &exception.signal_info {
        let sub = obj(
            None,
            &[
                field_str("signalName", info.signal_name),
                field_num("signalCode", info.signal_code),
                field_num("faultAddress", info.fault_address),
            ],
        );
        fields.push(format!("'signalInfo':{sub}"));
    }
    obj(Some("exception"), &fields)
}

fn emit_registers(registers: &crate::registers::RegisterFile) -> String {
    let fields: Vec<String> = registers
        .0
        .iter()
        .map(|(key, value)| field_str(key, value))
        .collect();
    obj(Some("registers"), &fields)
}

fn emit_frame(frame: &FrameRecord) -> String {
    let mut fields = vec![
        field_str("cstr", &frame.cstr),
        field_num("index", frame.index),
        field_num("address", frame.address),
        field_num("pc", frame.pc),
        field_num("so_base", frame.so_base),
        field_num("sym_addr", frame.sym_addr),
        field_num("sym_addr_offset", frame.sym_addr_offset),
    ];
    if let Some(path) = &frame.so_path {
        fields.push(field_str("so_path", path));
    }
    if let Some(name) = &frame.sym_name {
        fields.push(field_str("sym_name", name));
    }
    obj(None, &fields)
}

fn emit_thread(thread: &ThreadRecord) -> String {
    let frames: Vec<String> = thread.stack.iter().map(emit_frame).collect();
    let fields = vec![
        field_num("threadNumber", thread.thread_number),
        field_str("threadId", &thread.thread_id),
        field_str("state", thread.state),
        field_num("priority", thread.priority),
        field_bool("crashed", thread.crashed),
        arr("stack", &frames),
    ];
    obj(None, &fields)
}

fn emit_backtrace(bt: &Backtrace) -> String {
    let mut fields = vec![
        field_str("name", &bt.name),
        field_str("description", bt.description),
        field_num("timestamp", bt.timestamp),
        field_str("abi", bt.abi),
        field_num("pid", bt.pid),
        field_num("ppid", bt.ppid),
        field_num("uid", bt.uid),
        field_str("buildid", &bt.buildid),
        field_str("sessionid", &bt.sessionid),
        field_str("platform", bt.platform),
        emit_exception(&bt.exception),
    ];
    if let Some(registers) = &bt.registers {
        fields.push(emit_registers(registers));
    }
    let threads: Vec<String> = bt.threads.iter().map(emit_thread).collect();
    fields.push(arr("threads", &threads));
    obj(Some("backtrace"), &fields)
}

/// Serializes `bt` into the document spec §4.4/§6 describe: a single
/// top-level `{"backtrace": {...}}` object, truncated to
/// [`MAX_REPORT_BYTES`] minus one byte and null-terminated.
pub fn serialize(bt: &Backtrace) -> SerializeOutcome {
    let composed = obj(None, &[emit_backtrace(bt)]).replace('\'', "\"");
    let mut bytes = composed.into_bytes();

    let truncated = bytes.len() + 1 > MAX_REPORT_BYTES;
    if truncated {
        bytes.truncate(MAX_REPORT_BYTES - 1);
    }
    bytes.push(0);

    SerializeOutcome {
        document: bytes,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::model::{SignalInfo, ThreadRecord};
    use crate::unwind::threads::{ThreadInfo, ThreadState};

    fn sample_backtrace() -> Backtrace {
        let exception = ExceptionInfo {
            name: "Native exception",
            cause: "Address not mapped to object",
            signal_info: Some(SignalInfo {
                signal_name: "SIGSEGV",
                signal_code: 1,
                fault_address: 0,
            }),
        };
        let info = ThreadInfo {
            tid: 123,
            name: "main".to_string(),
            state: ThreadState::Running,
            priority: 0,
            stack_base: 0,
            crashed: true,
            backtrace: None,
        };
        let thread = ThreadRecord::new(&info, Vec::new());
        Backtrace::new(
            "com.example.app".to_string(),
            "Address not mapped to object",
            1_700_000_000,
            123,
            1,
            1000,
            "build-1".to_string(),
            "session-1".to_string(),
            exception,
            None,
            vec![thread],
        )
    }

    #[test]
    fn round_trips_as_valid_json() {
        let outcome = serialize(&sample_backtrace());
        assert!(!outcome.truncated);
        let text = std::str::from_utf8(&outcome.document[..outcome.document.len() - 1]).unwrap();
        let value: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(value["backtrace"]["pid"], 123);
        assert_eq!(value["backtrace"]["threads"][0]["crashed"], true);
        assert_eq!(value["backtrace"]["threads"][0]["threadNumber"], 123);
        assert_eq!(value["backtrace"]["threads"][0]["threadId"], "main");
        assert_eq!(
            value["backtrace"]["exception"]["signalInfo"]["signalName"],
            "SIGSEGV"
        );
    }

    #[test]
    fn null_terminates_the_document() {
        let outcome = serialize(&sample_backtrace());
        assert_eq!(*outcome.document.last().unwrap(), 0u8);
    }

    #[test]
    fn oversized_document_is_truncated_and_flagged() {
        let mut bt = sample_backtrace();
        let info = ThreadInfo {
            tid: 999,
            name: "x".repeat(64),
            state: ThreadState::Sleeping,
            priority: 0,
            stack_base: 0,
            crashed: false,
            backtrace: None,
        };
        // Pad well past MAX_REPORT_BYTES with synthetic thread records.
        for _ in 0..40_000 {
            bt.threads.push(ThreadRecord::new(&info, Vec::new()));
        }
        let outcome = serialize(&bt);
        assert!(outcome.truncated);
        assert_eq!(outcome.document.len(), MAX_REPORT_BYTES);
        assert_eq!(*outcome.document.last().unwrap(), 0u8);
    }
}
