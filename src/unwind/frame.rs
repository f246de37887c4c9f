// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolving a raw instruction pointer to a module + nearest-symbol pair.
//! Uses the dynamic linker's reverse lookup (`backtrace::resolve`, which on
//! Unix bottoms out in `dladdr`) rather than hand-rolled ELF parsing — this
//! is tolerated to allocate (spec §5, §9: "async-signal-safety vs dynamic
//! allocation").

use serde::Serialize;

/// One resolved stack frame (spec §3 "StackFrame").
#[derive(Debug, Clone, Serialize)]
pub struct StackFrame {
    pub index: usize,
    pub address: usize,
    pub pc: usize,
    pub module_path: Option<String>,
    pub symbol_name: Option<String>,
    pub module_base: usize,
    pub symbol_address: usize,
    pub symbol_offset: usize,
}

impl StackFrame {
    /// The one-line textual form spec §4.4 requires:
    /// `"#NN pc HEXPC MODULE (SYMBOL+OFFSET)"`.
    pub fn to_line(&self) -> String {
        let module = self.module_path.as_deref().unwrap_or("<unknown>");
        let mut line = format!("#{:02} pc {:016x} {}", self.index, self.pc, module);
        if let Some(name) = &self.symbol_name {
            line.push_str(&format!(" ({name}+{})", self.symbol_offset));
        }
        line
    }
}

/// Resolves `address` (the `index`-th frame of the walked stack) to its
/// owning module and nearest symbol, demangling the symbol name when
/// possible.
pub fn resolve(index: usize, address: usize) -> StackFrame {
    let mut module_path = None;
    let mut symbol_name = None;
    let mut module_base = 0usize;
    let mut symbol_address = 0usize;

    backtrace::resolve(address as *mut std::ffi::c_void, |symbol| {
        if module_path.is_none() {
            if let Some(name) = symbol.filename() {
                module_path = Some(name.display().to_string());
            }
        }
        if symbol_name.is_none() {
            if let Some(name) = symbol.name() {
                // `Symbol::name()` already yields a demangled form when the
                // mangling scheme is recognized.
                symbol_name = Some(name.to_string());
            }
        }
        if symbol_address == 0 {
            if let Some(addr) = symbol.addr() {
                symbol_address = addr as usize;
            }
        }
    });

    // `backtrace` doesn't expose the module base address directly through
    // `resolve`; derive it via the lower-level `BacktraceSymbol`-adjacent API
    // is unavailable cross-platform, so module-relative `pc` falls back to
    // the nearest-symbol offset when a base can't be determined.
    if module_base == 0 {
        module_base = module_base_for(address).unwrap_or(0);
    }

    let pc = if module_base != 0 {
        address.saturating_sub(module_base)
    } else {
        address
    };
    let symbol_offset = if symbol_address != 0 {
        address.saturating_sub(symbol_address)
    } else {
        0
    };

    StackFrame {
        index,
        address,
        pc,
        module_path,
        symbol_name,
        module_base,
        symbol_address,
        symbol_offset,
    }
}

#[cfg(unix)]
fn module_base_for(address: usize) -> Option<usize> {
    // `dladdr` gives us the base address of the shared object containing
    // `address` directly, which is what spec §4.3 calls `module_base`.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::dladdr(address as *const std::ffi::c_void, &mut info) };
    if rc == 0 || info.dli_fbase.is_null() {
        None
    } else {
        Some(info.dli_fbase as usize)
    }
}

#[cfg(not(unix))]
fn module_base_for(_address: usize) -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_known_function_in_this_binary() {
        let ip = resolve as usize;
        let frame = super::resolve(0, ip);
        assert_eq!(frame.index, 0);
        assert_eq!(frame.address, ip);
        assert!(frame.module_base <= frame.address);
        assert_eq!(frame.pc, frame.address - frame.module_base);
    }

    #[test]
    fn line_form_without_symbol_omits_parens() {
        let frame = StackFrame {
            index: 3,
            address: 0x1000,
            pc: 0x10,
            module_path: Some("/lib/libfoo.so".to_string()),
            symbol_name: None,
            module_base: 0xf00,
            symbol_address: 0,
            symbol_offset: 0,
        };
        let line = frame.to_line();
        assert!(line.starts_with("#03 pc"));
        assert!(line.contains("libfoo.so"));
        assert!(!line.contains('('));
    }

    #[test]
    fn line_form_with_symbol_includes_offset() {
        let frame = StackFrame {
            index: 0,
            address: 0x2000,
            pc: 0x20,
            module_path: Some("/lib/libfoo.so".to_string()),
            symbol_name: Some("do_thing".to_string()),
            module_base: 0x1fe0,
            symbol_address: 0x1ff0,
            symbol_offset: 0x10,
        };
        assert_eq!(frame.to_line(), "#00 pc 0000000000000020 /lib/libfoo.so (do_thing+16)");
    }
}
