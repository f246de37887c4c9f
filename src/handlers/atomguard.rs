// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CAS-based reentrancy guard for the per-signal and process-wide
//! "intercepting" counters (spec §4.5, §5, §9 "Cyclic / reentrant control
//! flow").

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct AtomGuardError;

impl fmt::Display for AtomGuardError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "reentrancy guard error: already in use")
    }
}

impl Error for AtomGuardError {}

/// Takes `counter` from 0 to 1 via CAS and restores it to 0 on drop. A
/// second concurrent `new()` while the guard is held fails, which is how the
/// signal handler short-circuits to the previous disposition on reentry.
pub struct AtomGuard<'a> {
    counter: &'a AtomicU64,
}

impl<'a> AtomGuard<'a> {
    pub fn new(counter: &'a AtomicU64) -> Result<Self, AtomGuardError> {
        counter
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| AtomGuard { counter })
            .map_err(|_| AtomGuardError)
    }
}

impl Drop for AtomGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_guard_fails_while_first_is_held() {
        let counter = AtomicU64::new(0);
        let first = AtomGuard::new(&counter).unwrap();
        assert!(AtomGuard::new(&counter).is_err());
        drop(first);
        assert!(AtomGuard::new(&counter).is_ok());
    }
}
