// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lexically-scoped guard that suppresses a fixed set of signals for the
//! duration of report building.
//!
//! During report construction it isn't guaranteed that SIGCHLD/SIGPIPE (or
//! whichever signals the caller names) won't fire as a side effect of the
//! work the handler itself does, and it isn't safe to block every signal
//! outright since the previously installed disposition still needs to run
//! afterward. This ignores the named signals and restores their previous
//! disposition and the thread's signal mask on drop.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

pub struct SaGuard<const N: usize> {
    old_sigactions: [(Signal, SigAction); N],
    old_sigmask: SigSet,
}

impl<const N: usize> SaGuard<N> {
    pub fn new(signals: &[Signal; N]) -> anyhow::Result<Self> {
        let mut suppressed = SigSet::empty();
        for signal in signals {
            suppressed.add(*signal);
        }

        let mut old_sigmask = SigSet::empty();
        signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&suppressed), Some(&mut old_sigmask))?;

        let mut old_sigactions = [(
            Signal::SIGINT,
            SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty()),
        ); N];

        for (i, &signal) in signals.iter().enumerate() {
            let old = unsafe {
                signal::sigaction(
                    signal,
                    &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
                )?
            };
            old_sigactions[i] = (signal, old);
        }

        Ok(Self {
            old_sigactions,
            old_sigmask,
        })
    }
}

impl<const N: usize> Drop for SaGuard<N> {
    fn drop(&mut self) {
        for &(signal, old) in &self.old_sigactions {
            unsafe {
                let _ = signal::sigaction(signal, &old);
            }
        }
        let _ = signal::sigprocmask(signal::SigmaskHow::SIG_SETMASK, Some(&self.old_sigmask), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_previous_disposition_on_drop() {
        extern "C" fn noop(_: i32) {}
        unsafe {
            let _ = signal::sigaction(
                Signal::SIGUSR1,
                &SigAction::new(SigHandler::Handler(noop), SaFlags::empty(), SigSet::empty()),
            );
        }
        {
            let _guard = SaGuard::new(&[Signal::SIGUSR1]).unwrap();
        }
        let current = unsafe {
            signal::sigaction(
                Signal::SIGUSR1,
                &SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty()),
            )
            .unwrap()
        };
        assert!(matches!(current.handler(), SigHandler::Handler(_)));
    }
}
