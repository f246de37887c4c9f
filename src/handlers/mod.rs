// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Top-level orchestration: the fatal-signal handler, the terminate
//! (panic-hook) handler, and the ANR coordinator, plus the reentrancy guards
//! they share (spec §2 "Handler trio + ANR coordinator").

pub mod anr;
pub mod atomguard;
pub mod saguard;
pub mod signal_handler;
pub mod terminate_handler;
