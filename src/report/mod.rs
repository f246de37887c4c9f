// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Building, serializing and spilling the captured report document (spec
//! §3 "Backtrace", §4.4, §6).

mod emitter;
mod model;
mod spill;

pub use emitter::{serialize, SerializeOutcome};
pub use model::{Backtrace, ExceptionInfo, FrameRecord, ReportKind, SignalInfo, ThreadRecord};
pub use spill::{spill, spill_path};
