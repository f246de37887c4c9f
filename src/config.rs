// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The initialization contract the hosting runtime supplies to [`crate::start`]
//! (spec §6 "Initialization contract").

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Context the hosting runtime hands to `start()`: where to spill reports,
/// opaque identifiers to stamp on every document, and whether the ANR
/// coordinator should run at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub reports_dir: PathBuf,
    pub session_id: String,
    pub build_id: String,
    pub anr_monitor_enabled: bool,
}

impl Context {
    pub fn new(
        reports_dir: PathBuf,
        session_id: String,
        build_id: String,
        anr_monitor_enabled: bool,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(reports_dir.is_absolute(), "reports_dir must be an absolute path");
        anyhow::ensure!(!session_id.is_empty(), "session_id must not be empty");
        anyhow::ensure!(!build_id.is_empty(), "build_id must not be empty");
        Ok(Context {
            reports_dir,
            session_id,
            build_id,
            anr_monitor_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_a_relative_reports_dir() {
        let result = Context::new(
            PathBuf::from("relative/path"),
            "session".to_string(),
            "build".to_string(),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn accepts_a_well_formed_context() {
        let ctx = Context::new(
            PathBuf::from("/tmp/r"),
            "session-1".to_string(),
            "build-1".to_string(),
            true,
        )
        .unwrap();
        assert!(ctx.anr_monitor_enabled);
    }
}
