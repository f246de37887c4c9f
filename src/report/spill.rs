// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Writing a serialized document to its final resting place (spec §6
//! "Report file layout").

use crate::report::model::ReportKind;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Builds `<reports_dir>/<prefix><YYYYMMDDhhmmss><mmm>` for `kind` captured
/// at `when` (spec §6).
pub fn spill_path(reports_dir: &Path, kind: ReportKind, when: DateTime<Utc>) -> PathBuf {
    let millis = when.timestamp_subsec_millis();
    let stamp = when.format("%Y%m%d%H%M%S");
    reports_dir.join(format!("{}{stamp}{millis:03}", kind.filename_prefix()))
}

/// Writes `document` to `path`, creating the parent directory if needed.
/// Matches the "spill" step of every capture path (spec §4.5, §5): this runs
/// outside the async-signal-safe hot path (symbol resolution already
/// allocated by this point), so a plain buffered file write is appropriate.
pub fn spill(path: &Path, document: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    file.write_all(document)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn path_has_prefix_timestamp_and_millis() {
        let when = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap()
            + chrono::Duration::milliseconds(42);
        let path = spill_path(Path::new("/tmp/r"), ReportKind::Crash, when);
        assert_eq!(path, Path::new("/tmp/r/crash-20260727120000042"));
    }

    #[test]
    fn spill_writes_bytes_and_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let reports_dir = dir.path().join("reports");
        let when = Utc::now();
        let path = spill_path(&reports_dir, ReportKind::Anr, when);
        spill(&path, b"hello\0").unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"hello\0");
    }
}
