//! Destination file names.
//!
//! Copies are named `<wall-clock-ms><extension>`, taken at the moment of the
//! copy. The generator never hands out the same millisecond twice within a
//! process, and steps past names already present in the output directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::model::Watermark;

/// Trailing `.[A-Za-z0-9]+` of a file name, including the dot.
pub fn extension_of(name: &str) -> &str {
    let Some(dot) = name.rfind('.') else {
        return "";
    };
    let ext = &name[dot + 1..];
    if !ext.is_empty() && ext.bytes().all(|b| b.is_ascii_alphanumeric()) {
        &name[dot..]
    } else {
        ""
    }
}

#[derive(Debug, Clone, Default)]
pub struct NameGenerator {
    last_issued: Option<u64>,
}

impl NameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks an unused path in `dir` for a copy of `source`.
    pub fn next_path(&mut self, dir: &Path, source: &Path) -> PathBuf {
        let now = Watermark::from_system_time(SystemTime::now()).as_millis();
        self.next_path_at(dir, source, now)
    }

    fn next_path_at(&mut self, dir: &Path, source: &Path, now_ms: u64) -> PathBuf {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        let ext = extension_of(&name);

        let stamp = match self.last_issued {
            Some(last) if now_ms <= last => last + 1,
            _ => now_ms,
        };
        self.last_issued = Some(stamp);

        let candidate = dir.join(format!("{}{}", stamp, ext));
        if !candidate.exists() {
            return candidate;
        }

        // Left over from an earlier run whose clock was ahead of ours
        (1u32..)
            .map(|n| dir.join(format!("{}-{}{}", stamp, n, ext)))
            .find(|p| !p.exists())
            .unwrap_or(candidate)
    }
}
