//! Recursive source tree walk.
//!
//! Produces the candidate files of a pass in depth-first order, pruning any
//! directory named [`SKIPPED_DIR`] before descending into it.

use regex::Regex;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::model::Watermark;

/// Directories with this exact name are never scanned, at any depth.
pub const SKIPPED_DIR: &str = "thumbnails";

/// A regular file whose name matched the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,

    /// Creation time as reported by the filesystem
    pub created: Watermark,
}

/// Everything a walk found, plus how many entries it had to skip.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub candidates: Vec<Candidate>,
    pub errors: usize,
}

/// Walks `root` and returns every candidate file under it.
///
/// Entries that cannot be read are logged and counted in
/// [`WalkOutcome::errors`]; the walk carries on past them.
pub fn find_candidates(root: &Path, filter: &Regex) -> WalkOutcome {
    let mut outcome = WalkOutcome::default();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                warn!(path = %path, "Skipping unreadable entry: {}", e);
                outcome.errors += 1;
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if !filter.is_match(&name) {
            continue;
        }

        match entry.metadata() {
            Ok(meta) => outcome.candidates.push(Candidate {
                created: creation_time(entry.path(), &meta),
                path: entry.into_path(),
            }),
            Err(e) => {
                warn!(path = %entry.path().display(), "Failed to stat file: {}", e);
                outcome.errors += 1;
            }
        }
    }

    outcome
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_type().is_dir() && entry.file_name() == SKIPPED_DIR
}

/// Birth time of the file, or its modification time where the filesystem
/// does not record one.
fn creation_time(path: &Path, meta: &Metadata) -> Watermark {
    match meta.created() {
        Ok(time) => Watermark::from_system_time(time),
        Err(e) => {
            debug!(path = %path.display(), "No creation time ({}), using mtime", e);
            meta.modified()
                .map(Watermark::from_system_time)
                .unwrap_or(Watermark::EPOCH)
        }
    }
}
