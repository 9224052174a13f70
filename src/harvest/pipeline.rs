//! Scan-copy-persist cycle.
//!
//! This module provides the [`Harvester`], which owns the watermark state and
//! runs one pass at a time:
//! - Walk the source tree for candidate files ([`find_candidates`])
//! - Copy every candidate created after the watermark into the output directory
//! - Advance the watermark to the newest creation time actually copied
//! - Persist the watermark through a [`WatermarkStore`]
//!
//! The watermark is only ever moved to creation times read from the source
//! files, never to the harvester's own clock, so a producer whose clock lags
//! behind ours does not lose files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::HarvesterConfig;
use crate::harvest::naming::NameGenerator;
use crate::harvest::scan::{find_candidates, Candidate};
use crate::model::{ScanResult, Watermark};
use crate::traits::{StoreError, WatermarkStore};

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while setting up or running a pass.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    /// Output directory could not be created
    #[error("Failed to prepare output directory '{path}': {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Blocking scan task panicked or was cancelled
    #[error("Scan task failed: {0}")]
    ScanTask(#[from] tokio::task::JoinError),

    /// Watermark could not be written
    #[error("Failed to persist watermark: {0}")]
    Persist(#[from] StoreError),
}

// ============================================================================
// Scan state
// ============================================================================

/// Watermark bookkeeping carried from pass to pass.
#[derive(Debug, Clone, Default)]
struct ScanState {
    /// Threshold for the copy decision
    watermark: Watermark,

    /// Newest creation time copied so far
    latest_seen: Watermark,

    /// Files copied above the watermark while it was held back by a failure
    unsettled: HashMap<PathBuf, Watermark>,

    /// Files above the watermark whose copy failed
    failures: HashMap<PathBuf, CopyFailure>,

    /// Consecutive passes whose walk hit unreadable entries
    failed_walks: u32,

    retry_limit: u32,

    names: NameGenerator,
}

#[derive(Debug, Clone, Copy)]
struct CopyFailure {
    created: Watermark,
    attempts: u32,
}

impl ScanState {
    fn starting_at(watermark: Watermark, retry_limit: u32) -> Self {
        Self {
            watermark,
            latest_seen: watermark,
            retry_limit,
            ..Default::default()
        }
    }

    fn scan_and_copy(&mut self, config: &HarvesterConfig) -> ScanResult {
        let start = Instant::now();
        let walk = find_candidates(&config.source_dir, &config.file_filter);

        let mut result = self.harvest(walk.candidates, walk.errors, &config.output_dir);
        result.stats.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    /// Copies every candidate newer than the pass-start watermark, then
    /// advances the watermark.
    ///
    /// The threshold stays fixed for the whole pass. A failed copy holds the
    /// watermark just below the failed file's creation time, and a walk that
    /// could not read everything holds it at the pass-start value, so the
    /// next pass retries. Either hold is dropped after `retry_limit`
    /// consecutive failing passes.
    fn harvest<I>(&mut self, candidates: I, walk_errors: usize, output_dir: &Path) -> ScanResult
    where
        I: IntoIterator<Item = Candidate>,
    {
        let threshold = self.watermark;
        let mut result = ScanResult {
            started_at: threshold,
            errors: walk_errors,
            ..Default::default()
        };
        let mut oldest_failure: Option<Watermark> = None;

        for candidate in candidates {
            if candidate.created <= threshold || self.unsettled.contains_key(&candidate.path) {
                result.skipped += 1;
                continue;
            }

            let dest = self.names.next_path(output_dir, &candidate.path);
            match std::fs::copy(&candidate.path, &dest) {
                Ok(bytes) => {
                    debug!(
                        from = %candidate.path.display(),
                        to = %dest.display(),
                        created = %candidate.created,
                        "Copied file"
                    );
                    self.latest_seen = self.latest_seen.max(candidate.created);
                    self.failures.remove(&candidate.path);
                    self.unsettled.insert(candidate.path, candidate.created);
                    result.copied += 1;
                    result.stats.bytes_copied += bytes;
                }
                Err(e) => {
                    warn!(path = %candidate.path.display(), "Failed to copy file: {}", e);
                    result.errors += 1;

                    let failure = self
                        .failures
                        .entry(candidate.path.clone())
                        .or_insert(CopyFailure {
                            created: candidate.created,
                            attempts: 0,
                        });
                    failure.created = candidate.created;
                    failure.attempts += 1;

                    if failure.attempts < self.retry_limit {
                        oldest_failure = Some(match oldest_failure {
                            Some(prev) => prev.min(candidate.created),
                            None => candidate.created,
                        });
                    } else if failure.attempts == self.retry_limit.max(1) {
                        error!(
                            path = %candidate.path.display(),
                            attempts = failure.attempts,
                            "Giving up on file, watermark may pass it"
                        );
                    }
                }
            }
        }

        let mut target = self.latest_seen;

        if walk_errors > 0 {
            self.failed_walks += 1;
            if self.failed_walks < self.retry_limit {
                target = target.min(threshold);
            } else if self.failed_walks == self.retry_limit.max(1) {
                error!(
                    passes = self.failed_walks,
                    "Source tree still partly unreadable, advancing watermark anyway"
                );
            }
        } else {
            self.failed_walks = 0;
        }

        if let Some(failed) = oldest_failure {
            // failed > threshold, so just_before() stays >= threshold
            target = target.min(failed.just_before());
        }
        if target > self.watermark {
            self.watermark = target;
        }

        let watermark = self.watermark;
        self.unsettled.retain(|_, created| *created > watermark);
        self.failures.retain(|_, failure| failure.created > watermark);
        result.watermark = watermark;
        result
    }
}

// ============================================================================
// Harvester
// ============================================================================

/// Owns the watermark and performs passes over the source tree.
///
/// # Example
///
/// ```ignore
/// use screenshot_harvester::{Harvester, HarvesterConfig, JsonFileStore};
///
/// let config = HarvesterConfig::new("/mnt/share".into(), "/home/pi/media/steam".into())?;
/// let store = JsonFileStore::new(&config.state_file);
/// let mut harvester = Harvester::initialize(config, store).await?;
/// let result = harvester.run_pass().await?;
/// println!("copied {}", result.copied);
/// ```
pub struct Harvester<S>
where
    S: WatermarkStore,
{
    config: Arc<HarvesterConfig>,

    store: S,

    state: ScanState,

    /// Last value known to be on disk; `None` until the first write
    persisted: Option<Watermark>,
}

impl<S> Harvester<S>
where
    S: WatermarkStore,
{
    /// Loads the persisted watermark and prepares the output directory.
    ///
    /// A missing or unreadable store starts the harvester from the epoch, so
    /// the first pass copies every matching file.
    pub async fn initialize(config: HarvesterConfig, store: S) -> Result<Self, HarvestError> {
        let watermark = match store.load().await {
            Ok(Some(watermark)) => {
                info!(store = %store.describe(), %watermark, "Loaded watermark");
                watermark
            }
            Ok(None) => {
                info!(store = %store.describe(), "No stored watermark, harvesting everything");
                Watermark::EPOCH
            }
            Err(e) => {
                warn!(store = %store.describe(), "Ignoring unreadable watermark: {}", e);
                Watermark::EPOCH
            }
        };

        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .map_err(|source| HarvestError::OutputDir {
                path: config.output_dir.clone(),
                source,
            })?;

        let state = ScanState::starting_at(watermark, config.retry_limit);
        Ok(Self {
            config: Arc::new(config),
            store,
            state,
            persisted: None,
        })
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    pub fn watermark(&self) -> Watermark {
        self.state.watermark
    }

    /// Runs one pass synchronously on the calling thread.
    pub fn scan_and_copy(&mut self) -> ScanResult {
        self.state.scan_and_copy(&self.config)
    }

    /// Writes the watermark if it differs from what was last written.
    ///
    /// Returns `true` when the store was written.
    pub async fn persist_watermark(&mut self) -> Result<bool, StoreError> {
        let watermark = self.state.watermark;
        if self.persisted == Some(watermark) {
            return Ok(false);
        }
        self.store.save(watermark).await?;
        self.persisted = Some(watermark);
        Ok(true)
    }

    /// Scans on the blocking pool, then persists the watermark.
    ///
    /// If the scan task dies, the state from before the pass is kept.
    #[instrument(skip(self), fields(source = %self.config.source_dir.display()))]
    pub async fn run_pass(&mut self) -> Result<ScanResult, HarvestError> {
        let config = Arc::clone(&self.config);
        let mut state = self.state.clone();

        let (state, result) = tokio::task::spawn_blocking(move || {
            let result = state.scan_and_copy(&config);
            (state, result)
        })
        .await?;
        self.state = state;

        info!(
            copied = result.copied,
            skipped = result.skipped,
            errors = result.errors,
            bytes = result.stats.bytes_copied,
            duration_ms = result.stats.duration_ms,
            watermark = %result.watermark,
            "Pass completed"
        );

        self.persist_watermark().await?;
        Ok(result)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_RETRY_LIMIT;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    fn ms(value: u64) -> Watermark {
        Watermark::from_millis(value)
    }

    /// In-memory store that records every write.
    #[derive(Default)]
    struct MemoryStore {
        initial: Option<Watermark>,
        corrupt: bool,
        writes: Mutex<Vec<Watermark>>,
    }

    #[async_trait]
    impl WatermarkStore for MemoryStore {
        fn describe(&self) -> String {
            "memory".to_string()
        }

        async fn load(&self) -> Result<Option<Watermark>, StoreError> {
            if self.corrupt {
                let err = serde_json::from_str::<Watermark>("{").unwrap_err();
                return Err(StoreError::InvalidContent(err));
            }
            Ok(self.initial)
        }

        async fn save(&self, watermark: Watermark) -> Result<(), StoreError> {
            self.writes.lock().unwrap().push(watermark);
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        src: PathBuf,
        out: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let src = dir.path().join("src");
            let out = dir.path().join("out");
            fs::create_dir_all(&src).unwrap();
            Self {
                _dir: dir,
                src,
                out,
            }
        }

        fn config(&self) -> HarvesterConfig {
            HarvesterConfig::new(self.src.clone(), self.out.clone()).unwrap()
        }

        /// Writes a file and returns it as a candidate with a chosen creation time.
        fn candidate(&self, rel: &str, created: u64) -> Candidate {
            let path = self.src.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, rel.as_bytes()).unwrap();
            Candidate {
                path,
                created: ms(created),
            }
        }

        fn output_count(&self) -> usize {
            fs::read_dir(&self.out).map(|d| d.count()).unwrap_or(0)
        }
    }

    #[tokio::test]
    async fn test_initialize_defaults_to_epoch() {
        let fx = Fixture::new();
        let harvester = Harvester::initialize(fx.config(), MemoryStore::default())
            .await
            .unwrap();
        assert_eq!(harvester.watermark(), Watermark::EPOCH);
        assert!(fx.out.is_dir());
    }

    #[tokio::test]
    async fn test_initialize_corrupt_store_defaults_to_epoch() {
        let fx = Fixture::new();
        let store = MemoryStore {
            corrupt: true,
            ..Default::default()
        };
        let harvester = Harvester::initialize(fx.config(), store).await.unwrap();
        assert_eq!(harvester.watermark(), Watermark::EPOCH);
    }

    #[tokio::test]
    async fn test_initialize_uses_stored_watermark() {
        let fx = Fixture::new();
        let store = MemoryStore {
            initial: Some(ms(777)),
            ..Default::default()
        };
        let harvester = Harvester::initialize(fx.config(), store).await.unwrap();
        assert_eq!(harvester.watermark(), ms(777));
        assert_eq!(harvester.state.latest_seen, ms(777));
    }

    #[test]
    fn test_scenario_two_passes() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.out).unwrap();
        let a = fx.candidate("a.jpg", 100);
        let c = fx.candidate("sub/c.jpg", 200);

        let mut state = ScanState::starting_at(Watermark::EPOCH, DEFAULT_RETRY_LIMIT);
        let first = state.harvest(vec![a.clone(), c.clone()], 0, &fx.out);
        assert_eq!(first.copied, 2);
        assert_eq!(first.watermark, ms(200));
        assert_eq!(fx.output_count(), 2);

        let second = state.harvest(vec![a, c], 0, &fx.out);
        assert_eq!(second.copied, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.watermark, ms(200));
        assert_eq!(fx.output_count(), 2);
    }

    #[test]
    fn test_threshold_fixed_within_pass() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.out).unwrap();

        // Newest file first: later, older files must still be compared
        // against the pass-start watermark
        let mut state = ScanState::starting_at(ms(50), DEFAULT_RETRY_LIMIT);
        let result = state.harvest(
            vec![
                fx.candidate("new.jpg", 300),
                fx.candidate("mid.jpg", 120),
                fx.candidate("old.jpg", 40),
            ],
            0,
            &fx.out,
        );
        assert_eq!(result.copied, 2);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.started_at, ms(50));
        assert_eq!(result.watermark, ms(300));
    }

    #[test]
    fn test_watermark_follows_files_not_clock() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.out).unwrap();
        let mut state = ScanState::starting_at(Watermark::EPOCH, DEFAULT_RETRY_LIMIT);

        // Producer clock far behind ours
        state.harvest(vec![fx.candidate("a.jpg", 1_000)], 0, &fx.out);
        assert_eq!(state.watermark, ms(1_000));

        // A file created later on the producer, still long before our "now"
        let result = state.harvest(vec![fx.candidate("b.jpg", 1_500)], 0, &fx.out);
        assert_eq!(result.copied, 1);
        assert_eq!(state.watermark, ms(1_500));
    }

    #[test]
    fn test_copies_bytes_unmodified_with_generated_name() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.out).unwrap();
        let shot = fx.candidate("screenshot.jpg", 10);

        let mut state = ScanState::starting_at(Watermark::EPOCH, DEFAULT_RETRY_LIMIT);
        state.harvest(vec![shot.clone()], 0, &fx.out);

        let copied: Vec<_> = fs::read_dir(&fx.out)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(copied.len(), 1);
        let name = copied[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(".jpg"));
        assert!(name.trim_end_matches(".jpg").parse::<u64>().is_ok());
        assert_eq!(fs::read(&copied[0]).unwrap(), fs::read(&shot.path).unwrap());
    }

    #[test]
    fn test_failed_copy_holds_watermark_back() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.out).unwrap();
        let ok_old = fx.candidate("a.jpg", 100);
        let ok_new = fx.candidate("c.jpg", 300);
        let missing = Candidate {
            path: fx.src.join("gone.jpg"),
            created: ms(200),
        };

        let mut state = ScanState::starting_at(Watermark::EPOCH, DEFAULT_RETRY_LIMIT);
        let first = state.harvest(vec![ok_old.clone(), missing.clone(), ok_new.clone()], 0, &fx.out);
        assert_eq!(first.copied, 2);
        assert_eq!(first.errors, 1);
        assert_eq!(first.watermark, ms(200).just_before());

        // The retry copies the recovered file without duplicating c.jpg
        let retried = fx.candidate("gone.jpg", 200);
        let second = state.harvest(vec![ok_old, retried, ok_new], 0, &fx.out);
        assert_eq!(second.copied, 1);
        assert_eq!(second.watermark, ms(300));
        assert_eq!(fx.output_count(), 3);
        assert!(state.unsettled.is_empty());
    }

    #[test]
    fn test_failure_never_lowers_watermark() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.out).unwrap();
        let missing = Candidate {
            path: fx.src.join("gone.jpg"),
            created: ms(501),
        };

        let mut state = ScanState::starting_at(ms(500), DEFAULT_RETRY_LIMIT);
        let result = state.harvest(vec![missing], 0, &fx.out);
        assert_eq!(result.errors, 1);
        assert_eq!(result.watermark, ms(500));
    }

    #[test]
    fn test_same_millisecond_files_across_passes() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.out).unwrap();
        let mut a = fx.candidate("a.jpg", 0);
        a.created = Watermark::from_nanos(200_300_000);
        let mut b = fx.candidate("b.jpg", 0);
        b.created = Watermark::from_nanos(200_700_000);

        let mut state = ScanState::starting_at(Watermark::EPOCH, DEFAULT_RETRY_LIMIT);
        let first = state.harvest(vec![a.clone()], 0, &fx.out);
        assert_eq!(first.copied, 1);
        assert_eq!(first.watermark, a.created);

        // b shows up later within the same millisecond as a
        let second = state.harvest(vec![a, b.clone()], 0, &fx.out);
        assert_eq!(second.copied, 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.watermark, b.created);
        assert_eq!(fx.output_count(), 2);
    }

    #[test]
    fn test_failing_file_released_after_retry_limit() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.out).unwrap();
        let gone = Candidate {
            path: fx.src.join("gone.jpg"),
            created: ms(200),
        };

        let mut state = ScanState::starting_at(Watermark::EPOCH, 3);
        let mut seen = vec![gone];
        let mut last = Watermark::EPOCH;
        for pass in 1..=3u64 {
            let shot = fx.candidate(&format!("shot{}.jpg", pass), 300 + pass);
            last = shot.created;
            seen.push(shot);

            let result = state.harvest(seen.clone(), 0, &fx.out);
            assert_eq!(result.copied, 1, "pass {}", pass);
            assert_eq!(result.errors, 1, "pass {}", pass);
            if pass < 3 {
                assert_eq!(result.watermark, ms(200).just_before(), "pass {}", pass);
            }
        }

        // Third failure gives up: the watermark moves on and nothing lingers
        assert_eq!(state.watermark, last);
        assert!(state.unsettled.is_empty());
        assert!(state.failures.is_empty());
        assert_eq!(fx.output_count(), 3);

        let after = state.harvest(seen, 0, &fx.out);
        assert_eq!(after.copied, 0);
        assert_eq!(after.errors, 0);
    }

    #[test]
    fn test_zero_retry_limit_never_holds() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.out).unwrap();
        let gone = Candidate {
            path: fx.src.join("gone.jpg"),
            created: ms(200),
        };
        let shot = fx.candidate("shot.jpg", 300);

        let mut state = ScanState::starting_at(Watermark::EPOCH, 0);
        let result = state.harvest(vec![gone, shot], 1, &fx.out);
        assert_eq!(result.errors, 2);
        assert_eq!(result.watermark, ms(300));
    }

    #[test]
    fn test_unreadable_entries_hold_watermark() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.out).unwrap();
        let newer = fx.candidate("visible/new.jpg", 300);

        // A subdirectory could not be read this pass
        let mut state = ScanState::starting_at(ms(100), DEFAULT_RETRY_LIMIT);
        let first = state.harvest(vec![newer.clone()], 1, &fx.out);
        assert_eq!(first.copied, 1);
        assert_eq!(first.errors, 1);
        assert_eq!(first.watermark, ms(100));

        // Once readable, its older file is still harvested, without
        // copying new.jpg a second time
        let hidden = fx.candidate("flaky/older.jpg", 200);
        let second = state.harvest(vec![hidden, newer], 0, &fx.out);
        assert_eq!(second.copied, 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.watermark, ms(300));
        assert!(state.unsettled.is_empty());
        assert_eq!(fx.output_count(), 2);
    }

    #[test]
    fn test_persistent_walk_errors_released_after_retry_limit() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.out).unwrap();
        let shot = fx.candidate("shot.jpg", 300);

        let mut state = ScanState::starting_at(Watermark::EPOCH, 2);
        let first = state.harvest(vec![shot.clone()], 1, &fx.out);
        assert_eq!(first.watermark, Watermark::EPOCH);

        let second = state.harvest(vec![shot], 1, &fx.out);
        assert_eq!(second.copied, 0);
        assert_eq!(second.watermark, ms(300));
        assert!(state.unsettled.is_empty());
    }

    #[tokio::test]
    async fn test_run_pass_persists_only_on_change() {
        let fx = Fixture::new();
        fs::write(fx.src.join("a.jpg"), b"a").unwrap();
        fs::create_dir_all(fx.src.join("thumbnails")).unwrap();
        fs::write(fx.src.join("thumbnails/b.jpg"), b"b").unwrap();
        fs::write(fx.src.join("photo.png"), b"p").unwrap();

        let mut harvester = Harvester::initialize(fx.config(), MemoryStore::default())
            .await
            .unwrap();

        let first = harvester.run_pass().await.unwrap();
        assert_eq!(first.copied, 1);
        assert!(first.advanced());

        let second = harvester.run_pass().await.unwrap();
        assert_eq!(second.copied, 0);
        assert_eq!(second.watermark, first.watermark);

        let writes = harvester.store.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![first.watermark]);
    }

    #[tokio::test]
    async fn test_first_pass_always_persists() {
        let fx = Fixture::new();
        let store = MemoryStore {
            initial: Some(ms(42)),
            ..Default::default()
        };
        let mut harvester = Harvester::initialize(fx.config(), store).await.unwrap();

        let result = harvester.run_pass().await.unwrap();
        assert_eq!(result.copied, 0);
        assert!(!harvester.persist_watermark().await.unwrap());
        let writes = harvester.store.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![ms(42)]);
    }
}
