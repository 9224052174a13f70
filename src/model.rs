use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Creation-time threshold, in nanoseconds since the Unix epoch.
///
/// Files created at or before the watermark are considered harvested. On disk
/// it is written as milliseconds, with a fractional part down to the
/// microsecond when needed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(u64);

const NANOS_PER_MICRO: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;

impl Watermark {
    pub const EPOCH: Watermark = Watermark(0);

    pub fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    pub fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(NANOS_PER_MILLI))
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Whole milliseconds, truncated.
    pub fn as_millis(self) -> u64 {
        self.0 / NANOS_PER_MILLI
    }

    /// The instant one nanosecond earlier, saturating at the epoch.
    pub fn just_before(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Converts a filesystem timestamp; times before the epoch clamp to 0.
    pub fn from_system_time(time: SystemTime) -> Self {
        let ns = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        Self(u64::try_from(ns).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}ms",
            self.0 / NANOS_PER_MILLI,
            self.0 % NANOS_PER_MILLI
        )
    }
}

impl Serialize for Watermark {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Floored to the microsecond so the value fits an f64 exactly; a
        // reload can only land at or below the in-memory watermark
        let micros = self.0 / NANOS_PER_MICRO;
        if micros % 1_000 == 0 {
            serializer.serialize_u64(micros / 1_000)
        } else {
            serializer.serialize_f64(micros as f64 / 1_000.0)
        }
    }
}

impl<'de> Deserialize<'de> for Watermark {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Birth times may be fractional (e.g. 1689012345678.123)
        let number = serde_json::Number::deserialize(deserializer)?;
        if let Some(ms) = number.as_u64() {
            return Ok(Watermark::from_millis(ms));
        }
        match number.as_f64() {
            Some(ms) if ms.is_finite() && ms >= 0.0 => {
                let micros = (ms * 1_000.0).round() as u64;
                Ok(Watermark(micros.saturating_mul(NANOS_PER_MICRO)))
            }
            _ => Err(serde::de::Error::custom(format!(
                "invalid watermark value: {}",
                number
            ))),
        }
    }
}

/// On-disk shape of the persisted harvester state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub last_scan_time: Watermark,
}

/// Outcome of one scan-and-copy pass.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Number of files copied to the output directory
    pub copied: usize,

    /// Candidates at or below the starting watermark
    pub skipped: usize,

    /// Entries that could not be walked, stat'ed or copied
    pub errors: usize,

    /// Threshold every decision in this pass was made against
    pub started_at: Watermark,

    /// Watermark after the pass
    pub watermark: Watermark,

    pub stats: HarvestStats,
}

impl ScanResult {
    pub fn advanced(&self) -> bool {
        self.watermark > self.started_at
    }
}

/// Timing and volume figures for a pass.
#[derive(Debug, Default, Clone)]
pub struct HarvestStats {
    /// Total time spent on the pass (milliseconds)
    pub duration_ms: u64,

    /// Bytes written to the output directory
    pub bytes_copied: u64,
}
