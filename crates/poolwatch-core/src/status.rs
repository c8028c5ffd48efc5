//! Device and scan status records.
//!
//! The volume manager publishes both records as `uint64` arrays inside a vdev
//! node. A device record of the wrong size means the layout changed under us
//! and is reported loudly; a scan record of the wrong size (or none at all) is
//! normal on pools that never scrubbed and degrades to [`ScanStat::none`].

use crate::error::{PoolwatchError, PoolwatchResult};
use crate::property::PropertyTree;
use serde::{Deserialize, Serialize};

/// Key of the device statistics array in a vdev node.
pub const VDEV_STATS_KEY: &str = "vdev_stats";
/// Key of the scan statistics array in the root vdev node.
pub const SCAN_STATS_KEY: &str = "scan_stats";

/// Number of words in a device statistics record.
pub const VDEV_STAT_WORDS: usize = 47;
/// Number of words in a scan statistics record.
pub const SCAN_STAT_WORDS: usize = 15;

const WORD: usize = std::mem::size_of::<u64>();

mod vs {
    pub const TIMESTAMP: usize = 0;
    pub const STATE: usize = 1;
    pub const AUX: usize = 2;
    pub const ALLOC: usize = 3;
    pub const SPACE: usize = 4;
    pub const DSPACE: usize = 5;
    pub const READ_ERRORS: usize = 20;
    pub const WRITE_ERRORS: usize = 21;
    pub const CHECKSUM_ERRORS: usize = 22;
    pub const FRAGMENTATION: usize = 27;
}

mod pss {
    pub const FUNC: usize = 0;
    pub const STATE: usize = 1;
    pub const START_TIME: usize = 2;
    pub const END_TIME: usize = 3;
    pub const TO_EXAMINE: usize = 4;
    pub const EXAMINED: usize = 5;
    pub const SKIPPED: usize = 6;
    pub const PROCESSED: usize = 7;
    pub const ERRORS: usize = 8;
    pub const PASS_EXAM: usize = 9;
    pub const PASS_START: usize = 10;
    pub const PASS_SCRUB_PAUSE: usize = 11;
    pub const PASS_SCRUB_SPENT_PAUSED: usize = 12;
    pub const PASS_ISSUED: usize = 13;
    pub const ISSUED: usize = 14;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VDevState {
    Unknown,
    Closed,
    Offline,
    Removed,
    CantOpen,
    Faulted,
    Degraded,
    Healthy,
}

impl VDevState {
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            1 => VDevState::Closed,
            2 => VDevState::Offline,
            3 => VDevState::Removed,
            4 => VDevState::CantOpen,
            5 => VDevState::Faulted,
            6 => VDevState::Degraded,
            7 => VDevState::Healthy,
            _ => VDevState::Unknown,
        }
    }

    pub fn raw(self) -> u64 {
        match self {
            VDevState::Unknown => 0,
            VDevState::Closed => 1,
            VDevState::Offline => 2,
            VDevState::Removed => 3,
            VDevState::CantOpen => 4,
            VDevState::Faulted => 5,
            VDevState::Degraded => 6,
            VDevState::Healthy => 7,
        }
    }
}

/// Auxiliary state codes that refine `CantOpen`/`Faulted`.
pub mod aux {
    pub const NONE: u64 = 0;
    pub const OPEN_FAILED: u64 = 1;
    pub const CORRUPT_DATA: u64 = 2;
    pub const NO_REPLICAS: u64 = 3;
    pub const BAD_GUID_SUM: u64 = 4;
    pub const TOO_SMALL: u64 = 5;
    pub const BAD_LABEL: u64 = 6;
    pub const VERSION_NEWER: u64 = 7;
    pub const VERSION_OLDER: u64 = 8;
    pub const UNSUP_FEAT: u64 = 9;
    pub const SPARED: u64 = 10;
    pub const ERR_EXCEEDED: u64 = 11;
    pub const IO_FAILURE: u64 = 12;
    pub const BAD_LOG: u64 = 13;
    pub const EXTERNAL: u64 = 14;
    pub const SPLIT_POOL: u64 = 15;
}

/// Human-facing description of a device state.
pub fn describe_vdev_state(state: VDevState, aux_state: u64) -> &'static str {
    match state {
        VDevState::Unknown => "Unknown",
        VDevState::Closed => "Closed",
        VDevState::Offline => "Offline",
        VDevState::Removed => "Removed",
        VDevState::CantOpen => match aux_state {
            aux::OPEN_FAILED => "Can't open: open failed",
            aux::CORRUPT_DATA => "Can't open: corrupt data",
            aux::NO_REPLICAS => "Can't open: insufficient replicas",
            aux::BAD_GUID_SUM => "Can't open: missing devices",
            aux::TOO_SMALL => "Can't open: device too small",
            aux::BAD_LABEL => "Can't open: invalid label",
            aux::VERSION_NEWER => "Can't open: newer on-disk version",
            aux::VERSION_OLDER => "Can't open: older on-disk version",
            aux::UNSUP_FEAT => "Can't open: unsupported feature",
            aux::BAD_LOG => "Can't open: log device failed",
            _ => "Can't open",
        },
        VDevState::Faulted => match aux_state {
            aux::CORRUPT_DATA => "Faulted: corrupt data",
            aux::ERR_EXCEEDED => "Faulted: too many errors",
            aux::IO_FAILURE => "Faulted: I/O failure",
            aux::EXTERNAL => "Faulted: external fault",
            aux::SPLIT_POOL => "Faulted: split pool",
            _ => "Faulted",
        },
        VDevState::Degraded => "Degraded",
        VDevState::Healthy => match aux_state {
            aux::SPARED => "Healthy: in use as spare",
            _ => "Healthy",
        },
    }
}

/// Device status counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VDevStat {
    pub timestamp: u64,
    pub state: VDevState,
    pub aux: u64,
    pub alloc: u64,
    pub space: u64,
    pub deflated_space: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub checksum_errors: u64,
    pub fragmentation: u64,
}

impl VDevStat {
    /// Reinterpret a raw record. The length must match exactly.
    pub fn from_words(words: &[u64]) -> PoolwatchResult<Self> {
        if words.len() != VDEV_STAT_WORDS {
            return Err(PoolwatchError::MalformedRecord {
                record: "vdev_stat",
                expected: VDEV_STAT_WORDS * WORD,
                actual: words.len() * WORD,
            });
        }
        Ok(Self {
            timestamp: words[vs::TIMESTAMP],
            state: VDevState::from_raw(words[vs::STATE]),
            aux: words[vs::AUX],
            alloc: words[vs::ALLOC],
            space: words[vs::SPACE],
            deflated_space: words[vs::DSPACE],
            read_errors: words[vs::READ_ERRORS],
            write_errors: words[vs::WRITE_ERRORS],
            checksum_errors: words[vs::CHECKSUM_ERRORS],
            fragmentation: words[vs::FRAGMENTATION],
        })
    }

    /// Lay the record out as the volume manager does; unmodelled words are zero.
    pub fn to_words(&self) -> Vec<u64> {
        let mut words = vec![0u64; VDEV_STAT_WORDS];
        words[vs::TIMESTAMP] = self.timestamp;
        words[vs::STATE] = self.state.raw();
        words[vs::AUX] = self.aux;
        words[vs::ALLOC] = self.alloc;
        words[vs::SPACE] = self.space;
        words[vs::DSPACE] = self.deflated_space;
        words[vs::READ_ERRORS] = self.read_errors;
        words[vs::WRITE_ERRORS] = self.write_errors;
        words[vs::CHECKSUM_ERRORS] = self.checksum_errors;
        words[vs::FRAGMENTATION] = self.fragmentation;
        words
    }

    pub fn with_state(state: VDevState) -> Self {
        Self {
            timestamp: 0,
            state,
            aux: aux::NONE,
            alloc: 0,
            space: 0,
            deflated_space: 0,
            read_errors: 0,
            write_errors: 0,
            checksum_errors: 0,
            fragmentation: 0,
        }
    }

    /// Read, write and checksum errors together, capped at `u64::MAX`.
    pub fn error_count(&self) -> u64 {
        self.read_errors
            .saturating_add(self.write_errors)
            .saturating_add(self.checksum_errors)
    }

    pub fn describe(&self) -> &'static str {
        describe_vdev_state(self.state, self.aux)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanFunction {
    None,
    Scrub,
    Resilver,
}

impl ScanFunction {
    fn from_raw(raw: u64) -> Self {
        match raw {
            1 => ScanFunction::Scrub,
            2 => ScanFunction::Resilver,
            _ => ScanFunction::None,
        }
    }

    fn raw(self) -> u64 {
        match self {
            ScanFunction::None => 0,
            ScanFunction::Scrub => 1,
            ScanFunction::Resilver => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    None,
    Scanning,
    Finished,
    Canceled,
}

impl ScanState {
    fn from_raw(raw: u64) -> Self {
        match raw {
            1 => ScanState::Scanning,
            2 => ScanState::Finished,
            3 => ScanState::Canceled,
            _ => ScanState::None,
        }
    }

    fn raw(self) -> u64 {
        match self {
            ScanState::None => 0,
            ScanState::Scanning => 1,
            ScanState::Finished => 2,
            ScanState::Canceled => 3,
        }
    }
}

/// Scrub / resilver progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStat {
    pub function: ScanFunction,
    pub state: ScanState,
    pub start_time: u64,
    pub end_time: u64,
    pub to_examine: u64,
    pub examined: u64,
    pub skipped: u64,
    pub processed: u64,
    pub errors: u64,
    pub pass_examined: u64,
    pub pass_start: u64,
    pub pass_scrub_pause: u64,
    pub pass_scrub_spent_paused: u64,
    pub pass_issued: u64,
    pub issued: u64,
}

impl ScanStat {
    /// The record of a pool that has never been scanned.
    pub fn none() -> Self {
        Self {
            function: ScanFunction::None,
            state: ScanState::None,
            start_time: 0,
            end_time: 0,
            to_examine: 0,
            examined: 0,
            skipped: 0,
            processed: 0,
            errors: 0,
            pass_examined: 0,
            pass_start: 0,
            pass_scrub_pause: 0,
            pass_scrub_spent_paused: 0,
            pass_issued: 0,
            issued: 0,
        }
    }

    /// Reinterpret a raw record, falling back to [`ScanStat::none`] on any size mismatch.
    pub fn from_words(words: &[u64]) -> Self {
        if words.len() != SCAN_STAT_WORDS {
            log::debug!(
                "ignoring scan_stats record of {} words (expected {})",
                words.len(),
                SCAN_STAT_WORDS
            );
            return Self::none();
        }
        Self {
            function: ScanFunction::from_raw(words[pss::FUNC]),
            state: ScanState::from_raw(words[pss::STATE]),
            start_time: words[pss::START_TIME],
            end_time: words[pss::END_TIME],
            to_examine: words[pss::TO_EXAMINE],
            examined: words[pss::EXAMINED],
            skipped: words[pss::SKIPPED],
            processed: words[pss::PROCESSED],
            errors: words[pss::ERRORS],
            pass_examined: words[pss::PASS_EXAM],
            pass_start: words[pss::PASS_START],
            pass_scrub_pause: words[pss::PASS_SCRUB_PAUSE],
            pass_scrub_spent_paused: words[pss::PASS_SCRUB_SPENT_PAUSED],
            pass_issued: words[pss::PASS_ISSUED],
            issued: words[pss::ISSUED],
        }
    }

    pub fn to_words(&self) -> Vec<u64> {
        let mut words = vec![0u64; SCAN_STAT_WORDS];
        words[pss::FUNC] = self.function.raw();
        words[pss::STATE] = self.state.raw();
        words[pss::START_TIME] = self.start_time;
        words[pss::END_TIME] = self.end_time;
        words[pss::TO_EXAMINE] = self.to_examine;
        words[pss::EXAMINED] = self.examined;
        words[pss::SKIPPED] = self.skipped;
        words[pss::PROCESSED] = self.processed;
        words[pss::ERRORS] = self.errors;
        words[pss::PASS_EXAM] = self.pass_examined;
        words[pss::PASS_START] = self.pass_start;
        words[pss::PASS_SCRUB_PAUSE] = self.pass_scrub_pause;
        words[pss::PASS_SCRUB_SPENT_PAUSED] = self.pass_scrub_spent_paused;
        words[pss::PASS_ISSUED] = self.pass_issued;
        words[pss::ISSUED] = self.issued;
        words
    }

    pub fn is_paused(&self) -> bool {
        self.state == ScanState::Scanning && self.pass_scrub_pause != 0
    }

    /// Fraction of the work issued so far, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.to_examine == 0 {
            return 0.0;
        }
        (self.issued as f64 / self.to_examine as f64).min(1.0)
    }
}

/// Extract the device record of a vdev node.
pub fn vdev_stat(vdev: &PropertyTree<'_>) -> PoolwatchResult<VDevStat> {
    let words: &[u64] = vdev.lookup(VDEV_STATS_KEY)?;
    VDevStat::from_words(words)
}

/// Extract the scan record of a root vdev node; never fails.
pub fn scan_stat(vdev: &PropertyTree<'_>) -> ScanStat {
    match vdev.lookup::<&[u64]>(SCAN_STATS_KEY) {
        Ok(words) => ScanStat::from_words(words),
        Err(_) => ScanStat::none(),
    }
}

const METRIC_PREFIXES: &[(u64, &str)] = &[
    (1_000_000_000_000_000_000, "E"),
    (1_000_000_000_000_000, "P"),
    (1_000_000_000_000, "T"),
    (1_000_000_000, "G"),
    (1_000_000, "M"),
    (1_000, "k"),
];

/// Format a byte count with a metric prefix and two decimals.
pub fn format_bytes(bytes: u64) -> String {
    for (factor, prefix) in METRIC_PREFIXES {
        if bytes > *factor {
            return format!("{:.2} {}B", bytes as f64 / *factor as f64, prefix);
        }
    }
    format!("{} B", bytes)
}
