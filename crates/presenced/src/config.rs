use chrono::{FixedOffset, Offset, Utc};
use presence_core::ExtractorKind;
use serde::Deserialize;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_DIMENSION: usize = 512;
const DEFAULT_MAX_SNAPSHOT_BYTES: usize = 10 * 1024 * 1024;

const COOLDOWN_RANGE: RangeInclusive<u64> = 0..=7 * 24 * 3600;
const ROSTER_REFRESH_RANGE: RangeInclusive<u64> = 1..=24 * 3600;
const PHOTO_TTL_RANGE: RangeInclusive<u32> = 1..=3650;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(format!("unknown bus {other:?} (expected session or system)")),
        }
    }
}

/// Daemon configuration: TOML file first, then `PRESENCE_*` environment overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// Attendance ledger database (created if missing).
    pub ledger_db_path: PathBuf,
    /// Enrollment database, opened read-only.
    pub enrollment_db_path: PathBuf,
    pub extractor: ExtractorKind,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Embedding length produced by the mock extractor.
    pub embedding_dimension: usize,
    pub extract_timeout_secs: u64,
    pub engine_workers: usize,
    pub cooldown_secs: u64,
    pub roster_refresh_secs: u64,
    /// Office offset from UTC; defines "today".
    pub utc_offset_minutes: i32,
    pub enforce_workday: bool,
    pub workday_start_hour: u32,
    pub workday_end_hour: u32,
    pub max_snapshot_bytes: usize,
    /// Debug photo archive; disabled when unset.
    pub photo_dir: Option<PathBuf>,
    pub photo_ttl_days: u32,
    pub bus: BusKind,
}

/// On-disk shape of `presenced.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub ledger_db_path: Option<PathBuf>,
    pub enrollment_db_path: Option<PathBuf>,
    pub extractor: Option<String>,
    pub model_dir: Option<PathBuf>,
    pub embedding_dimension: Option<usize>,
    pub extract_timeout_secs: Option<u64>,
    pub engine_workers: Option<usize>,
    pub cooldown_secs: Option<u64>,
    pub roster_refresh_secs: Option<u64>,
    pub utc_offset_minutes: Option<i32>,
    pub enforce_workday: Option<bool>,
    pub workday_start_hour: Option<u32>,
    pub workday_end_hour: Option<u32>,
    pub max_snapshot_bytes: Option<usize>,
    pub photo_dir: Option<PathBuf>,
    pub photo_ttl_days: Option<u32>,
    pub bus: Option<String>,
}

impl FileConfig {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

impl Config {
    /// Load from the config file (if present) and the process environment.
    pub fn load() -> Self {
        let explicit = std::env::var_os("PRESENCE_CONFIG").map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(|| config_dir().join("presenced.toml"));

        let file = if path.exists() {
            match FileConfig::read(&path) {
                Ok(file) => {
                    tracing::info!(path = %path.display(), "config file loaded");
                    file
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
                    FileConfig::default()
                }
            }
        } else {
            if explicit.is_some() {
                tracing::warn!(path = %path.display(), "PRESENCE_CONFIG points at a missing file");
            }
            FileConfig::default()
        };

        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Merge file values with environment overrides. Invalid values fall back
    /// to defaults with a warning.
    pub fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = data_dir();
        let source = Source { env: &env };

        let extractor = source.parsed("PRESENCE_EXTRACTOR", file.extractor.as_deref(), ExtractorKind::Mock);
        let bus = source.parsed("PRESENCE_BUS", file.bus.as_deref(), BusKind::Session);

        let mut workday_start_hour = source.value("PRESENCE_WORKDAY_START_HOUR", file.workday_start_hour, 6);
        let mut workday_end_hour = source.value("PRESENCE_WORKDAY_END_HOUR", file.workday_end_hour, 23);
        if workday_start_hour >= workday_end_hour || workday_end_hour > 24 {
            tracing::warn!(
                start = workday_start_hour,
                end = workday_end_hour,
                "invalid work-day window; using 06-23"
            );
            workday_start_hour = 6;
            workday_end_hour = 23;
        }

        let mut utc_offset_minutes =
            source.value("PRESENCE_UTC_OFFSET_MINUTES", file.utc_offset_minutes, local_offset_minutes());
        if utc_offset_minutes.abs() >= 24 * 60 {
            tracing::warn!(utc_offset_minutes, "UTC offset out of range; using UTC");
            utc_offset_minutes = 0;
        }

        Self {
            ledger_db_path: source
                .path("PRESENCE_LEDGER_DB_PATH", file.ledger_db_path)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            enrollment_db_path: source
                .path("PRESENCE_ENROLLMENT_DB_PATH", file.enrollment_db_path)
                .unwrap_or_else(|| data_dir.join("enrollment.db")),
            extractor,
            model_dir: source
                .path("PRESENCE_MODEL_DIR", file.model_dir)
                .unwrap_or_else(|| data_dir.join("models")),
            embedding_dimension: source
                .value("PRESENCE_EMBEDDING_DIMENSION", file.embedding_dimension, DEFAULT_DIMENSION)
                .max(1),
            extract_timeout_secs: source
                .value("PRESENCE_EXTRACT_TIMEOUT_SECS", file.extract_timeout_secs, 10)
                .max(1),
            engine_workers: source.value("PRESENCE_ENGINE_WORKERS", file.engine_workers, 2).max(1),
            cooldown_secs: source.bounded("PRESENCE_COOLDOWN_SECS", file.cooldown_secs, 300, COOLDOWN_RANGE),
            roster_refresh_secs: source.bounded(
                "PRESENCE_ROSTER_REFRESH_SECS",
                file.roster_refresh_secs,
                30,
                ROSTER_REFRESH_RANGE,
            ),
            utc_offset_minutes,
            enforce_workday: source.flag("PRESENCE_ENFORCE_WORKDAY", file.enforce_workday, false),
            workday_start_hour,
            workday_end_hour,
            max_snapshot_bytes: source.value(
                "PRESENCE_MAX_SNAPSHOT_BYTES",
                file.max_snapshot_bytes,
                DEFAULT_MAX_SNAPSHOT_BYTES,
            ),
            photo_dir: source.path("PRESENCE_PHOTO_DIR", file.photo_dir),
            photo_ttl_days: source.bounded("PRESENCE_PHOTO_TTL_DAYS", file.photo_ttl_days, 7, PHOTO_TTL_RANGE),
            bus,
        }
    }

    pub fn office_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

struct Source<'a, F: Fn(&str) -> Option<String>> {
    env: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Source<'_, F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.env)(key).filter(|v| !v.trim().is_empty())
    }

    fn value<T: FromStr>(&self, key: &str, file: Option<T>, default: T) -> T {
        match self.raw(key) {
            Some(v) => match v.trim().parse() {
                Ok(parsed) => parsed,
                Err(_) => {
                    tracing::warn!(key, value = %v, "invalid value; using default");
                    default
                }
            },
            None => file.unwrap_or(default),
        }
    }

    fn bounded<T>(&self, key: &str, file: Option<T>, default: T, range: RangeInclusive<T>) -> T
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let value = self.value(key, file, default);
        if range.contains(&value) {
            value
        } else {
            tracing::warn!(
                key,
                %value,
                min = %range.start(),
                max = %range.end(),
                "value out of range; using default"
            );
            default
        }
    }

    fn parsed<T: FromStr<Err = String>>(&self, key: &str, file: Option<&str>, default: T) -> T {
        let Some(v) = self.raw(key).or_else(|| file.map(str::to_string)) else {
            return default;
        };
        v.parse().unwrap_or_else(|e: String| {
            tracing::warn!(key, error = %e, "invalid value; using default");
            default
        })
    }

    fn flag(&self, key: &str, file: Option<bool>, default: bool) -> bool {
        match self.raw(key) {
            Some(v) => !matches!(v.trim(), "0" | "false" | "no" | "off"),
            None => file.unwrap_or(default),
        }
    }

    fn path(&self, key: &str, file: Option<PathBuf>) -> Option<PathBuf> {
        self.raw(key).map(PathBuf::from).or(file)
    }
}

fn local_offset_minutes() -> i32 {
    chrono::Local::now().offset().local_minus_utc() / 60
}

fn home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local/share"))
        .join("presence")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("presence")
}
