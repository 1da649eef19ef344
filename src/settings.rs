//! Persistent named settings surviving restarts.

use crate::Error;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const AVG_DISCHARGE: &str = "AvgDischarge";
pub const TOTAL_AH_DRAWN: &str = "TotalAhDrawn";
pub const TIME_LAST_FULL: &str = "TimeLastFull";
pub const MIN_CELL_VOLTAGE: &str = "MinCellVoltage";
pub const MAX_CELL_VOLTAGE: &str = "MaxCellVoltage";
pub const CAPACITY: &str = "Capacity";
pub const SOH: &str = "Soh";
/// Local date of the last daily statistics reset, in days from CE.
pub const LAST_DAILY_RESET: &str = "LastDailyReset";
pub const INTERVAL: &str = "Interval";

/// Analytics interval bounds in ms.
pub const INTERVAL_DEFAULT: u64 = 50;
pub const INTERVAL_MIN: u64 = 50;
pub const INTERVAL_MAX: u64 = 200;

pub trait SettingsStore: Send {
    fn get(&self, key: &str) -> Option<f64>;

    /// Stores `value`, it has to be durable once this returns.
    fn set(&mut self, key: &str, value: f64) -> Result<(), Error>;
}

/// Reads the analytics interval, clamped to the supported range.
pub fn analytics_interval(store: &dyn SettingsStore) -> Duration {
    let ms = store
        .get(INTERVAL)
        .map(|v| v.max(0.0) as u64)
        .unwrap_or(INTERVAL_DEFAULT)
        .clamp(INTERVAL_MIN, INTERVAL_MAX);
    Duration::from_millis(ms)
}

/// Non-persistent store, for tests and running without a settings file.
#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    values: BTreeMap<String, f64>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    fn set(&mut self, key: &str, value: f64) -> Result<(), Error> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

/// YAML file of `name: value` pairs, rewritten on every change.
#[derive(Debug)]
pub struct YamlSettings {
    path: PathBuf,
    values: BTreeMap<String, f64>,
}

impl YamlSettings {
    /// Opens the settings file, a missing file starts out empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::File::open(&path) {
            Ok(file) => serde_yaml::from_reader(file)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Settings file {path:?} not found, starting with defaults");
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        log::debug!("Loaded settings from {path:?}: {values:?}");
        Ok(Self { path, values })
    }

    fn save(&self) -> Result<(), Error> {
        // Replace the file in one rename
        let tmp = self.path.with_extension("tmp");
        let file = std::fs::File::create(&tmp)?;
        serde_yaml::to_writer(&file, &self.values)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SettingsStore for YamlSettings {
    fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    fn set(&mut self, key: &str, value: f64) -> Result<(), Error> {
        if self.values.get(key) == Some(&value) {
            return Ok(());
        }
        self.values.insert(key.to_string(), value);
        self.save()
    }
}
