//! Energy and ampere-hour accounting with a daily statistics reset.
//!
//! Accounting runs once per wall-clock minute, the daily statistics roll over
//! at [`DAILY_RESET_HOUR`] local time. Every update first applies all of its
//! changes in memory, then writes the changed values to the settings store.
//! A value that could not be written stays queued and is written again on the
//! next update or on [`HistoryTracker::flush`].

use crate::settings::{self, SettingsStore};
use crate::state::BatteryState;
use crate::Error;
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use serde::Serialize;
use std::collections::BTreeSet;

pub const DAILY_RESET_HOUR: u32 = 6;

/// One minute in hours, for Ah and kWh per minute sample.
const AH_PER_MINUTE: f64 = 0.016667;
const KWH_PER_WATT_MINUTE: f64 = 1.666667e-5;
/// Seconds per hour over percent.
const SECONDS_PER_PERCENT_HOUR: f64 = 36.0;
const ROLLING_DAYS: f64 = 7.0;
/// Capacity is only re-estimated from a deep enough discharge.
const CAPACITY_ESTIMATE_MAX_SOC: u8 = 70;
const FULL_CHARGE_MAX_AGE_SECS: i64 = 24 * 3600;

const HISTORY_KEYS: [&str; 8] = [
    settings::AVG_DISCHARGE,
    settings::TOTAL_AH_DRAWN,
    settings::TIME_LAST_FULL,
    settings::MIN_CELL_VOLTAGE,
    settings::MAX_CELL_VOLTAGE,
    settings::CAPACITY,
    settings::SOH,
    settings::LAST_DAILY_RESET,
];

/// Seconds until full, `current` in A and positive while charging.
pub fn time_to_full(soc: u8, capacity: f64, current: f64) -> f64 {
    let charge = (100.0 - f64::from(soc)) * capacity * SECONDS_PER_PERCENT_HOUR;
    if current == 0.0 {
        return f64::from(soc) * capacity * SECONDS_PER_PERCENT_HOUR;
    }
    charge / current
}

/// Seconds until empty, `current` in A and negative while discharging.
pub fn time_to_go(soc: u8, capacity: f64, current: f64) -> f64 {
    let charge = f64::from(soc) * capacity * SECONDS_PER_PERCENT_HOUR;
    if current == 0.0 {
        return charge;
    }
    charge / -current
}

/// History values kept across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryState {
    /// Trailing seven day average of the daily discharged energy in kWh.
    pub average_discharge: f64,
    /// Signed, negative while discharging.
    pub total_ah_drawn: f64,
    /// Unix timestamp of the last full charge.
    pub time_last_full: Option<i64>,
    pub min_cell_voltage: f64,
    pub max_cell_voltage: f64,
    /// Capacity in Ah estimated from the last deep discharge.
    pub capacity: Option<f64>,
    pub soh: Option<f64>,
    /// Local date the daily statistics were last rolled over.
    pub last_daily_reset: Option<NaiveDate>,
}

impl HistoryState {
    pub fn load(store: &dyn SettingsStore) -> Self {
        Self {
            average_discharge: store.get(settings::AVG_DISCHARGE).unwrap_or_default(),
            total_ah_drawn: store.get(settings::TOTAL_AH_DRAWN).unwrap_or_default(),
            time_last_full: store
                .get(settings::TIME_LAST_FULL)
                .filter(|t| *t > 0.0)
                .map(|t| t as i64),
            min_cell_voltage: store.get(settings::MIN_CELL_VOLTAGE).unwrap_or_default(),
            max_cell_voltage: store.get(settings::MAX_CELL_VOLTAGE).unwrap_or_default(),
            capacity: store.get(settings::CAPACITY),
            soh: store.get(settings::SOH),
            last_daily_reset: store
                .get(settings::LAST_DAILY_RESET)
                .and_then(|days| NaiveDate::from_num_days_from_ce_opt(days as i32)),
        }
    }

    /// Stored representation of the value kept under `key`.
    fn value(&self, key: &str) -> Option<f64> {
        match key {
            settings::AVG_DISCHARGE => Some(self.average_discharge),
            settings::TOTAL_AH_DRAWN => Some(self.total_ah_drawn),
            settings::TIME_LAST_FULL => self.time_last_full.map(|t| t as f64),
            settings::MIN_CELL_VOLTAGE => Some(self.min_cell_voltage),
            settings::MAX_CELL_VOLTAGE => Some(self.max_cell_voltage),
            settings::CAPACITY => self.capacity,
            settings::SOH => self.soh,
            settings::LAST_DAILY_RESET => self
                .last_daily_reset
                .map(|date| f64::from(date.num_days_from_ce())),
            _ => None,
        }
    }

    pub fn save(&self, store: &mut dyn SettingsStore) -> Result<(), Error> {
        for key in HISTORY_KEYS {
            if let Some(value) = self.value(key) {
                store.set(key, value)?;
            }
        }
        Ok(())
    }
}

/// Published view of the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryReport {
    #[serde(flatten)]
    pub history: HistoryState,
    pub charged_energy: f64,
    pub discharged_energy: f64,
    pub consumed_amphours: f64,
    pub time_to_go: Option<f64>,
    pub time_to_full: Option<f64>,
}

#[derive(Debug)]
pub struct HistoryTracker {
    history: HistoryState,
    installed_capacity: f64,
    /// Today's energy in kWh.
    charged_energy: f64,
    discharged_energy: f64,
    /// Ah since the last full charge, negative while discharging.
    consumed_amphours: f64,
    time_to_go: Option<f64>,
    time_to_full: Option<f64>,
    last_minute: Option<NaiveDateTime>,
    last_full: Option<NaiveDate>,
    /// Keys changed in memory and not yet written.
    pending: BTreeSet<&'static str>,
}

impl HistoryTracker {
    pub fn new(history: HistoryState, installed_capacity: f64) -> Self {
        let last_full = history
            .time_last_full
            .and_then(|t| Local.timestamp_opt(t, 0).single())
            .map(|t| t.date_naive());
        Self {
            history,
            installed_capacity,
            charged_energy: 0.0,
            discharged_energy: 0.0,
            consumed_amphours: 0.0,
            time_to_go: None,
            time_to_full: None,
            last_minute: None,
            last_full,
            pending: BTreeSet::new(),
        }
    }

    pub fn load(store: &dyn SettingsStore, installed_capacity: f64) -> Self {
        let history = HistoryState::load(store);
        log::debug!("Loaded history: {history:?}");
        Self::new(history, installed_capacity)
    }

    pub fn history(&self) -> &HistoryState {
        &self.history
    }

    pub fn report(&self) -> HistoryReport {
        HistoryReport {
            history: self.history.clone(),
            charged_energy: self.charged_energy,
            discharged_energy: self.discharged_energy,
            consumed_amphours: self.consumed_amphours,
            time_to_go: self.time_to_go,
            time_to_full: self.time_to_full,
        }
    }

    /// Writes all history values, used on shutdown.
    pub fn flush(&mut self, store: &mut dyn SettingsStore) -> Result<(), Error> {
        log::debug!("Saving history to settings");
        self.history.save(store)?;
        self.pending.clear();
        Ok(())
    }

    /// Runs once per analytics cycle.
    ///
    /// An error means some values are not persisted yet, the in-memory
    /// history is complete either way.
    pub fn update(
        &mut self,
        state: &BatteryState,
        now: DateTime<Local>,
        store: &mut dyn SettingsStore,
    ) -> Result<(), Error> {
        self.track_cell_voltages(state);

        if state.soc == 100 || state.charge_complete {
            self.full_charge(now);
        }

        let today = now.date_naive();
        if now.hour() == DAILY_RESET_HOUR
            && now.minute() == 0
            && self.history.last_daily_reset != Some(today)
        {
            self.daily_reset(state.soc, now);
        }

        let minute = now
            .naive_local()
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0));
        if minute != self.last_minute {
            self.last_minute = minute;
            self.account_minute(state);
        }
        self.persist(store)
    }

    fn persist(&mut self, store: &mut dyn SettingsStore) -> Result<(), Error> {
        while let Some(key) = self.pending.first().copied() {
            if let Some(value) = self.history.value(key) {
                if let Err(e) = store.set(key, value) {
                    log::warn!("Cannot save {key}, retrying next cycle: {e}");
                    return Err(e);
                }
            }
            self.pending.remove(key);
        }
        Ok(())
    }

    fn track_cell_voltages(&mut self, state: &BatteryState) {
        let max = f64::from(state.max_cell_voltage);
        let min = f64::from(state.min_cell_voltage);
        if max > self.history.max_cell_voltage {
            self.history.max_cell_voltage = max;
            self.pending.insert(settings::MAX_CELL_VOLTAGE);
        }
        if min > 0.0
            && (self.history.min_cell_voltage == 0.0 || min < self.history.min_cell_voltage)
        {
            self.history.min_cell_voltage = min;
            self.pending.insert(settings::MIN_CELL_VOLTAGE);
        }
    }

    fn full_charge(&mut self, now: DateTime<Local>) {
        self.consumed_amphours = 0.0;
        let today = now.date_naive();
        if self.last_full != Some(today) {
            log::info!("Battery full, recording time of last full charge");
            self.last_full = Some(today);
            self.history.time_last_full = Some(now.timestamp());
            self.pending.insert(settings::TIME_LAST_FULL);
        }
    }

    fn daily_reset(&mut self, soc: u8, now: DateTime<Local>) {
        log::info!(
            "Updating daily stats, SOC: {soc} discharged: {:.3}kWh charged: {:.3}kWh",
            self.discharged_energy,
            self.charged_energy
        );
        self.history.last_daily_reset = Some(now.date_naive());
        self.history.average_discharge = ((ROLLING_DAYS - 1.0) * self.history.average_discharge
            + self.discharged_energy)
            / ROLLING_DAYS;
        self.pending
            .extend([settings::LAST_DAILY_RESET, settings::AVG_DISCHARGE]);

        let recently_full = self
            .history
            .time_last_full
            .is_some_and(|t| now.timestamp() - t <= FULL_CHARGE_MAX_AGE_SECS);
        if recently_full && soc < CAPACITY_ESTIMATE_MAX_SOC && self.consumed_amphours < 0.0 {
            let capacity = -self.consumed_amphours * 100.0 / (100.0 - f64::from(soc));
            self.history.capacity = Some(capacity);
            self.pending.insert(settings::CAPACITY);
            if self.installed_capacity > 0.0 {
                self.history.soh = Some(capacity * 100.0 / self.installed_capacity);
                self.pending.insert(settings::SOH);
            }
            log::info!(
                "Estimated capacity {capacity:.1}Ah, SOH {:?}%",
                self.history.soh
            );
        }

        self.charged_energy = 0.0;
        self.discharged_energy = 0.0;
        self.consumed_amphours = 0.0;
    }

    fn account_minute(&mut self, state: &BatteryState) {
        let current = f64::from(state.current);
        let power = f64::from(state.voltage) * current;
        if current > 0.0 {
            self.charged_energy += power * KWH_PER_WATT_MINUTE;
            self.time_to_full = Some(time_to_full(
                state.soc,
                self.installed_capacity,
                current,
            ));
        } else {
            let drawn = current * AH_PER_MINUTE;
            self.consumed_amphours += drawn;
            self.history.total_ah_drawn += drawn;
            self.discharged_energy += -power * KWH_PER_WATT_MINUTE;
            self.time_to_go = Some(time_to_go(state.soc, self.installed_capacity, current));
            self.pending.insert(settings::TOTAL_AH_DRAWN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettings;
    use crate::state::BatteryConfig;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, day, hour, minute, 0)
            .single()
            .unwrap()
    }

    fn battery(soc: u8, voltage: f32, current: f32) -> BatteryState {
        let mut state = BatteryState::new(BatteryConfig {
            capacity: 100.0,
            ..Default::default()
        });
        state.soc = soc;
        state.voltage = voltage;
        state.current = current;
        state
    }

    #[test]
    fn time_estimates() {
        assert_eq!(time_to_full(60, 100.0, 20.0), 7200.0);
        assert_eq!(time_to_go(60, 100.0, -10.0), 21600.0);
        assert_eq!(time_to_go(60, 100.0, 0.0), 216000.0);
        assert_eq!(time_to_full(60, 100.0, 0.0), 216000.0);
    }

    #[test]
    fn accounts_once_per_minute() {
        let mut store = MemorySettings::new();
        let mut tracker = HistoryTracker::new(HistoryState::default(), 100.0);
        let bat = battery(60, 26.0, -10.0);
        tracker.update(&bat, at(4, 12, 0), &mut store).unwrap();
        tracker.update(&bat, at(4, 12, 0), &mut store).unwrap();
        let report = tracker.report();
        assert!((report.consumed_amphours + 0.16667).abs() < 1e-9);
        assert!((report.history.total_ah_drawn + 0.16667).abs() < 1e-9);
        assert!((report.discharged_energy - 260.0 * 1.666667e-5).abs() < 1e-12);
        assert_eq!(report.time_to_go, Some(21600.0));
        let persisted = store.get(settings::TOTAL_AH_DRAWN).unwrap();
        assert!((persisted + 0.16667).abs() < 1e-9);

        tracker.update(&bat, at(4, 12, 1), &mut store).unwrap();
        assert!((tracker.report().consumed_amphours + 0.33334).abs() < 1e-9);
    }

    #[test]
    fn charging_accumulates_energy_and_time_to_full() {
        let mut store = MemorySettings::new();
        let mut tracker = HistoryTracker::new(HistoryState::default(), 100.0);
        tracker
            .update(&battery(60, 28.0, 20.0), at(4, 12, 0), &mut store)
            .unwrap();
        let report = tracker.report();
        assert!((report.charged_energy - 560.0 * 1.666667e-5).abs() < 1e-12);
        assert_eq!(report.time_to_full, Some(7200.0));
        assert_eq!(report.consumed_amphours, 0.0);
    }

    #[test]
    fn full_charge_resets_consumed_and_records_once_per_day() {
        let mut store = MemorySettings::new();
        let mut tracker = HistoryTracker::new(HistoryState::default(), 100.0);
        tracker
            .update(&battery(90, 26.0, -10.0), at(4, 12, 0), &mut store)
            .unwrap();
        assert!(tracker.report().consumed_amphours < 0.0);

        let full = battery(100, 28.0, 0.0);
        tracker.update(&full, at(4, 12, 1), &mut store).unwrap();
        assert_eq!(tracker.report().consumed_amphours, 0.0);
        let first = at(4, 12, 1).timestamp();
        assert_eq!(tracker.history().time_last_full, Some(first));

        tracker.update(&full, at(4, 13, 0), &mut store).unwrap();
        assert_eq!(tracker.history().time_last_full, Some(first));
        assert_eq!(store.get(settings::TIME_LAST_FULL), Some(first as f64));

        let mut complete = battery(98, 28.0, 0.0);
        complete.charge_complete = true;
        tracker.update(&complete, at(5, 12, 0), &mut store).unwrap();
        assert_eq!(
            tracker.history().time_last_full,
            Some(at(5, 12, 0).timestamp())
        );
    }

    #[test]
    fn daily_reset_rolls_average_once() {
        let mut store = MemorySettings::new();
        let mut tracker = HistoryTracker::new(
            HistoryState {
                average_discharge: 3.0,
                ..Default::default()
            },
            100.0,
        );
        tracker.discharged_energy = 5.0;
        tracker.charged_energy = 1.0;
        let idle = battery(80, 26.0, 0.0);
        tracker.update(&idle, at(4, 6, 0), &mut store).unwrap();
        let expected = (6.0 * 3.0 + 5.0) / 7.0;
        assert!((tracker.history().average_discharge - expected).abs() < 1e-9);
        assert!((expected - 3.2857).abs() < 1e-4);
        assert_eq!(store.get(settings::AVG_DISCHARGE), Some(expected));
        assert_eq!(tracker.report().charged_energy, 0.0);

        // Same minute, second cycle
        tracker.discharged_energy = 7.0;
        tracker.update(&idle, at(4, 6, 0), &mut store).unwrap();
        assert!((tracker.history().average_discharge - expected).abs() < 1e-9);
    }

    /// Fails the first write of `key`, then behaves like memory.
    struct FlakyStore {
        inner: MemorySettings,
        fail_key: &'static str,
        failed: bool,
    }

    impl SettingsStore for FlakyStore {
        fn get(&self, key: &str) -> Option<f64> {
            self.inner.get(key)
        }

        fn set(&mut self, key: &str, value: f64) -> Result<(), Error> {
            if key == self.fail_key && !self.failed {
                self.failed = true;
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            self.inner.set(key, value)
        }
    }

    #[test]
    fn failed_write_keeps_daily_reset_and_retries() {
        let mut store = FlakyStore {
            inner: MemorySettings::new(),
            fail_key: settings::AVG_DISCHARGE,
            failed: false,
        };
        let mut tracker = HistoryTracker::new(
            HistoryState {
                average_discharge: 3.0,
                ..Default::default()
            },
            100.0,
        );
        tracker.discharged_energy = 5.0;
        let idle = battery(80, 26.0, 0.0);
        assert!(tracker.update(&idle, at(4, 6, 0), &mut store).is_err());

        let expected = (6.0 * 3.0 + 5.0) / 7.0;
        assert!((tracker.history().average_discharge - expected).abs() < 1e-9);
        assert_eq!(tracker.report().discharged_energy, 0.0);
        assert_eq!(store.get(settings::AVG_DISCHARGE), None);

        tracker.update(&idle, at(4, 6, 0), &mut store).unwrap();
        tracker.update(&idle, at(4, 6, 1), &mut store).unwrap();
        assert!((tracker.history().average_discharge - expected).abs() < 1e-9);
        assert_eq!(tracker.report().discharged_energy, 0.0);
        assert_eq!(store.get(settings::AVG_DISCHARGE), Some(expected));
    }

    #[test]
    fn restart_in_reset_minute_does_not_roll_twice() {
        let mut store = MemorySettings::new();
        let mut tracker = HistoryTracker::new(
            HistoryState {
                average_discharge: 3.0,
                ..Default::default()
            },
            100.0,
        );
        tracker.discharged_energy = 5.0;
        let idle = battery(80, 26.0, 0.0);
        tracker.update(&idle, at(4, 6, 0), &mut store).unwrap();
        let expected = (6.0 * 3.0 + 5.0) / 7.0;

        let mut restarted = HistoryTracker::load(&store, 100.0);
        assert_eq!(
            restarted.history().last_daily_reset,
            NaiveDate::from_ymd_opt(2024, 3, 4)
        );
        restarted.discharged_energy = 7.0;
        restarted.update(&idle, at(4, 6, 0), &mut store).unwrap();
        assert!((restarted.history().average_discharge - expected).abs() < 1e-9);
        assert_eq!(restarted.report().discharged_energy, 7.0);
    }

    #[test]
    fn restart_on_full_day_keeps_time_last_full() {
        let mut store = MemorySettings::new();
        let mut tracker = HistoryTracker::new(HistoryState::default(), 100.0);
        let full = battery(100, 28.0, 0.0);
        tracker.update(&full, at(4, 12, 1), &mut store).unwrap();
        let first = at(4, 12, 1).timestamp();

        let mut restarted = HistoryTracker::load(&store, 100.0);
        restarted.update(&full, at(4, 13, 0), &mut store).unwrap();
        assert_eq!(restarted.history().time_last_full, Some(first));
        assert_eq!(store.get(settings::TIME_LAST_FULL), Some(first as f64));

        restarted.update(&full, at(5, 9, 0), &mut store).unwrap();
        assert_eq!(
            restarted.history().time_last_full,
            Some(at(5, 9, 0).timestamp())
        );
    }

    #[test]
    fn capacity_estimate_after_recent_full_and_deep_discharge() {
        let mut store = MemorySettings::new();
        let mut tracker = HistoryTracker::new(HistoryState::default(), 100.0);
        tracker
            .update(&battery(100, 28.0, 0.0), at(4, 8, 0), &mut store)
            .unwrap();
        tracker.consumed_amphours = -45.0;
        tracker
            .update(&battery(50, 26.0, 0.0), at(5, 6, 0), &mut store)
            .unwrap();
        assert_eq!(tracker.history().capacity, Some(90.0));
        assert_eq!(tracker.history().soh, Some(90.0));
        assert_eq!(store.get(settings::SOH), Some(90.0));
        assert_eq!(tracker.report().consumed_amphours, 0.0);
    }

    #[test]
    fn no_capacity_estimate_from_shallow_discharge() {
        let mut store = MemorySettings::new();
        let mut tracker = HistoryTracker::new(HistoryState::default(), 100.0);
        tracker
            .update(&battery(100, 28.0, 0.0), at(4, 8, 0), &mut store)
            .unwrap();
        tracker.consumed_amphours = -20.0;
        tracker
            .update(&battery(80, 26.0, 0.0), at(5, 6, 0), &mut store)
            .unwrap();
        assert_eq!(tracker.history().capacity, None);
        assert_eq!(tracker.history().soh, None);
    }

    #[test]
    fn cell_voltage_extremes_are_persisted() {
        let mut store = MemorySettings::new();
        let mut tracker = HistoryTracker::new(HistoryState::default(), 100.0);
        let mut bat = battery(50, 26.0, 0.0);
        bat.min_cell_voltage = 3.1;
        bat.max_cell_voltage = 3.4;
        tracker.update(&bat, at(4, 12, 0), &mut store).unwrap();
        bat.min_cell_voltage = 3.2;
        bat.max_cell_voltage = 3.3;
        tracker.update(&bat, at(4, 12, 0), &mut store).unwrap();
        assert!((tracker.history().min_cell_voltage - 3.1).abs() < 1e-6);
        assert!((tracker.history().max_cell_voltage - 3.4).abs() < 1e-6);
        assert!(store.get(settings::MAX_CELL_VOLTAGE).is_some());
    }

    #[test]
    fn flush_and_load_round_trip() {
        let mut store = MemorySettings::new();
        let history = HistoryState {
            average_discharge: 2.5,
            total_ah_drawn: -100.0,
            time_last_full: Some(1_700_000_000),
            min_cell_voltage: 3.0,
            max_cell_voltage: 3.6,
            capacity: Some(95.0),
            soh: Some(95.0),
            last_daily_reset: NaiveDate::from_ymd_opt(2024, 3, 4),
        };
        HistoryTracker::new(history.clone(), 100.0)
            .flush(&mut store)
            .unwrap();
        assert_eq!(HistoryTracker::load(&store, 100.0).history(), &history);
    }
}
