//! Shared battery state fed from the receive side and read by the analytics cycle.

use crate::alarms::{AlarmEvaluator, Alarms};
use crate::history::{HistoryReport, HistoryTracker};
use crate::protocol::Frame;
use crate::settings::SettingsStore;
use crate::state::BatteryState;
use crate::Error;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Everything published once per analytics cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Local>,
    pub mode_name: &'static str,
    pub state_name: &'static str,
    pub power: f32,
    pub battery: BatteryState,
    pub alarms: Alarms,
    pub history: HistoryReport,
}

pub struct Monitor {
    state: Arc<Mutex<BatteryState>>,
    alarms: AlarmEvaluator,
    history: HistoryTracker,
}

impl Monitor {
    pub fn new(state: BatteryState, history: HistoryTracker) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            alarms: AlarmEvaluator::new(),
            history,
        }
    }

    /// Handle for the receiving thread.
    pub fn shared_state(&self) -> Arc<Mutex<BatteryState>> {
        Arc::clone(&self.state)
    }

    pub fn on_frame(&self, frame: &Frame) {
        lock(&self.state).decode(frame);
    }

    /// Evaluates alarms and history on a consistent copy of the state.
    pub fn cycle(
        &mut self,
        now: DateTime<Local>,
        store: &mut dyn SettingsStore,
    ) -> Result<Snapshot, Error> {
        let battery = lock(&self.state).clone();
        let alarms = self.alarms.evaluate(&battery);
        self.history.update(&battery, now, store)?;
        Ok(Snapshot {
            timestamp: now,
            mode_name: battery
                .operating_mode()
                .map(|mode| mode.name())
                .unwrap_or("Unknown"),
            state_name: battery.charge_state_name(),
            power: battery.power(),
            alarms,
            history: self.history.report(),
            battery,
        })
    }

    pub fn flush(&mut self, store: &mut dyn SettingsStore) -> Result<(), Error> {
        self.history.flush(store)
    }
}

/// Decoding never leaves the state half written, a poisoned lock is taken over.
pub fn lock(state: &Mutex<BatteryState>) -> MutexGuard<'_, BatteryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
