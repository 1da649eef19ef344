use crate::state::BatteryState;
use serde::Serialize;

/// Cell voltage spread above which the imbalance alarm is raised.
pub const IMBALANCE_ALARM: f32 = 0.25;
/// Cell voltage spread from which the imbalance warning is raised.
pub const IMBALANCE_WARNING: f32 = 0.18;

/// Alarm levels derived once per analytics cycle, 0 = ok, 1 = warning, 2 = alarm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Alarms {
    pub cell_imbalance: u8,
    pub low_voltage: u8,
    pub high_voltage: u8,
    pub low_soc: u8,
    pub high_discharge_current: u8,
    pub high_temperature: u8,
    pub low_temperature: u8,
}

#[derive(Debug)]
pub struct AlarmEvaluator {
    balanced: bool,
}

impl Default for AlarmEvaluator {
    fn default() -> Self {
        Self { balanced: true }
    }
}

impl AlarmEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&mut self, state: &BatteryState) -> Alarms {
        let cell_alarms = state.voltage_and_cell_temperature_alarms;
        let current_alarms = state.current_and_pcb_temperature_alarms;
        Alarms {
            cell_imbalance: self.cell_imbalance(state),
            low_voltage: (cell_alarms & 0x10) >> 3,
            high_voltage: (cell_alarms & 0x20) >> 4,
            low_soc: (cell_alarms & 0x08) >> 3,
            high_discharge_current: current_alarms & 0x03,
            high_temperature: ((cell_alarms & 0x06) >> 1) | ((current_alarms & 0x18) >> 3),
            low_temperature: (state.mode & 0x60) >> 5,
        }
    }

    fn cell_imbalance(&mut self, state: &BatteryState) -> u8 {
        let delta = state.max_cell_voltage - state.min_cell_voltage;
        if delta > IMBALANCE_ALARM {
            if self.balanced {
                log::error!(
                    "Cell voltage imbalance {:.3}V (min {:.3}V, max {:.3}V)",
                    delta,
                    state.min_cell_voltage,
                    state.max_cell_voltage
                );
                self.balanced = false;
            }
            2
        } else if delta >= IMBALANCE_WARNING {
            // The controller balances on its own, no need to warn meanwhile
            if state.modules_balancing > 0 {
                0
            } else {
                1
            }
        } else {
            self.balanced = true;
            0
        }
    }
}
