use crate::decoder::PartialCellFrame;
use crate::protocol::{self, OperatingMode, CELLS_PER_MODULE, MAX_MODULES};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Static description of the installed pack.
#[derive(Debug, Clone, PartialEq)]
pub struct BatteryConfig {
    /// Installed capacity in Ah.
    pub capacity: f32,
    /// Configured maximum charge voltage in V.
    pub max_charge_voltage: f32,
    /// Size of the per-module arrays, the largest module count ever accepted.
    pub max_modules: usize,
    /// The first `modules_in_series` modules make up one string of the pack.
    pub modules_in_series: usize,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity: 550.0,
            max_charge_voltage: 14.5,
            max_modules: MAX_MODULES,
            modules_in_series: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Identity {
    pub firmware_version: Option<String>,
    pub bms_type: Option<u8>,
    pub hardware_revision: Option<u8>,
}

/// Pack state assembled from the individually timed U-BMS messages.
#[derive(Debug, Clone, Serialize)]
pub struct BatteryState {
    pub soc: u8,
    /// Raw mode byte of the status message.
    pub mode: u8,
    pub voltage: f32,
    pub current: f32,
    pub max_cell_temperature: i16,
    pub min_cell_temperature: i16,
    pub max_pcb_temperature: i16,
    pub max_cell_voltage: f32,
    pub min_cell_voltage: f32,
    pub max_charge_current: f32,
    pub max_discharge_current: f32,
    pub max_charge_voltage: f32,
    /// Max charge voltage as reported by the controller, raw and advisory only.
    pub reported_max_charge_voltage: Option<i16>,
    pub charge_complete: bool,
    pub voltage_and_cell_temperature_alarms: u8,
    pub internal_errors: u8,
    pub current_and_pcb_temperature_alarms: u8,
    pub number_of_modules: usize,
    pub modules_communicating: u8,
    pub modules_balancing: u8,
    pub shutdown_reason: u8,
    pub identity: Identity,
    pub last_update: Option<DateTime<Utc>>,
    pub cell_voltages: Vec<[i16; CELLS_PER_MODULE]>,
    /// Sum of the cell voltages of each module in mV.
    pub module_voltage: Vec<i32>,
    pub module_current: Vec<i16>,
    pub module_soc: Vec<u8>,
    pub module_temperature: Vec<f32>,
    #[serde(skip)]
    pub(crate) partial_cells: Vec<Option<PartialCellFrame>>,
    #[serde(skip)]
    pub(crate) config: BatteryConfig,
}

impl BatteryState {
    pub fn new(config: BatteryConfig) -> Self {
        let modules = config.max_modules;
        Self {
            soc: 0,
            mode: 0,
            voltage: 0.0,
            current: 0.0,
            max_cell_temperature: 0,
            min_cell_temperature: 0,
            max_pcb_temperature: 0,
            max_cell_voltage: 3.2,
            min_cell_voltage: 3.2,
            max_charge_current: config.capacity * 0.25,
            max_discharge_current: config.capacity * 0.5,
            max_charge_voltage: config.max_charge_voltage,
            reported_max_charge_voltage: None,
            charge_complete: false,
            voltage_and_cell_temperature_alarms: 0,
            internal_errors: 0,
            current_and_pcb_temperature_alarms: 0,
            number_of_modules: modules,
            modules_communicating: 0,
            modules_balancing: 0,
            shutdown_reason: 0,
            identity: Identity::default(),
            last_update: None,
            cell_voltages: vec![[0; CELLS_PER_MODULE]; modules],
            module_voltage: vec![0; modules],
            module_current: vec![0; modules],
            module_soc: vec![0; modules],
            module_temperature: vec![0.0; modules],
            partial_cells: vec![None; modules],
            config,
        }
    }

    pub fn config(&self) -> &BatteryConfig {
        &self.config
    }

    /// Operating mode commanded on the controller, `None` for reserved codes.
    pub fn operating_mode(&self) -> Option<OperatingMode> {
        OperatingMode::try_from(self.mode & 0x03).ok()
    }

    /// Charge state bits, see [`protocol::state_name`].
    pub fn charge_state(&self) -> u8 {
        self.mode & 0x0C
    }

    pub fn charge_state_name(&self) -> &'static str {
        protocol::state_name(self.charge_state()).unwrap_or("Normal")
    }

    pub fn is_balancing(&self) -> bool {
        protocol::read_bit!(self.mode, 4)
    }

    pub fn power(&self) -> f32 {
        self.voltage * self.current
    }

    /// Pack voltage in V from the cell voltage sums of the series string.
    pub(crate) fn update_pack_voltage(&mut self) {
        let series = self.config.modules_in_series.min(self.module_voltage.len());
        let millivolts: i32 = self.module_voltage[..series].iter().sum();
        self.voltage = millivolts as f32 / 1000.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_are_sized_to_configured_maximum() {
        let state = BatteryState::new(BatteryConfig {
            max_modules: 6,
            ..Default::default()
        });
        assert_eq!(state.cell_voltages.len(), 6);
        assert_eq!(state.module_temperature.len(), 6);
        assert_eq!(state.number_of_modules, 6);
    }

    #[test]
    fn mode_byte_fields() {
        let mut state = BatteryState::new(BatteryConfig::default());
        state.mode = 0x19;
        assert_eq!(state.operating_mode(), Some(OperatingMode::Charge));
        assert_eq!(state.charge_state_name(), "Float");
        assert!(state.is_balancing());
        state.mode = 0x03;
        assert_eq!(state.operating_mode(), None);
    }
}
