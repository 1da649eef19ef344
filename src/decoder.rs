//! Decoding of the U-BMS broadcast messages into [`BatteryState`].
//!
//! Decoding is total: unknown ids are ignored and every field whose bytes
//! are missing from a short payload is left untouched.

use crate::protocol::*;
use crate::state::BatteryState;

/// First three cell readings of a module, waiting for the second frame of the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialCellFrame([i16; 3]);

impl BatteryState {
    /// Applies one received frame to the state.
    pub fn decode(&mut self, frame: &Frame) {
        let data = frame.payload();
        log::trace!("decode: {frame:?}");
        match frame.id() {
            STATUS_ID => self.decode_status(data),
            CURRENT_LIMITS_ID => self.decode_current_limits(data),
            CHARGE_LIMITS_ID => self.decode_charge_limits(data),
            EXTREMES_ID => self.decode_extremes(data),
            IDENTITY_ID => self.decode_identity(data),
            id @ CELL_VOLTAGE_BASE_ID..=CELL_VOLTAGE_LAST_ID => {
                let module = usize::from(id - CELL_VOLTAGE_BASE_ID) >> 1;
                if (id - CELL_VOLTAGE_BASE_ID) & 1 == 0 {
                    self.decode_first_cells(module, data);
                } else {
                    self.decode_last_cell(module, data);
                }
            }
            id @ MODULE_CURRENT_BASE_ID..=MODULE_CURRENT_LAST_ID => {
                let start = usize::from(id - MODULE_CURRENT_BASE_ID) * MODULES_PER_WORD_FRAME;
                for (i, value) in words(data).enumerate() {
                    if let Some(slot) = self.module_current.get_mut(start + i) {
                        *slot = i16::from_be_bytes(value);
                    }
                }
                log::debug!("Module currents: {:?}", self.module_current);
            }
            id @ MODULE_SOC_BASE_ID..=MODULE_SOC_LAST_ID => {
                let start = usize::from(id - MODULE_SOC_BASE_ID) * MODULES_PER_SOC_FRAME;
                for (i, raw) in data.iter().skip(1).take(MODULES_PER_SOC_FRAME).enumerate() {
                    if let Some(slot) = self.module_soc.get_mut(start + i) {
                        *slot = ((u16::from(*raw) * 100) >> 8) as u8;
                    }
                }
                log::debug!("Module SOC: {:?}", self.module_soc);
            }
            id @ MODULE_TEMPERATURE_BASE_ID..=MODULE_TEMPERATURE_LAST_ID => {
                let start =
                    usize::from(id - MODULE_TEMPERATURE_BASE_ID) * MODULES_PER_WORD_FRAME;
                for (i, value) in words(data).enumerate() {
                    if let Some(slot) = self.module_temperature.get_mut(start + i) {
                        *slot = f32::from(u16::from_be_bytes(value)) * 0.01;
                    }
                }
                log::debug!("Module temperatures: {:?}", self.module_temperature);
            }
            _ => return,
        }
        self.last_update = Some(chrono::Utc::now());
    }

    fn decode_status(&mut self, data: &[u8]) {
        if let Some(soc) = byte(data, 0) {
            self.soc = soc;
        }
        if let Some(mode) = byte(data, 1) {
            self.mode = mode;
        }
        let alarms = byte(data, 2);
        let errors = byte(data, 3);
        if let Some(alarms) = alarms {
            self.voltage_and_cell_temperature_alarms = alarms;
        }
        if let Some(errors) = errors {
            self.internal_errors = errors;
        }
        if let Some(alarms) = byte(data, 4) {
            self.current_and_pcb_temperature_alarms = alarms;
        }
        if let Some(communicating) = byte(data, 5) {
            self.modules_communicating = communicating;
            // A missing or excess module is a bus dropout, not a resized pack
            match (alarms, errors) {
                (Some(alarms), Some(errors)) if !read_bit!(alarms, 0) && !read_bit!(errors, 1) => {
                    let count = usize::from(communicating);
                    if count <= self.config.max_modules {
                        self.number_of_modules = count;
                    } else {
                        log::warn!(
                            "Ignoring module count {count}, at most {} modules supported",
                            self.config.max_modules
                        );
                    }
                }
                _ => log::debug!(
                    "Module count {communicating} not accepted, configured {}",
                    self.number_of_modules
                ),
            }
        }
        if let Some(balancing) = byte(data, 6) {
            self.modules_balancing = balancing;
        }
        if let Some(reason) = byte(data, 7) {
            self.shutdown_reason = reason;
        }
        log::debug!("SOC: {} Mode: {:X}", self.soc, self.mode & 0x1F);
    }

    fn decode_current_limits(&mut self, data: &[u8]) {
        if let Some(current) = byte(data, 1) {
            self.current = f32::from(current as i8);
        }
        // Limits are provided in drive mode only
        if read_bit!(self.mode, 1) {
            if let Some(limit) = le_i16(data, 3, 4) {
                self.max_discharge_current = f32::from(limit) / 10.0;
            }
            // Byte 6 is not part of the charge limit
            if let Some(limit) = le_i16(data, 5, 7) {
                self.max_charge_current = f32::from(limit) / 10.0;
            }
            log::debug!(
                "Icmax {}A Idmax {}A",
                self.max_charge_current,
                self.max_discharge_current
            );
        }
        log::debug!("I: {}A U: {}V", self.current, self.voltage);
    }

    fn decode_charge_limits(&mut self, data: &[u8]) {
        if !read_bit!(self.mode, 0) {
            return;
        }
        if let Some(flags) = byte(data, 3) {
            self.charge_complete = read_bit!(flags, 2);
        }
        if let Some(voltage) = le_i16(data, 1, 2) {
            self.reported_max_charge_voltage = Some(voltage);
        }
        if self.mode & 0x18 == 0x18 {
            // Equalizing, the controller dictates the charge current
            if let Some(current) = byte(data, 0) {
                self.max_charge_current = f32::from(current);
            }
        } else {
            self.max_charge_current = self.config.capacity * 0.1;
        }
        log::debug!(
            "CCL: {}A CVL: {:?}",
            self.max_charge_current,
            self.reported_max_charge_voltage
        );
    }

    fn decode_extremes(&mut self, data: &[u8]) {
        // Temperatures are sent with an offset of 40
        if let Some(t) = byte(data, 0) {
            self.max_cell_temperature = i16::from(t) - 40;
        }
        if let Some(t) = byte(data, 1) {
            self.min_cell_temperature = i16::from(t) - 40;
        }
        if let Some(t) = byte(data, 3) {
            self.max_pcb_temperature = i16::from(t) - 40;
        }
        if let Some(mv) = le_i16(data, 4, 5) {
            self.max_cell_voltage = f32::from(mv) * 0.001;
        }
        if let Some(mv) = le_i16(data, 6, 7) {
            self.min_cell_voltage = f32::from(mv) * 0.001;
        }
        log::debug!(
            "Umin {:.3}V Umax {:.3}V",
            self.min_cell_voltage,
            self.max_cell_voltage
        );
    }

    fn decode_identity(&mut self, data: &[u8]) {
        if let (Some(major), Some(minor)) = (byte(data, 0), byte(data, 1)) {
            self.identity.firmware_version = Some(format!("{major}.{minor}"));
        }
        if let Some(bms_type) = byte(data, 2) {
            self.identity.bms_type = Some(bms_type);
        }
        if let Some(revision) = byte(data, 3) {
            self.identity.hardware_revision = Some(revision);
        }
        log::debug!("Identity: {:?}", self.identity);
    }

    fn decode_first_cells(&mut self, module: usize, data: &[u8]) {
        let (Some(a), Some(b), Some(c)) = (be_i16(data, 2), be_i16(data, 4), be_i16(data, 6))
        else {
            log::debug!("Short cell voltage frame for module {module}: {data:02X?}");
            return;
        };
        if let Some(slot) = self.partial_cells.get_mut(module) {
            *slot = Some(PartialCellFrame([a, b, c]));
        }
    }

    fn decode_last_cell(&mut self, module: usize, data: &[u8]) {
        let Some(d) = be_i16(data, 2) else {
            log::debug!("Short cell voltage frame for module {module}: {data:02X?}");
            return;
        };
        let Some(PartialCellFrame([a, b, c])) =
            self.partial_cells.get_mut(module).and_then(Option::take)
        else {
            log::trace!("Module {module}: second cell frame without first, dropped");
            return;
        };
        let cells = [a, b, c, d];
        self.cell_voltages[module] = cells;
        self.module_voltage[module] = cells.iter().map(|&mv| i32::from(mv)).sum();
        log::debug!("Umodule {}: {}mV", module, self.module_voltage[module]);

        let last_module = self.number_of_modules.checked_sub(1);
        let last_series = self.config.modules_in_series.checked_sub(1);
        if Some(module) == last_module || Some(module) == last_series {
            self.update_pack_voltage();
        }
    }
}

/// Big-endian words starting at byte 2, at most one frame's worth.
fn words(data: &[u8]) -> impl Iterator<Item = [u8; 2]> + '_ {
    data.get(2..)
        .unwrap_or_default()
        .chunks_exact(2)
        .take(MODULES_PER_WORD_FRAME)
        .map(|w| [w[0], w[1]])
}
