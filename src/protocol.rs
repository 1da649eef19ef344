use crate::Error;
use serde::Serialize;
use std::fmt;

pub const STATUS_ID: u16 = 0xC0;
pub const CURRENT_LIMITS_ID: u16 = 0xC1;
pub const CHARGE_LIMITS_ID: u16 = 0xC2;
pub const EXTREMES_ID: u16 = 0xC4;
pub const IDENTITY_ID: u16 = 0x180;
pub const MODE_COMMAND_ID: u16 = 0x440;

/// First id of the cell voltage frame pairs, one pair per module.
pub const CELL_VOLTAGE_BASE_ID: u16 = 0x350;
pub const CELL_VOLTAGE_LAST_ID: u16 = 0x365;
pub const MODULE_CURRENT_BASE_ID: u16 = 0x46A;
pub const MODULE_CURRENT_LAST_ID: u16 = 0x46D;
pub const MODULE_SOC_BASE_ID: u16 = 0x6A;
pub const MODULE_SOC_LAST_ID: u16 = 0x6B;
pub const MODULE_TEMPERATURE_BASE_ID: u16 = 0x76A;
pub const MODULE_TEMPERATURE_LAST_ID: u16 = 0x76D;

/// Number of modules addressable through the cell voltage id pairs.
pub const MAX_MODULES: usize = ((CELL_VOLTAGE_LAST_ID - CELL_VOLTAGE_BASE_ID) as usize + 1) / 2;
/// Cells per module, three readings in the first frame of a pair and one in the second.
pub const CELLS_PER_MODULE: usize = 4;
/// Module values carried by one module current or temperature frame.
pub const MODULES_PER_WORD_FRAME: usize = 3;
/// Module values carried by one module SoC frame.
pub const MODULES_PER_SOC_FRAME: usize = 7;

/// The controller leaves slave mode if the mode command is missing for this long.
pub const KEEP_ALIVE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);

const MAX_ID: u16 = 0x7FF;
const MAX_PAYLOAD: usize = 8;

/// A standard (11-bit) CAN data frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    id: u16,
    data: [u8; MAX_PAYLOAD],
    len: u8,
}

impl Frame {
    pub fn new(id: u16, payload: &[u8]) -> std::result::Result<Self, Error> {
        if id > MAX_ID || payload.len() > MAX_PAYLOAD {
            return Err(Error::RangeError);
        }
        let mut data = [0; MAX_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            data,
            len: payload.len() as u8,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}#{:02X?}", self.id, self.payload())
    }
}

/// Acceptance filter, a frame passes when `frame_id & mask == id & mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub id: u16,
    pub mask: u16,
}

impl Filter {
    pub const fn new(id: u16, mask: u16) -> Self {
        Self { id, mask }
    }

    pub fn matches(&self, id: u16) -> bool {
        id & self.mask == self.id & self.mask
    }
}

/// Filters used while waiting for the controller to show up.
pub const HANDSHAKE_FILTERS: [Filter; 3] = [
    Filter::new(STATUS_ID, 0x7FF),
    Filter::new(CURRENT_LIMITS_ID, 0x7FF),
    Filter::new(IDENTITY_ID, 0x7FF),
];

/// Filters covering every message decoded during normal operation.
pub const OPERATING_FILTERS: [Filter; 7] = [
    Filter::new(0x0C0, 0x7F0),
    Filter::new(IDENTITY_ID, 0x7FF),
    Filter::new(0x350, 0x7F0),
    Filter::new(0x360, 0x7F8),
    Filter::new(0x468, 0x7F8),
    Filter::new(0x068, 0x7F8),
    Filter::new(0x768, 0x7F8),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum OperatingMode {
    Standby = 0,
    Charge = 1,
    Drive = 2,
}

impl OperatingMode {
    pub fn name(self) -> &'static str {
        mode_name(self as u8).unwrap_or("Unknown")
    }
}

impl TryFrom<u8> for OperatingMode {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(OperatingMode::Standby),
            1 => Ok(OperatingMode::Charge),
            2 => Ok(OperatingMode::Drive),
            _ => Err(Error::InvalidMode(value)),
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

const MODE_NAMES: [(u8, &str); 3] = [(0, "Standby"), (1, "Charge"), (2, "Drive")];
const STATE_NAMES: [(u8, &str); 2] = [(4, "Equalize"), (8, "Float")];

/// Name of the operating mode bits (`mode & 0x03`) of the status message.
pub fn mode_name(code: u8) -> Option<&'static str> {
    MODE_NAMES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// Name of the charge state bits (`mode & 0x0C`) of the status message.
pub fn state_name(code: u8) -> Option<&'static str> {
    STATE_NAMES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// The keep-alive frame commanding `mode`.
pub fn mode_command(mode: OperatingMode) -> Frame {
    Frame {
        id: MODE_COMMAND_ID,
        data: [0, mode as u8, 0, 0, 0, 0, 0, 0],
        len: 4,
    }
}

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}
pub(crate) use read_bit;

pub(crate) fn byte(payload: &[u8], offset: usize) -> Option<u8> {
    payload.get(offset).copied()
}

pub(crate) fn le_i16(payload: &[u8], lo: usize, hi: usize) -> Option<i16> {
    Some(i16::from_le_bytes([byte(payload, lo)?, byte(payload, hi)?]))
}

pub(crate) fn be_i16(payload: &[u8], offset: usize) -> Option<i16> {
    Some(i16::from_be_bytes([
        byte(payload, offset)?,
        byte(payload, offset + 1)?,
    ]))
}
