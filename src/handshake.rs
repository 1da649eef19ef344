//! One-shot connection handshake run before normal operation.
//!
//! The handshake listens for the status, current and identity messages, checks
//! that the pack voltage reported by the controller fits the configured charge
//! voltage and only then widens the filters and arms the mode keep-alive.
//! It is not restartable; reconnecting is up to the caller.

use crate::mode::ModeController;
use crate::protocol::*;
use crate::state::BatteryState;
use crate::transport::Transport;
use crate::Error;
use std::time::{Duration, Instant};

/// Allowed relative deviation of the reported pack voltage.
const VOLTAGE_TOLERANCE: f32 = 0.15;

const RETRY_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Waiting,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeResult {
    pub status_seen: bool,
    pub voltage_plausible: bool,
    pub identity_seen: bool,
}

impl HandshakeResult {
    fn complete(&self) -> bool {
        self.status_seen && self.voltage_plausible && self.identity_seen
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HandshakeTiming {
    /// Upper bound of a single receive attempt.
    pub poll_timeout: Duration,
    /// Overall time to wait for the controller.
    pub timeout: Duration,
}

impl Default for HandshakeTiming {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

/// The 0xC1 voltage byte counts in units of 2V.
pub fn voltage_plausible(raw: u8, max_charge_voltage: f32) -> bool {
    (2.0 * f32::from(raw) - max_charge_voltage).abs() <= VOLTAGE_TOLERANCE * max_charge_voltage
}

#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    result: HandshakeResult,
    max_charge_voltage: f32,
    reported_voltage: Option<f32>,
}

impl Handshake {
    pub fn new(max_charge_voltage: f32) -> Self {
        Self {
            state: HandshakeState::Waiting,
            result: HandshakeResult::default(),
            max_charge_voltage,
            reported_voltage: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn result(&self) -> HandshakeResult {
        self.result
    }

    /// Feeds one received frame, decoding it into `battery` as well.
    pub fn on_frame(&mut self, frame: &Frame, battery: &mut BatteryState) -> HandshakeState {
        if self.state != HandshakeState::Waiting {
            return self.state;
        }
        battery.decode(frame);
        match frame.id() {
            STATUS_ID => {
                self.result.status_seen = true;
                log::info!(
                    "Battery status received, {} modules communicating, {} configured",
                    battery.modules_communicating,
                    battery.number_of_modules
                );
            }
            CURRENT_LIMITS_ID => {
                let Some(raw) = frame.payload().first().copied() else {
                    return self.state;
                };
                let reported = 2.0 * f32::from(raw);
                self.reported_voltage = Some(reported);
                if voltage_plausible(raw, self.max_charge_voltage) {
                    self.result.voltage_plausible = true;
                } else {
                    log::error!(
                        "Battery reports {reported}V, incompatible with max charge voltage {}V",
                        self.max_charge_voltage
                    );
                    self.state = HandshakeState::Failed;
                    return self.state;
                }
            }
            IDENTITY_ID => {
                self.result.identity_seen = true;
                log::info!(
                    "U-BMS firmware {}, type {:?}, hardware revision {:?}",
                    battery
                        .identity
                        .firmware_version
                        .as_deref()
                        .unwrap_or("unknown"),
                    battery.identity.bms_type,
                    battery.identity.hardware_revision
                );
            }
            _ => {}
        }
        if self.result.complete() {
            self.state = HandshakeState::Confirmed;
        }
        self.state
    }

    /// Polls `transport` until the handshake is confirmed, fails or times out.
    pub fn run(
        mut self,
        transport: &dyn Transport,
        battery: &mut BatteryState,
        timing: HandshakeTiming,
    ) -> Result<HandshakeResult, Error> {
        transport.set_filters(&HANDSHAKE_FILTERS)?;
        let deadline = Instant::now() + timing.timeout;
        log::info!("Waiting up to {:?} for the battery", timing.timeout);
        loop {
            let now = Instant::now();
            if now >= deadline {
                log::warn!("Handshake timed out, seen so far: {:?}", self.result);
                return Err(Error::HandshakeTimeout);
            }
            let wait = timing.poll_timeout.min(deadline - now);
            let frame = match transport.receive(wait) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Receive failed during handshake: {e}");
                    std::thread::sleep(wait);
                    continue;
                }
            };
            match self.on_frame(&frame, battery) {
                HandshakeState::Waiting => {}
                HandshakeState::Confirmed => return Ok(self.result),
                HandshakeState::Failed => {
                    return Err(Error::HandshakeMismatch {
                        reported: self.reported_voltage.unwrap_or_default(),
                        configured: self.max_charge_voltage,
                    })
                }
            }
        }
    }
}

/// Delay before handshake retry number `attempt`, counting from 0.
pub fn retry_backoff(attempt: u32) -> Duration {
    RETRY_BACKOFF_INITIAL
        .checked_mul(1 << attempt.min(16))
        .map_or(RETRY_BACKOFF_MAX, |delay| delay.min(RETRY_BACKOFF_MAX))
}

/// Runs the handshake, then widens the filters to the operating set and arms
/// the keep-alive with `mode`.
pub fn connect(
    transport: &dyn Transport,
    controller: &ModeController,
    battery: &mut BatteryState,
    timing: HandshakeTiming,
    mode: OperatingMode,
) -> Result<HandshakeResult, Error> {
    let result =
        Handshake::new(battery.config().max_charge_voltage).run(transport, battery, timing)?;
    transport.set_filters(&OPERATING_FILTERS)?;
    controller.arm(mode)?;
    log::info!("Battery connected, mode command armed in {mode}");
    Ok(result)
}
