//! Keep-alive master for the mode command.
//!
//! In slave mode the U-BMS expects the mode command (0x440) from a vehicle
//! management unit and falls back to its default mode when it is missing for
//! [`KEEP_ALIVE_TIMEOUT`](crate::protocol::KEEP_ALIVE_TIMEOUT). Once armed, the
//! command is retransmitted until the process exits.

use crate::protocol::{mode_command, OperatingMode, KEEP_ALIVE_TIMEOUT};
use crate::transport::{PeriodicHandle, Transport};
use crate::Error;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(1);

struct Armed {
    mode: OperatingMode,
    handle: PeriodicHandle,
}

pub struct ModeController {
    transport: Arc<dyn Transport>,
    period: Duration,
    armed: Mutex<Option<Armed>>,
}

impl ModeController {
    pub fn new(transport: Arc<dyn Transport>, period: Duration) -> Self {
        if period >= KEEP_ALIVE_TIMEOUT {
            log::warn!(
                "Keep-alive period {period:?} is not shorter than the controller timeout {KEEP_ALIVE_TIMEOUT:?}"
            );
        }
        Self {
            transport,
            period,
            armed: Mutex::new(None),
        }
    }

    // Poisoning is ignored, the armed task stays valid after a panic elsewhere
    fn lock(&self) -> MutexGuard<'_, Option<Armed>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the cyclic mode command. Arming twice behaves like a mode request.
    pub fn arm(&self, mode: OperatingMode) -> Result<(), Error> {
        let mut armed = self.lock();
        if let Some(armed) = armed.as_mut() {
            return self.change(armed, mode);
        }
        let handle = self
            .transport
            .send_periodic(mode_command(mode), self.period)?;
        log::info!(
            "Mode command armed: {mode}, every {:?} ({handle:?})",
            self.period
        );
        *armed = Some(Armed { mode, handle });
        Ok(())
    }

    /// Changes the commanded mode, `value` must be 0 (standby), 1 (charge) or 2 (drive).
    ///
    /// On error the transmitted command is left unchanged.
    pub fn request_mode(&self, value: u8) -> Result<OperatingMode, Error> {
        let mode = OperatingMode::try_from(value)?;
        let mut armed = self.lock();
        let armed = armed.as_mut().ok_or(Error::NotArmed)?;
        self.change(armed, mode)?;
        Ok(mode)
    }

    pub fn mode(&self) -> Option<OperatingMode> {
        self.lock().as_ref().map(|armed| armed.mode)
    }

    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }

    fn change(&self, armed: &mut Armed, mode: OperatingMode) -> Result<(), Error> {
        if matches!(
            (armed.mode, mode),
            (OperatingMode::Charge, OperatingMode::Drive)
                | (OperatingMode::Drive, OperatingMode::Charge)
        ) {
            log::warn!(
                "Direct change from {} to {mode}, the controller expects a pass through standby",
                armed.mode
            );
        }
        log::info!("Changing mode to {} {mode}", mode as u8);
        let frame = mode_command(mode);
        let restart = match &mut armed.handle {
            PeriodicHandle::Modifiable(task) => {
                task.modify(frame)?;
                false
            }
            PeriodicHandle::RestartOnly(_) => true,
        };
        if restart {
            // Start the replacement first, the old task keeps running if that fails
            let replacement = self.transport.send_periodic(frame, self.period)?;
            let mut old = std::mem::replace(&mut armed.handle, replacement);
            old.stop();
        }
        armed.mode = mode;
        Ok(())
    }
}
