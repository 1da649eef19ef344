//! Frame transport abstraction and a generic cyclic sender.

use crate::protocol::{Filter, Frame};
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// A raw CAN frame transport.
pub trait Transport: Send + Sync {
    fn send(&self, frame: &Frame) -> Result<(), Error>;

    /// Waits at most `timeout` for the next frame passing the filters.
    fn receive(&self, timeout: Duration) -> Result<Option<Frame>, Error>;

    fn set_filters(&self, filters: &[Filter]) -> Result<(), Error>;

    /// Starts retransmitting `frame` every `period` until the handle is stopped.
    fn send_periodic(&self, frame: Frame, period: Duration) -> Result<PeriodicHandle, Error>;
}

pub trait PeriodicTask: Send {
    fn stop(&mut self);
}

pub trait ModifiablePeriodicTask: PeriodicTask {
    /// Replaces the frame, the next transmission carries the new payload.
    fn modify(&mut self, frame: Frame) -> Result<(), Error>;
}

/// A running periodic transmission, the variant tells whether its frame can
/// be replaced in place or the task has to be restarted.
pub enum PeriodicHandle {
    Modifiable(Box<dyn ModifiablePeriodicTask>),
    RestartOnly(Box<dyn PeriodicTask>),
}

impl PeriodicHandle {
    pub fn stop(&mut self) {
        match self {
            PeriodicHandle::Modifiable(task) => task.stop(),
            PeriodicHandle::RestartOnly(task) => task.stop(),
        }
    }
}

impl std::fmt::Debug for PeriodicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeriodicHandle::Modifiable(_) => write!(f, "PeriodicHandle::Modifiable"),
            PeriodicHandle::RestartOnly(_) => write!(f, "PeriodicHandle::RestartOnly"),
        }
    }
}

/// Periodic transmission on a dedicated thread.
///
/// A failed send is logged and retried on the next period; the thread only
/// ends through [`PeriodicTask::stop`] or when the sender is dropped.
pub struct CyclicSender {
    frame: Arc<Mutex<Frame>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CyclicSender {
    pub fn spawn<F>(frame: Frame, period: Duration, send: F) -> Result<Self, Error>
    where
        F: Fn(&Frame) -> Result<(), Error> + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(frame));
        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let shared = Arc::clone(&shared);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name(format!("cyclic-{:03x}", frame.id()))
                .spawn(move || {
                    let mut failures = 0u32;
                    while running.load(Ordering::Acquire) {
                        let frame = *shared.lock().unwrap_or_else(PoisonError::into_inner);
                        match send(&frame) {
                            Ok(()) => {
                                if failures > 0 {
                                    log::info!(
                                        "Cyclic frame {:03X} sent again after {failures} failures",
                                        frame.id()
                                    );
                                }
                                failures = 0;
                            }
                            Err(e) => {
                                failures += 1;
                                log::warn!("Cannot send cyclic frame {frame:?}: {e}");
                            }
                        }
                        std::thread::park_timeout(period);
                    }
                    log::debug!("Cyclic frame {:03X} stopped", frame.id());
                })?
        };
        Ok(Self {
            frame: shared,
            running,
            thread: Some(thread),
        })
    }
}

impl PeriodicTask for CyclicSender {
    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                log::error!("Cyclic sender thread panicked");
            }
        }
    }
}

impl ModifiablePeriodicTask for CyclicSender {
    fn modify(&mut self, frame: Frame) -> Result<(), Error> {
        *self.frame.lock().unwrap_or_else(PoisonError::into_inner) = frame;
        Ok(())
    }
}

impl Drop for CyclicSender {
    fn drop(&mut self) {
        self.stop();
    }
}
