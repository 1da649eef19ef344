#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ubms_lib::protocol::{Filter, Frame};
use ubms_lib::transport::{ModifiablePeriodicTask, PeriodicHandle, PeriodicTask, Transport};
use ubms_lib::Error;

/// What a scripted periodic task was asked to do.
#[derive(Debug, Default)]
pub struct TaskRecord {
    pub frame: Option<Frame>,
    pub stopped: bool,
    pub modifications: usize,
}

struct ScriptedTask(Arc<Mutex<TaskRecord>>);

impl PeriodicTask for ScriptedTask {
    fn stop(&mut self) {
        self.0.lock().unwrap().stopped = true;
    }
}

impl ModifiablePeriodicTask for ScriptedTask {
    fn modify(&mut self, frame: Frame) -> Result<(), Error> {
        let mut record = self.0.lock().unwrap();
        record.frame = Some(frame);
        record.modifications += 1;
        Ok(())
    }
}

/// Transport replaying a fixed list of frames through the active filters.
pub struct ScriptedTransport {
    modifiable: bool,
    incoming: Mutex<VecDeque<Frame>>,
    filters: Mutex<Vec<Vec<Filter>>>,
    pub tasks: Mutex<Vec<Arc<Mutex<TaskRecord>>>>,
    fail_periodic: Mutex<bool>,
}

impl ScriptedTransport {
    pub fn new(modifiable: bool) -> Self {
        Self {
            modifiable,
            incoming: Mutex::new(VecDeque::new()),
            filters: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            fail_periodic: Mutex::new(false),
        }
    }

    pub fn with_frames(modifiable: bool, frames: impl IntoIterator<Item = Frame>) -> Self {
        let transport = Self::new(modifiable);
        transport.incoming.lock().unwrap().extend(frames);
        transport
    }

    pub fn filter_history(&self) -> Vec<Vec<Filter>> {
        self.filters.lock().unwrap().clone()
    }

    pub fn task(&self, index: usize) -> Arc<Mutex<TaskRecord>> {
        Arc::clone(&self.tasks.lock().unwrap()[index])
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn fail_next_periodic(&self) {
        *self.fail_periodic.lock().unwrap() = true;
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, _frame: &Frame) -> Result<(), Error> {
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Frame>, Error> {
        let filters = self.filters.lock().unwrap().last().cloned();
        let mut incoming = self.incoming.lock().unwrap();
        while let Some(frame) = incoming.pop_front() {
            let passes = filters
                .as_ref()
                .map_or(true, |filters| filters.iter().any(|f| f.matches(frame.id())));
            if passes {
                return Ok(Some(frame));
            }
        }
        drop(incoming);
        std::thread::sleep(timeout);
        Ok(None)
    }

    fn set_filters(&self, filters: &[Filter]) -> Result<(), Error> {
        self.filters.lock().unwrap().push(filters.to_vec());
        Ok(())
    }

    fn send_periodic(&self, frame: Frame, _period: Duration) -> Result<PeriodicHandle, Error> {
        if std::mem::take(&mut *self.fail_periodic.lock().unwrap()) {
            return Err(Error::Transport("no buffer space".into()));
        }
        let record = Arc::new(Mutex::new(TaskRecord {
            frame: Some(frame),
            ..Default::default()
        }));
        self.tasks.lock().unwrap().push(Arc::clone(&record));
        let task = ScriptedTask(record);
        Ok(if self.modifiable {
            PeriodicHandle::Modifiable(Box::new(task))
        } else {
            PeriodicHandle::RestartOnly(Box::new(task))
        })
    }
}
