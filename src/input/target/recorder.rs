//! Output that records every call, used by tests
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crate::{
    config::RemapOptions,
    drivers::joycon::{
        buttons::{AxisId, ButtonId},
        driver::Side,
        hid_report::GyroFrame,
    },
};

use super::{Output, OutputError, OutputFactory};

#[derive(Debug, Clone, PartialEq)]
pub enum OutputCall {
    Begin,
    Button(ButtonId, bool),
    Stick(AxisId, i16),
    Gyro(GyroFrame),
    Flush,
    Frame,
    Close,
}

pub type CallLog = Arc<Mutex<Vec<OutputCall>>>;

#[derive(Debug, Default)]
pub struct Recorder {
    calls: CallLog,
}

impl Recorder {
    pub fn new() -> (Self, CallLog) {
        let recorder = Self::default();
        let calls = recorder.calls.clone();
        (recorder, calls)
    }

    fn record(&self, call: OutputCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Output for Recorder {
    fn begin_update(&mut self) -> Result<(), OutputError> {
        self.record(OutputCall::Begin);
        Ok(())
    }

    fn button_update(&mut self, button: ButtonId, pressed: bool) {
        self.record(OutputCall::Button(button, pressed));
    }

    fn stick_update(&mut self, axis: AxisId, value: i16) {
        self.record(OutputCall::Stick(axis, value));
    }

    fn gyro_update(&mut self, frame: GyroFrame) {
        self.record(OutputCall::Gyro(frame));
    }

    fn flush_update(&mut self) -> Result<(), OutputError> {
        self.record(OutputCall::Flush);
        Ok(())
    }

    fn on_frame(&mut self) {
        self.record(OutputCall::Frame);
    }

    fn close(&mut self) -> Result<(), OutputError> {
        self.record(OutputCall::Close);
        Ok(())
    }
}

/// An output created by [RecorderFactory]
#[derive(Debug, Clone)]
pub struct CreatedOutput {
    pub side: Side,
    pub player: usize,
    pub remap: RemapOptions,
    pub calls: CallLog,
}

#[derive(Debug, Default)]
pub struct RecorderFactory {
    created: Mutex<Vec<CreatedOutput>>,
    fail: AtomicBool,
}

impl RecorderFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> Vec<CreatedOutput> {
        self.created.lock().unwrap().clone()
    }

    /// Makes every following create call fail
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl OutputFactory for RecorderFactory {
    fn create(
        &self,
        side: Side,
        player: usize,
        remap: &RemapOptions,
    ) -> Result<Box<dyn Output>, OutputError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(OutputError::Closed);
        }
        let (recorder, calls) = Recorder::new();
        self.created.lock().unwrap().push(CreatedOutput {
            side,
            player,
            remap: remap.clone(),
            calls,
        });
        Ok(Box::new(recorder))
    }
}
