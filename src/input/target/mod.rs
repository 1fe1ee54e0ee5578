pub mod console;
pub mod mapping;
#[cfg(test)]
pub mod recorder;
pub mod uinput;

#[cfg(test)]
mod mapping_test;

use std::io;

use thiserror::Error;

use crate::{
    config::{OutputKind, RemapOptions},
    drivers::joycon::{
        buttons::{AxisId, ButtonId},
        driver::Side,
        hid_report::GyroFrame,
    },
};

use self::{console::ConsoleOutput, mapping::ControllerMapping, uinput::UinputOutput};

/// Possible errors from an [Output]
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("failed to write to virtual device: {0}")]
    Io(#[from] io::Error),
    #[error("output has been closed")]
    Closed,
}

/// OS-level event sink for one logical controller. A controller calls
/// [Output::begin_update], then any number of `*_update` calls, followed by
/// [Output::flush_update].
pub trait Output: Send {
    fn begin_update(&mut self) -> Result<(), OutputError>;
    fn button_update(&mut self, button: ButtonId, pressed: bool);
    fn stick_update(&mut self, axis: AxisId, value: i16);
    fn gyro_update(&mut self, frame: GyroFrame);
    fn flush_update(&mut self) -> Result<(), OutputError>;
    fn on_frame(&mut self);
    fn close(&mut self) -> Result<(), OutputError>;
}

/// Creates the [Output] for a newly paired controller
pub trait OutputFactory: Send + Sync {
    fn create(
        &self,
        side: Side,
        player: usize,
        remap: &RemapOptions,
    ) -> Result<Box<dyn Output>, OutputError>;
}

/// Factory for the outputs selectable from the command line
#[derive(Debug, Clone, Copy)]
pub struct TargetFactory {
    kind: OutputKind,
}

impl TargetFactory {
    pub fn new(kind: OutputKind) -> Self {
        Self { kind }
    }
}

impl OutputFactory for TargetFactory {
    fn create(
        &self,
        side: Side,
        player: usize,
        remap: &RemapOptions,
    ) -> Result<Box<dyn Output>, OutputError> {
        match self.kind {
            OutputKind::Console => Ok(Box::new(ConsoleOutput::new(player))),
            OutputKind::Uinput => {
                let mut mapping = ControllerMapping::for_side(side);
                mapping.apply_remap(remap);
                let name = match side {
                    Side::Both => format!("Full Joy-Con {player}"),
                    _ => format!("Half Joy-Con {player}"),
                };
                log::debug!("Creating virtual device '{name}'");
                let output = UinputOutput::new(mapping, &name, side)?;
                Ok(Box::new(output))
            }
        }
    }
}
