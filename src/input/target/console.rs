//! Output that prints button changes to the terminal
use crate::drivers::joycon::{
    buttons::{AxisId, ButtonId},
    hid_report::GyroFrame,
};

use super::{Output, OutputError};

#[derive(Debug)]
pub struct ConsoleOutput {
    player: usize,
}

impl ConsoleOutput {
    pub fn new(player: usize) -> Self {
        Self { player }
    }

    pub fn format_button(&self, button: ButtonId, pressed: bool) -> String {
        let state = if pressed { "pressed" } else { "released" };
        format!("[Controller {}] {button} {state}", self.player)
    }
}

impl Output for ConsoleOutput {
    fn begin_update(&mut self) -> Result<(), OutputError> {
        Ok(())
    }

    fn button_update(&mut self, button: ButtonId, pressed: bool) {
        println!("{}", self.format_button(button, pressed));
    }

    fn stick_update(&mut self, _axis: AxisId, _value: i16) {}

    fn gyro_update(&mut self, _frame: GyroFrame) {}

    fn flush_update(&mut self) -> Result<(), OutputError> {
        Ok(())
    }

    fn on_frame(&mut self) {}

    fn close(&mut self) -> Result<(), OutputError> {
        Ok(())
    }
}
