//! Logical controllers built from one or two physical units.
//!
//! A controller reads the canonical state of its drivers whenever one of
//! them reports new input, diffs it against the previous state and forwards
//! only the changed fields to its [Output].
pub mod dual;
pub mod single;

#[cfg(test)]
mod controller_test;

use std::sync::Arc;

use crate::drivers::joycon::{
    buttons::AxisId,
    driver::{CombinedState, Driver, NotifyFlags, Side},
    rumble::RumbleData,
};

use super::target::{Output, OutputError};

use self::{dual::DualController, single::UnitController};

/// Number of input updates before a newly bound driver is switched to the
/// standard input mode
const MODE_TRANSITION_UPDATES: u8 = 3;

/// What the owner of a controller should do after an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Keep,
    /// A driver of the controller has stopped for good
    Remove,
}

#[derive(Debug)]
pub enum Controller {
    /// One half acting as a small controller
    Single(UnitController),
    /// One full controller unit
    Pro(UnitController),
    /// A left and a right half acting as one controller
    Dual(DualController),
}

impl Controller {
    pub fn single(driver: Arc<Driver>) -> Self {
        Controller::Single(UnitController::new(driver))
    }

    pub fn pro(driver: Arc<Driver>) -> Self {
        Controller::Pro(UnitController::new(driver))
    }

    pub fn dual(left: Arc<Driver>, right: Arc<Driver>) -> Self {
        Controller::Dual(DualController::new(left, right))
    }

    /// Side the output of this controller represents
    pub fn side(&self) -> Side {
        match self {
            Controller::Single(controller) => controller.driver().side(),
            Controller::Pro(_) | Controller::Dual(_) => Side::Both,
        }
    }

    /// Drivers owned by this controller. Dual controllers list the left half
    /// first.
    pub fn drivers(&self) -> Vec<Arc<Driver>> {
        match self {
            Controller::Single(controller) | Controller::Pro(controller) => {
                vec![controller.driver().clone()]
            }
            Controller::Dual(controller) => {
                vec![controller.left().clone(), controller.right().clone()]
            }
        }
    }

    pub fn contains(&self, driver: &Arc<Driver>) -> bool {
        self.drivers().iter().any(|d| Arc::ptr_eq(d, driver))
    }

    pub fn bind(&self, output: Box<dyn Output>) {
        match self {
            Controller::Single(controller) | Controller::Pro(controller) => {
                controller.bind(output)
            }
            Controller::Dual(controller) => controller.bind(output),
        }
    }

    /// Queues the rumble patterns on every owned driver
    pub fn rumble(&self, patterns: &[RumbleData]) {
        for driver in self.drivers() {
            driver.rumble(patterns);
        }
    }

    pub fn on_frame(&self) {
        match self {
            Controller::Single(controller) | Controller::Pro(controller) => controller.on_frame(),
            Controller::Dual(controller) => controller.on_frame(),
        }
    }

    /// Releases the output and closes every owned driver
    pub fn close(&self) {
        match self {
            Controller::Single(controller) | Controller::Pro(controller) => controller.close(),
            Controller::Dual(controller) => controller.close(),
        }
        for driver in self.drivers() {
            driver.close();
        }
    }

    /// Handles a notification from one of the owned drivers
    pub fn update(&self, driver: &Arc<Driver>, flags: NotifyFlags) -> UpdateOutcome {
        match self {
            Controller::Single(controller) | Controller::Pro(controller) => {
                controller.update(flags)
            }
            Controller::Dual(controller) => controller.update(driver, flags),
        }
    }
}

/// State shared by every controller kind
struct Composition {
    output: Option<Box<dyn Output>>,
    current: CombinedState,
    previous: CombinedState,
    transition_delay: u8,
}

impl Composition {
    fn new() -> Self {
        Self {
            output: None,
            current: CombinedState::default(),
            previous: CombinedState::default(),
            transition_delay: MODE_TRANSITION_UPDATES,
        }
    }

    fn dispatch(&mut self) {
        let Some(output) = self.output.as_mut() else {
            return;
        };
        if let Err(e) = dispatch_updates(&self.previous, &self.current, output.as_mut()) {
            log::warn!("Failed to update output: {e}");
        }
    }

    /// Counts down one update. Returns true exactly once, when the driver(s)
    /// should switch to the standard input mode.
    fn tick_transition(&mut self) -> bool {
        if self.transition_delay == 0 {
            return false;
        }
        self.transition_delay -= 1;
        self.transition_delay == 0
    }

    fn on_frame(&mut self) {
        if let Some(output) = self.output.as_mut() {
            output.on_frame();
        }
    }

    fn close(&mut self) {
        if let Some(mut output) = self.output.take() {
            if let Err(e) = output.close() {
                log::warn!("Failed to close output: {e}");
            }
        }
    }
}

/// Sends one update per changed button and stick axis, then the gyro frames
/// if there are any.
pub fn dispatch_updates(
    previous: &CombinedState,
    current: &CombinedState,
    output: &mut dyn Output,
) -> Result<(), OutputError> {
    output.begin_update()?;

    let changed = previous.buttons.diff_mask(current.buttons);
    for button in changed.pressed() {
        output.button_update(button, current.buttons.get(button));
    }

    for axis in AxisId::ALL {
        let (stick, index) = axis.index();
        let value = current.sticks[stick][index];
        if previous.sticks[stick][index] != value {
            output.stick_update(axis, value);
        }
    }

    let has_gyro = current
        .gyro
        .iter()
        .any(|frame| frame.iter().any(|value| *value != 0));
    if has_gyro {
        for frame in current.gyro {
            output.gyro_update(frame);
        }
    }

    output.flush_update()
}
