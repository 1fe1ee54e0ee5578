use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    drivers::joycon::driver::{CombinedState, Driver, InputMode, NotifyFlags},
    input::target::Output,
};

use super::{Composition, UpdateOutcome};

/// Controller backed by a single physical unit, either one half or a full
/// controller
pub struct UnitController {
    driver: Arc<Driver>,
    state: Mutex<Composition>,
}

impl UnitController {
    pub fn new(driver: Arc<Driver>) -> Self {
        Self {
            driver,
            state: Mutex::new(Composition::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, Composition> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub fn bind(&self, output: Box<dyn Output>) {
        self.state().output = Some(output);
    }

    pub fn update(&self, flags: NotifyFlags) -> UpdateOutcome {
        if flags.contains(NotifyFlags::INPUT) {
            let mut state = self.state();
            state.previous = state.current;
            state.current = CombinedState::default();
            self.driver.read_into(&mut state.current, true);
            state.dispatch();
            if state.tick_transition() {
                self.driver.change_input_mode(InputMode::Standard);
            }
        }

        if flags.contains(NotifyFlags::CONNECTION) && self.driver.is_stopping() {
            return UpdateOutcome::Remove;
        }
        UpdateOutcome::Keep
    }

    pub fn on_frame(&self) {
        self.state().on_frame();
    }

    pub fn close(&self) {
        self.state().close();
    }
}

impl fmt::Debug for UnitController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitController")
            .field("driver", &self.driver)
            .finish()
    }
}
