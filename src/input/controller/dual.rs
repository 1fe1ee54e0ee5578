use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crate::{
    drivers::joycon::driver::{Driver, InputMode, NotifyFlags},
    input::target::Output,
};

use super::{Composition, UpdateOutcome};

/// How long to wait for the other half before merging anyway
pub const MERGE_WINDOW: Duration = Duration::from_millis(10);

struct DualState {
    composition: Composition,
    left_ready: bool,
    right_ready: bool,
    last_merge: Instant,
}

/// Controller made of a left and a right half. Input from the two halves
/// arrives independently and is merged into one state.
pub struct DualController {
    left: Arc<Driver>,
    right: Arc<Driver>,
    state: Mutex<DualState>,
}

impl DualController {
    pub fn new(left: Arc<Driver>, right: Arc<Driver>) -> Self {
        let state = DualState {
            composition: Composition::new(),
            left_ready: false,
            right_ready: false,
            last_merge: Instant::now(),
        };
        Self {
            left,
            right,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, DualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn left(&self) -> &Arc<Driver> {
        &self.left
    }

    pub fn right(&self) -> &Arc<Driver> {
        &self.right
    }

    pub fn bind(&self, output: Box<dyn Output>) {
        self.state().composition.output = Some(output);
    }

    pub fn update(&self, driver: &Arc<Driver>, flags: NotifyFlags) -> UpdateOutcome {
        if flags.contains(NotifyFlags::INPUT) {
            let mut state = self.state();
            if Arc::ptr_eq(driver, &self.left) {
                state.left_ready = true;
            } else {
                state.right_ready = true;
            }
            let both_ready = state.left_ready && state.right_ready;
            if both_ready || state.last_merge.elapsed() >= MERGE_WINDOW {
                self.merge(&mut state);
            }
        }

        if flags.contains(NotifyFlags::CONNECTION) && driver.is_stopping() {
            return UpdateOutcome::Remove;
        }
        UpdateOutcome::Keep
    }

    /// Builds the combined state from both halves and dispatches the changes.
    /// The left half is read first and the right half merged on top of it.
    fn merge(&self, state: &mut DualState) {
        state.left_ready = false;
        state.right_ready = false;
        state.last_merge = Instant::now();

        let composition = &mut state.composition;
        composition.previous = composition.current;
        self.left.read_into(&mut composition.current, false);
        self.right.read_into(&mut composition.current, true);
        composition.dispatch();

        if composition.tick_transition() {
            self.left.change_input_mode(InputMode::Standard);
            self.right.change_input_mode(InputMode::Standard);
        }
    }

    /// Flushes a half-ready merge once the window has passed
    pub fn on_frame(&self) {
        let mut state = self.state();
        let pending = state.left_ready || state.right_ready;
        if pending && state.last_merge.elapsed() >= MERGE_WINDOW {
            self.merge(&mut state);
        }
        state.composition.on_frame();
    }

    pub fn close(&self) {
        self.state().composition.close();
    }
}

impl fmt::Debug for DualController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualController")
            .field("left", &self.left)
            .field("right", &self.right)
            .finish()
    }
}
