//! Translation tables from Joy-Con buttons and sticks to evdev codes.
//!
//! Joy-Cons report negative left/down and positive up/right (docked
//! orientation), while evdev expects negative left/up and positive
//! right/down. A sideways half turns its vertical stick axis into the
//! horizontal one.
use evdev::{AbsoluteAxisCode, KeyCode};

use crate::{
    config::RemapOptions,
    drivers::joycon::{
        buttons::{AxisId, ButtonId},
        driver::Side,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMapping {
    pub button: ButtonId,
    pub code: KeyCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisMapping {
    pub axis: AxisId,
    pub invert: bool,
    pub code: AbsoluteAxisCode,
}

/// Key and axis layout of one virtual device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerMapping {
    pub keys: Vec<KeyMapping>,
    pub axes: Vec<AxisMapping>,
}

fn key(button: ButtonId, code: KeyCode) -> KeyMapping {
    KeyMapping { button, code }
}

fn axis(axis: AxisId, invert: bool, code: AbsoluteAxisCode) -> AxisMapping {
    AxisMapping { axis, invert, code }
}

impl ControllerMapping {
    /// A left half held sideways
    pub fn half_left() -> Self {
        Self {
            keys: vec![
                key(ButtonId::Left, KeyCode::BTN_SOUTH),
                key(ButtonId::Right, KeyCode::BTN_NORTH),
                key(ButtonId::Up, KeyCode::BTN_WEST),
                key(ButtonId::Down, KeyCode::BTN_EAST),
                key(ButtonId::LeftSL, KeyCode::BTN_TL),
                key(ButtonId::LeftSR, KeyCode::BTN_TR),
                key(ButtonId::L, KeyCode::BTN_TL2),
                key(ButtonId::ZL, KeyCode::BTN_TR2),
                key(ButtonId::Capture, KeyCode::BTN_START),
                key(ButtonId::Minus, KeyCode::BTN_SELECT),
                key(ButtonId::LeftStick, KeyCode::BTN_THUMBL),
            ],
            axes: vec![
                axis(AxisId::LeftVertical, false, AbsoluteAxisCode::ABS_X),
                axis(AxisId::LeftHorizontal, false, AbsoluteAxisCode::ABS_Y),
            ],
        }
    }

    /// A right half held sideways
    pub fn half_right() -> Self {
        Self {
            keys: vec![
                key(ButtonId::A, KeyCode::BTN_SOUTH),
                key(ButtonId::Y, KeyCode::BTN_NORTH),
                key(ButtonId::B, KeyCode::BTN_WEST),
                key(ButtonId::X, KeyCode::BTN_EAST),
                key(ButtonId::RightSL, KeyCode::BTN_TL),
                key(ButtonId::RightSR, KeyCode::BTN_TR),
                key(ButtonId::R, KeyCode::BTN_TL2),
                key(ButtonId::ZR, KeyCode::BTN_TR2),
                key(ButtonId::Home, KeyCode::BTN_START),
                key(ButtonId::Plus, KeyCode::BTN_SELECT),
                key(ButtonId::RightStick, KeyCode::BTN_THUMBL),
            ],
            axes: vec![
                axis(AxisId::RightVertical, true, AbsoluteAxisCode::ABS_X),
                axis(AxisId::RightHorizontal, true, AbsoluteAxisCode::ABS_Y),
            ],
        }
    }

    /// Two halves or a Pro Controller
    pub fn full() -> Self {
        Self {
            keys: vec![
                key(ButtonId::B, KeyCode::BTN_SOUTH),
                key(ButtonId::X, KeyCode::BTN_NORTH),
                key(ButtonId::Y, KeyCode::BTN_WEST),
                key(ButtonId::A, KeyCode::BTN_EAST),
                key(ButtonId::Up, KeyCode::BTN_DPAD_UP),
                key(ButtonId::Down, KeyCode::BTN_DPAD_DOWN),
                key(ButtonId::Left, KeyCode::BTN_DPAD_LEFT),
                key(ButtonId::Right, KeyCode::BTN_DPAD_RIGHT),
                key(ButtonId::L, KeyCode::BTN_TL),
                key(ButtonId::ZL, KeyCode::BTN_TL2),
                key(ButtonId::R, KeyCode::BTN_TR),
                key(ButtonId::ZR, KeyCode::BTN_TR2),
                key(ButtonId::LeftSL, KeyCode::BTN_TRIGGER_HAPPY1),
                key(ButtonId::LeftSR, KeyCode::BTN_TRIGGER_HAPPY2),
                key(ButtonId::RightSL, KeyCode::BTN_TRIGGER_HAPPY3),
                key(ButtonId::RightSR, KeyCode::BTN_TRIGGER_HAPPY4),
                key(ButtonId::Home, KeyCode::BTN_MODE),
                key(ButtonId::Capture, KeyCode::KEY_SYSRQ),
                key(ButtonId::Plus, KeyCode::BTN_START),
                key(ButtonId::Minus, KeyCode::BTN_SELECT),
                key(ButtonId::RightStick, KeyCode::BTN_THUMBR),
                key(ButtonId::LeftStick, KeyCode::BTN_THUMBL),
            ],
            axes: vec![
                axis(AxisId::LeftHorizontal, true, AbsoluteAxisCode::ABS_X),
                axis(AxisId::LeftVertical, false, AbsoluteAxisCode::ABS_Y),
                axis(AxisId::RightHorizontal, true, AbsoluteAxisCode::ABS_Z),
                axis(AxisId::RightVertical, false, AbsoluteAxisCode::ABS_RX),
            ],
        }
    }

    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Left => Self::half_left(),
            Side::Right => Self::half_right(),
            Side::Both => Self::full(),
        }
    }

    /// Toggles inversion of every axis listed in the remap options
    pub fn apply_remap(&mut self, remap: &RemapOptions) {
        for inverted in remap.inverted_axes.iter() {
            for mapping in self.axes.iter_mut() {
                if mapping.axis == *inverted {
                    mapping.invert = !mapping.invert;
                }
            }
        }
    }

    pub fn key_for(&self, button: ButtonId) -> Option<KeyCode> {
        self.keys
            .iter()
            .find(|mapping| mapping.button == button)
            .map(|mapping| mapping.code)
    }

    pub fn axis_for(&self, axis: AxisId) -> Option<&AxisMapping> {
        self.axes.iter().find(|mapping| mapping.axis == axis)
    }
}

impl AxisMapping {
    /// Applies the inversion flag to a stick value
    pub fn value(&self, value: i16) -> i32 {
        let value = value as i32;
        if self.invert {
            -value
        } else {
            value
        }
    }
}
