use evdev::{AbsoluteAxisCode, KeyCode};

use crate::{
    config::RemapOptions,
    drivers::joycon::{
        buttons::{AxisId, ButtonId},
        driver::Side,
    },
    input::target::mapping::ControllerMapping,
};

#[test]
fn test_half_mappings() {
    let left = ControllerMapping::for_side(Side::Left);
    assert_eq!(left.key_for(ButtonId::Left), Some(KeyCode::BTN_SOUTH));
    assert_eq!(left.key_for(ButtonId::A), None);
    let stick = left.axis_for(AxisId::LeftVertical).expect("axis is mapped");
    assert_eq!(stick.code, AbsoluteAxisCode::ABS_X);
    assert!(!stick.invert);

    let right = ControllerMapping::for_side(Side::Right);
    assert_eq!(right.key_for(ButtonId::Home), Some(KeyCode::BTN_START));
    assert!(right.axis_for(AxisId::LeftVertical).is_none());
    assert_eq!(right.axis_for(AxisId::RightHorizontal).map(|a| a.value(100)), Some(-100));
}

#[test]
fn test_full_mapping_covers_both_halves() {
    let full = ControllerMapping::full();
    assert_eq!(full.key_for(ButtonId::B), Some(KeyCode::BTN_SOUTH));
    assert_eq!(full.key_for(ButtonId::Up), Some(KeyCode::BTN_DPAD_UP));
    assert_eq!(full.key_for(ButtonId::Home), Some(KeyCode::BTN_MODE));
    assert_eq!(full.axes.len(), 4);

    // No evdev code is used twice
    for (i, a) in full.keys.iter().enumerate() {
        for b in full.keys.iter().skip(i + 1) {
            assert_ne!(a.code, b.code, "{} and {} collide", a.button, b.button);
        }
    }
}

#[test]
fn test_remap_toggles_inversion() {
    let mut full = ControllerMapping::full();
    let remap = RemapOptions {
        inverted_axes: vec![AxisId::LeftHorizontal, AxisId::RightVertical],
    };
    full.apply_remap(&remap);

    let lh = full.axis_for(AxisId::LeftHorizontal).expect("axis is mapped");
    assert!(!lh.invert);
    assert_eq!(lh.value(-0x7FF), -0x7FF);
    let rv = full.axis_for(AxisId::RightVertical).expect("axis is mapped");
    assert!(rv.invert);
    assert_eq!(rv.value(0x7FF), -0x7FF);

    // Axes the mapping lacks are ignored
    let mut left = ControllerMapping::half_left();
    left.apply_remap(&remap);
    assert_eq!(left, {
        let mut expected = ControllerMapping::half_left();
        expected.axes[1].invert = true;
        expected
    });
}

#[test]
fn test_console_output_format() {
    let output = crate::input::target::console::ConsoleOutput::new(2);
    assert_eq!(
        output.format_button(ButtonId::ZL, true),
        "[Controller 2] ZL pressed"
    );
    assert_eq!(
        output.format_button(ButtonId::Plus, false),
        "[Controller 2] + released"
    );
}
