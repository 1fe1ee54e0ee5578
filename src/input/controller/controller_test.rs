use std::{error::Error, sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::{
    drivers::joycon::{
        buttons::{AxisId, ButtonId, ButtonState},
        driver::{CombinedState, Driver, InputMode, Notification, NotifyFlags, Side},
        mock::{input_report, MockHandle},
        rumble::RumbleData,
    },
    input::{
        controller::{dispatch_updates, dual::MERGE_WINDOW, Controller, UpdateOutcome},
        target::recorder::{CallLog, OutputCall, Recorder},
    },
};

fn new_driver(
    serial: &str,
    side: Side,
) -> (Arc<Driver>, Arc<MockHandle>, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel(64);
    let handle = MockHandle::new();
    let driver = Driver::new(serial.to_string(), side, handle.clone(), tx);
    (driver, handle, rx)
}

fn bind_recorder(controller: &Controller) -> CallLog {
    let (recorder, calls) = Recorder::new();
    controller.bind(Box::new(recorder));
    calls
}

fn button_calls(calls: &CallLog) -> Vec<(ButtonId, bool)> {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter_map(|call| match call {
            OutputCall::Button(button, pressed) => Some((*button, *pressed)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_dispatch_only_changed_fields() -> Result<(), Box<dyn Error>> {
    let (mut recorder, calls) = Recorder::new();
    let previous = CombinedState {
        buttons: ButtonState::EMPTY.set(ButtonId::B, true),
        ..Default::default()
    };
    let mut current = previous;
    current.buttons = current.buttons.set(ButtonId::B, false).set(ButtonId::A, true);
    current.sticks[1][0] = 0x123;

    dispatch_updates(&previous, &current, &mut recorder)?;
    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            OutputCall::Begin,
            OutputCall::Button(ButtonId::B, false),
            OutputCall::Button(ButtonId::A, true),
            OutputCall::Stick(AxisId::RightHorizontal, 0x123),
            OutputCall::Flush,
        ]
    );

    // Gyro frames are forwarded once any of them is non-zero
    calls.lock().unwrap().clear();
    let mut moving = current;
    moving.gyro[2] = [1, 0, 0, 0, 0, 0];
    dispatch_updates(&current, &moving, &mut recorder)?;
    let gyro = calls
        .lock()
        .unwrap()
        .iter()
        .filter(|call| matches!(call, OutputCall::Gyro(_)))
        .count();
    assert_eq!(gyro, 3);
    Ok(())
}

#[tokio::test]
async fn test_single_passthrough_and_mode_transition() -> Result<(), Box<dyn Error>> {
    let (driver, _handle, _rx) = new_driver("left", Side::Left);
    let controller = Controller::single(driver.clone());
    assert_eq!(controller.side(), Side::Left);
    let calls = bind_recorder(&controller);

    let pressed = ButtonState::EMPTY.set(ButtonId::Up, true);
    driver.handle_packet(&input_report(0x21, pressed));
    assert_eq!(
        controller.update(&driver, NotifyFlags::INPUT),
        UpdateOutcome::Keep
    );
    assert_eq!(button_calls(&calls), vec![(ButtonId::Up, true)]);

    // Unchanged input produces an empty update
    controller.update(&driver, NotifyFlags::INPUT);
    assert_eq!(button_calls(&calls).len(), 1);
    assert_eq!(driver.input_mode(), InputMode::LazyButtons);

    // Third update switches to standard mode
    controller.update(&driver, NotifyFlags::INPUT);
    assert_eq!(driver.input_mode(), InputMode::Standard);
    Ok(())
}

#[tokio::test]
async fn test_pro_reports_full_side() -> Result<(), Box<dyn Error>> {
    let (driver, _handle, _rx) = new_driver("pro", Side::Both);
    let controller = Controller::pro(driver.clone());
    assert_eq!(controller.side(), Side::Both);
    assert!(controller.contains(&driver));
    assert_eq!(controller.drivers().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_dual_merges_both_halves_in_any_order() -> Result<(), Box<dyn Error>> {
    let left_buttons = ButtonState::EMPTY
        .set(ButtonId::LeftSL, true)
        .set(ButtonId::LeftSR, true);
    let right_buttons = ButtonState::EMPTY.set(ButtonId::A, true);

    for left_first in [true, false] {
        let (left, _lh, _lrx) = new_driver("left", Side::Left);
        let (right, _rh, _rrx) = new_driver("right", Side::Right);
        let controller = Controller::dual(left.clone(), right.clone());
        let calls = bind_recorder(&controller);

        left.handle_packet(&input_report(0x30, left_buttons));
        right.handle_packet(&input_report(0x30, right_buttons));
        let order = if left_first {
            [&left, &right]
        } else {
            [&right, &left]
        };
        for driver in order {
            controller.update(driver, NotifyFlags::INPUT);
        }

        let mut pressed = button_calls(&calls);
        pressed.sort_by_key(|(button, _)| *button as u16);
        assert_eq!(
            pressed,
            vec![
                (ButtonId::A, true),
                (ButtonId::LeftSR, true),
                (ButtonId::LeftSL, true),
            ]
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_dual_flushes_after_window() -> Result<(), Box<dyn Error>> {
    let (left, _lh, _lrx) = new_driver("left", Side::Left);
    let (right, _rh, _rrx) = new_driver("right", Side::Right);
    let controller = Controller::dual(left.clone(), right.clone());
    let calls = bind_recorder(&controller);

    left.handle_packet(&input_report(0x30, ButtonState::EMPTY.set(ButtonId::ZL, true)));
    controller.update(&left, NotifyFlags::INPUT);
    assert!(button_calls(&calls).is_empty());

    tokio::time::sleep(MERGE_WINDOW + Duration::from_millis(5)).await;
    controller.on_frame();
    assert_eq!(button_calls(&calls), vec![(ButtonId::ZL, true)]);
    assert!(calls.lock().unwrap().contains(&OutputCall::Frame));
    Ok(())
}

#[tokio::test]
async fn test_remove_only_when_stopping() -> Result<(), Box<dyn Error>> {
    let (driver, handle, _rx) = new_driver("right", Side::Right);
    let controller = Controller::single(driver.clone());

    // A transient write failure keeps the controller around
    handle.fail_writes(true);
    driver.on_frame();
    assert!(driver.wants_reconnect());
    assert_eq!(
        controller.update(&driver, NotifyFlags::CONNECTION),
        UpdateOutcome::Keep
    );

    driver.shutdown();
    assert_eq!(
        controller.update(&driver, NotifyFlags::CONNECTION),
        UpdateOutcome::Remove
    );
    Ok(())
}

#[tokio::test]
async fn test_close_releases_output_and_drivers() -> Result<(), Box<dyn Error>> {
    let (left, left_handle, _lrx) = new_driver("left", Side::Left);
    let (right, right_handle, _rrx) = new_driver("right", Side::Right);
    let controller = Controller::dual(left.clone(), right.clone());
    let calls = bind_recorder(&controller);

    controller.close();
    assert_eq!(calls.lock().unwrap().last(), Some(&OutputCall::Close));
    assert!(left.is_stopping() && right.is_stopping());
    assert!(left_handle.is_closed() && right_handle.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_rumble_fans_out() -> Result<(), Box<dyn Error>> {
    let (left, left_handle, _lrx) = new_driver("left", Side::Left);
    let (right, right_handle, _rrx) = new_driver("right", Side::Right);
    let controller = Controller::dual(left.clone(), right.clone());

    let pattern = RumbleData::new([0x28, 0x88, 0x60, 0x61, 0x28, 0x88, 0x60, 0x61], 5);
    controller.rumble(&[pattern]);
    for (driver, handle) in [(&left, &left_handle), (&right, &right_handle)] {
        driver.on_frame();
        let written = handle.take_written();
        assert_eq!(&written[0][2..10], &pattern.data);
    }
    Ok(())
}

#[tokio::test]
async fn test_dual_drops_gyro_once_disabled() -> Result<(), Box<dyn Error>> {
    let (left, _lh, _lrx) = new_driver("left", Side::Left);
    let (right, _rh, _rrx) = new_driver("right", Side::Right);
    let controller = Controller::dual(left.clone(), right.clone());
    let calls = bind_recorder(&controller);
    let gyro_calls = || {
        calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| matches!(call, OutputCall::Gyro(_)))
            .count()
    };

    let mut moving = input_report(0x30, ButtonState::EMPTY);
    moving[13] = 0x05;
    let merge = |report: &[u8]| {
        left.handle_packet(&input_report(0x30, ButtonState::EMPTY));
        right.handle_packet(report);
        controller.update(&left, NotifyFlags::INPUT);
        controller.update(&right, NotifyFlags::INPUT);
    };

    right.enable_gyro(true);
    merge(&moving);
    assert_eq!(gyro_calls(), 3);

    right.enable_gyro(false);
    calls.lock().unwrap().clear();
    merge(&moving);
    merge(&moving);
    assert_eq!(gyro_calls(), 0);
    Ok(())
}
