use crate::drivers::joycon::rumble::{RumbleData, RumbleScheduler};

#[test]
fn test_neutral_only_written_once() {
    let mut scheduler = RumbleScheduler::default();

    let first = scheduler.next_frame();
    assert!(first.changed);
    assert_eq!(first.data, RumbleData::NEUTRAL.data);

    // The neutral pattern repeats silently, including after it runs out
    for _ in 0..20 {
        let frame = scheduler.next_frame();
        assert!(!frame.changed);
        assert_eq!(frame.data, RumbleData::NEUTRAL.data);
    }
}

#[test]
fn test_queued_pattern_plays_for_its_frames() {
    let mut scheduler = RumbleScheduler::default();
    scheduler.next_frame();
    while scheduler.next_frame().changed {}

    let pattern = RumbleData::new([1, 2, 3, 4, 5, 6, 7, 8], 2);
    scheduler.push(&[pattern]);
    assert_eq!(scheduler.queued(), 1);

    // Drain what remains of the current neutral frame count
    let mut frame = scheduler.next_frame();
    while !frame.changed {
        frame = scheduler.next_frame();
    }
    assert_eq!(frame.data, pattern.data);
    assert_eq!(scheduler.queued(), 0);

    // Repeated for two more frames without being marked as changed
    for _ in 0..2 {
        let frame = scheduler.next_frame();
        assert!(!frame.changed);
        assert_eq!(frame.data, pattern.data);
    }

    // Then back to neutral
    let frame = scheduler.next_frame();
    assert!(frame.changed);
    assert_eq!(frame.data, RumbleData::NEUTRAL.data);
}
