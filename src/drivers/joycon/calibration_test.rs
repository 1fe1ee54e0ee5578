use crate::drivers::joycon::{
    calibration::{
        decode_u12, parse_user_calibration, FactoryCalibration, Rgb, StickCalibration,
        STICK_RANGE,
    },
    driver::Side,
};

fn encode_u12(a: u16, b: u16) -> [u8; 3] {
    [
        (a & 0xFF) as u8,
        (((a >> 8) & 0xF) as u8) | (((b & 0xF) as u8) << 4),
        (b >> 4) as u8,
    ]
}

fn calibration() -> StickCalibration {
    StickCalibration {
        x_max_offset: 0x500,
        y_max_offset: 0x4A0,
        x_center: 0x7F0,
        y_center: 0x810,
        x_min_offset: 0x480,
        y_min_offset: 0x520,
    }
}

#[test]
fn test_decode_u12() {
    assert_eq!(decode_u12(&[0x34, 0x62, 0x86]), (0x234, 0x866));
    assert_eq!(decode_u12(&encode_u12(0xABC, 0x123)), (0xABC, 0x123));
}

#[test]
fn test_adjust_center_and_extremes() {
    let cal = calibration();
    assert_eq!(cal.adjust([cal.x_center, cal.y_center]), [0, 0]);

    let max = cal.adjust([cal.x_center + cal.x_max_offset, cal.y_center]);
    assert_eq!(max, [STICK_RANGE, 0]);

    let min = cal.adjust([cal.x_center, cal.y_center - cal.y_min_offset]);
    assert_eq!(min, [0, -STICK_RANGE]);
}

#[test]
fn test_adjust_preserves_angle_when_saturated() {
    let cal = calibration();
    let raw = [0xFFF, 0xF80];

    // Both axes would exceed the range on their own
    let naive_x = (raw[0] as i32 - cal.x_center as i32) * 0x7FF / cal.x_max_offset as i32;
    let naive_y = (raw[1] as i32 - cal.y_center as i32) * 0x7FF / cal.y_max_offset as i32;
    assert!(naive_x > 0x7FF && naive_y > 0x7FF);

    let [x, y] = cal.adjust(raw);
    assert!(x.abs() <= STICK_RANGE && y.abs() <= STICK_RANGE);
    assert!(x == STICK_RANGE || y == STICK_RANGE);

    let expected = (naive_y as f64).atan2(naive_x as f64);
    let actual = (y as f64).atan2(x as f64);
    assert!(
        (expected - actual).abs() < 0.01,
        "angle drifted: {expected} vs {actual}"
    );
}

#[test]
fn test_blank_calibration_uses_fallback() {
    let blank = StickCalibration {
        x_center: 0xFFF,
        ..calibration()
    };
    assert_eq!(blank.adjust([0x800, 0x800]), [0, 0]);
    assert_eq!(blank.adjust([0xC00, 0x800]), [STICK_RANGE, 0]);
}

#[test]
fn test_parse_sides() {
    let max = encode_u12(0x501, 0x502);
    let center = encode_u12(0x7F3, 0x804);
    let min = encode_u12(0x485, 0x486);

    let left: Vec<u8> = [max, center, min].concat();
    let parsed = StickCalibration::parse(&left, Side::Left);
    assert_eq!(parsed.x_max_offset, 0x501);
    assert_eq!(parsed.y_center, 0x804);
    assert_eq!(parsed.x_min_offset, 0x485);

    let right: Vec<u8> = [center, min, max].concat();
    assert_eq!(StickCalibration::parse(&right, Side::Right), parsed);
}

#[test]
fn test_parse_factory_region() {
    let max = encode_u12(0x500, 0x500);
    let center = encode_u12(0x800, 0x800);
    let min = encode_u12(0x400, 0x400);

    let mut data: Vec<u8> = [max, center, min, center, min, max].concat();
    data.push(0xFF);
    data.extend_from_slice(&[0x0A, 0xB9, 0xE6, 0x00, 0x1E, 0x1E]);

    let factory = FactoryCalibration::parse(&data).expect("region should parse");
    assert_eq!(factory.sticks[0], factory.sticks[1]);
    assert_eq!(factory.sticks[0].x_max_offset, 0x500);
    assert_eq!(
        factory.colors.body,
        Rgb {
            r: 0x0A,
            g: 0xB9,
            b: 0xE6
        }
    );
    assert_eq!(factory.colors.buttons.to_string(), "#001E1E");

    assert!(FactoryCalibration::parse(&data[..20]).is_none());
}

#[test]
fn test_parse_user_region() {
    let cal: Vec<u8> = [
        encode_u12(0x500, 0x500),
        encode_u12(0x800, 0x800),
        encode_u12(0x400, 0x400),
    ]
    .concat();

    let mut data = vec![0xB2, 0xA1];
    data.extend_from_slice(&cal);
    data.extend_from_slice(&[0xFF, 0xFF]);
    data.extend_from_slice(&cal);

    let [left, right] = parse_user_calibration(&data);
    let left = left.expect("left magic matches");
    assert_eq!(left.x_max_offset, 0x500);
    assert!(right.is_none());
}
