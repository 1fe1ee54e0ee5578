//! Analog stick calibration stored in SPI flash.
//!
//! Sources:
//! - https://github.com/dekuNukem/Nintendo_Switch_Reverse_Engineering/blob/master/spi_flash_notes.md
use std::fmt;

use super::driver::Side;

/// Factory stick calibration followed by the body and button colors
pub const FACTORY_CALIBRATION_ADDR: u32 = 0x603D;
pub const FACTORY_CALIBRATION_LEN: u8 = 25;
/// User stick calibration, each half prefixed by a magic marker
pub const USER_CALIBRATION_ADDR: u32 = 0x8010;
pub const USER_CALIBRATION_LEN: u8 = 22;

const USER_CALIBRATION_MAGIC: u16 = 0xA1B2;
const COLOR_OFFSET: usize = 19;

/// Output range of an adjusted stick axis
pub const STICK_RANGE: i16 = 0x7FF;

/// Decodes two packed 12-bit values from three bytes
pub fn decode_u12(bytes: &[u8]) -> (u16, u16) {
    let b0 = bytes[0] as u16;
    let b1 = bytes[1] as u16;
    let b2 = bytes[2] as u16;
    (b0 | ((b1 & 0xF) << 8), (b1 >> 4) | (b2 << 4))
}

/// Per-stick calibration triplet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StickCalibration {
    pub x_max_offset: u16,
    pub y_max_offset: u16,
    pub x_center: u16,
    pub y_center: u16,
    pub x_min_offset: u16,
    pub y_min_offset: u16,
}

impl Default for StickCalibration {
    fn default() -> Self {
        Self::FALLBACK
    }
}

impl StickCalibration {
    /// Used until the real calibration has been read, or when flash is blank
    pub const FALLBACK: StickCalibration = StickCalibration {
        x_max_offset: 0x400,
        y_max_offset: 0x400,
        x_center: 0x800,
        y_center: 0x800,
        x_min_offset: 0x400,
        y_min_offset: 0x400,
    };

    /// Parses 9 bytes of calibration. The left and right sticks store the
    /// triplet in different orders.
    pub fn parse(bytes: &[u8], side: Side) -> Self {
        let (first, second, third) = (
            decode_u12(&bytes[0..3]),
            decode_u12(&bytes[3..6]),
            decode_u12(&bytes[6..9]),
        );
        let (max, center, min) = match side {
            Side::Right => (third, first, second),
            _ => (first, second, third),
        };
        Self {
            x_max_offset: max.0,
            y_max_offset: max.1,
            x_center: center.0,
            y_center: center.1,
            x_min_offset: min.0,
            y_min_offset: min.1,
        }
    }

    fn is_usable(&self) -> bool {
        const BLANK: u16 = 0xFFF;
        self.x_center != BLANK
            && self.y_center != BLANK
            && [
                self.x_max_offset,
                self.y_max_offset,
                self.x_min_offset,
                self.y_min_offset,
            ]
            .iter()
            .all(|v| *v != 0)
    }

    /// Maps a raw 12-bit (x, y) reading into [-0x7FF, 0x7FF] on both axes.
    /// Saturated readings are scaled back along their angle before clamping.
    pub fn adjust(&self, raw: [u16; 2]) -> [i16; 2] {
        let cal = if self.is_usable() {
            self
        } else {
            &Self::FALLBACK
        };

        let scale = |value: u16, center: u16, min: u16, max: u16| -> i32 {
            let delta = value as i32 - center as i32;
            let offset = if value < center { min } else { max };
            delta * STICK_RANGE as i32 / offset as i32
        };
        let x = scale(raw[0], cal.x_center, cal.x_min_offset, cal.x_max_offset);
        let y = scale(raw[1], cal.y_center, cal.y_min_offset, cal.y_max_offset);

        let range = STICK_RANGE as i32;
        if x.abs() <= range && y.abs() <= range {
            return [x as i16, y as i16];
        }

        let (mut fx, mut fy) = (x as f64, y as f64);
        let over = fx.abs().max(fy.abs()) / range as f64;
        fx /= over;
        fy /= over;
        let range = range as f64;
        [
            fx.round().clamp(-range, range) as i16,
            fy.round().clamp(-range, range) as i16,
        ]
    }
}

impl fmt::Display for StickCalibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "center ({:#x}, {:#x}) min ({:#x}, {:#x}) max ({:#x}, {:#x})",
            self.x_center,
            self.y_center,
            self.x_min_offset,
            self.y_min_offset,
            self.x_max_offset,
            self.y_max_offset
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Body and button colors of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Colors {
    pub body: Rgb,
    pub buttons: Rgb,
}

/// Contents of the factory calibration region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactoryCalibration {
    pub sticks: [StickCalibration; 2],
    pub colors: Colors,
}

impl FactoryCalibration {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FACTORY_CALIBRATION_LEN as usize {
            return None;
        }
        let rgb = |offset: usize| Rgb {
            r: data[offset],
            g: data[offset + 1],
            b: data[offset + 2],
        };
        Some(Self {
            sticks: [
                StickCalibration::parse(&data[0..9], Side::Left),
                StickCalibration::parse(&data[9..18], Side::Right),
            ],
            colors: Colors {
                body: rgb(COLOR_OFFSET),
                buttons: rgb(COLOR_OFFSET + 3),
            },
        })
    }
}

/// Parses the user calibration region. Each stick is only present when its
/// magic marker matches.
pub fn parse_user_calibration(data: &[u8]) -> [Option<StickCalibration>; 2] {
    if data.len() < USER_CALIBRATION_LEN as usize {
        return [None, None];
    }
    let has_magic = |offset: usize| {
        u16::from_le_bytes([data[offset], data[offset + 1]]) == USER_CALIBRATION_MAGIC
    };
    let left = has_magic(0).then(|| StickCalibration::parse(&data[2..11], Side::Left));
    let right = has_magic(11).then(|| StickCalibration::parse(&data[13..22], Side::Right));
    [left, right]
}
