//! Button bitset as reported in bytes 3..=5 of every standard input report.
//!
//! Byte 0 carries the right unit's buttons, byte 1 the shared/meta buttons and
//! byte 2 the left unit's buttons. A [ButtonId] encodes its byte index in the
//! high byte and its bit mask in the low byte.
use std::fmt;

use super::driver::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ButtonId {
    // Byte 0 (Right)
    Y = 0x001,
    X = 0x002,
    B = 0x004,
    A = 0x008,
    RightSR = 0x010,
    RightSL = 0x020,
    R = 0x040,
    ZR = 0x080,
    // Byte 1 (Shared)
    Minus = 0x101,
    Plus = 0x102,
    RightStick = 0x104,
    LeftStick = 0x108,
    Home = 0x110,
    Capture = 0x120,
    Unused = 0x140,
    ChargingGrip = 0x180,
    // Byte 2 (Left)
    Down = 0x201,
    Up = 0x202,
    Right = 0x204,
    Left = 0x208,
    LeftSR = 0x210,
    LeftSL = 0x220,
    L = 0x240,
    ZL = 0x280,
}

impl ButtonId {
    /// Every defined button, in bit order.
    pub const ALL: [ButtonId; 24] = [
        ButtonId::Y,
        ButtonId::X,
        ButtonId::B,
        ButtonId::A,
        ButtonId::RightSR,
        ButtonId::RightSL,
        ButtonId::R,
        ButtonId::ZR,
        ButtonId::Minus,
        ButtonId::Plus,
        ButtonId::RightStick,
        ButtonId::LeftStick,
        ButtonId::Home,
        ButtonId::Capture,
        ButtonId::Unused,
        ButtonId::ChargingGrip,
        ButtonId::Down,
        ButtonId::Up,
        ButtonId::Right,
        ButtonId::Left,
        ButtonId::LeftSR,
        ButtonId::LeftSL,
        ButtonId::L,
        ButtonId::ZL,
    ];

    pub const fn byte_index(self) -> usize {
        (self as u16 >> 8) as usize
    }

    pub const fn mask(self) -> u8 {
        (self as u16 & 0xFF) as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            ButtonId::Y => "Y",
            ButtonId::X => "X",
            ButtonId::B => "B",
            ButtonId::A => "A",
            ButtonId::RightSR => "R-SR",
            ButtonId::RightSL => "R-SL",
            ButtonId::R => "R",
            ButtonId::ZR => "ZR",
            ButtonId::Minus => "-",
            ButtonId::Plus => "+",
            ButtonId::RightStick => "RStick",
            ButtonId::LeftStick => "LStick",
            ButtonId::Home => "Home",
            ButtonId::Capture => "Capture",
            ButtonId::Unused => "Unused",
            ButtonId::ChargingGrip => "Charging Grip",
            ButtonId::Down => "Down",
            ButtonId::Up => "Up",
            ButtonId::Right => "Right",
            ButtonId::Left => "Left",
            ButtonId::LeftSR => "L-SR",
            ButtonId::LeftSL => "L-SL",
            ButtonId::L => "L",
            ButtonId::ZL => "ZL",
        }
    }
}

impl fmt::Display for ButtonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Stick axis slots of a [super::driver::CombinedState]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisId {
    LeftHorizontal,
    LeftVertical,
    RightHorizontal,
    RightVertical,
}

impl AxisId {
    pub const ALL: [AxisId; 4] = [
        AxisId::LeftHorizontal,
        AxisId::LeftVertical,
        AxisId::RightHorizontal,
        AxisId::RightVertical,
    ];

    /// Returns the (stick, axis) index pair into `[[i16; 2]; 2]` stick arrays
    pub const fn index(self) -> (usize, usize) {
        match self {
            AxisId::LeftHorizontal => (0, 0),
            AxisId::LeftVertical => (0, 1),
            AxisId::RightHorizontal => (1, 0),
            AxisId::RightVertical => (1, 1),
        }
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AxisId::LeftHorizontal => "Left/Right",
            AxisId::LeftVertical => "Up/Down",
            AxisId::RightHorizontal => "2nd Left/Right",
            AxisId::RightVertical => "2nd Up/Down",
        };
        write!(f, "{name}")
    }
}

/// Fixed 24-flag button bitset. All operations return new values.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ButtonState(pub [u8; 3]);

// Bits owned by each physical half
const LEFT_OWNED: ButtonState = ButtonState([0x00, 0x08 | 0x20 | 0x01, 0xFF]);
const RIGHT_OWNED: ButtonState = ButtonState([0xFF, 0x10 | 0x02 | 0x04, 0x00]);

/// SL+SR on a sideways right unit
pub const SLSR_RIGHT: ButtonState = ButtonState([0x10 | 0x20, 0, 0]);
/// SL+SR on a sideways left unit
pub const SLSR_LEFT: ButtonState = ButtonState([0, 0, 0x10 | 0x20]);
/// R and ZR of an upright right unit
pub const R_ZR: ButtonState = ButtonState([0x40 | 0x80, 0, 0]);
/// L and ZL of an upright left unit
pub const L_ZL: ButtonState = ButtonState([0, 0, 0x40 | 0x80]);
/// L+R chord of a full controller
pub const L_R: ButtonState = ButtonState([0x40, 0, 0x40]);
/// ZL+ZR chord of a full controller
pub const ZL_ZR: ButtonState = ButtonState([0x80, 0, 0x80]);
/// Every bit that can take part in a pairing gesture
pub const ANY_PAIRING: ButtonState = ButtonState([
    R_ZR.0[0] | SLSR_RIGHT.0[0],
    0,
    L_ZL.0[2] | SLSR_LEFT.0[2],
]);

impl ButtonState {
    pub const EMPTY: ButtonState = ButtonState([0; 3]);

    /// Copies the three button bytes out of a report slice
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut state = Self::EMPTY;
        for (dst, src) in state.0.iter_mut().zip(bytes.iter()) {
            *dst = *src;
        }
        state
    }

    pub fn get(&self, id: ButtonId) -> bool {
        self.0[id.byte_index()] & id.mask() != 0
    }

    pub fn set(mut self, id: ButtonId, value: bool) -> Self {
        let byte = &mut self.0[id.byte_index()];
        *byte &= !id.mask();
        if value {
            *byte |= id.mask();
        }
        self
    }

    pub fn union(self, other: ButtonState) -> Self {
        Self([
            self.0[0] | other.0[0],
            self.0[1] | other.0[1],
            self.0[2] | other.0[2],
        ])
    }

    /// Bits that differ between the two states
    pub fn diff_mask(self, other: ButtonState) -> Self {
        Self([
            self.0[0] ^ other.0[0],
            self.0[1] ^ other.0[1],
            self.0[2] ^ other.0[2],
        ])
    }

    pub fn has_all(&self, mask: ButtonState) -> bool {
        self.0.iter().zip(mask.0.iter()).all(|(b, m)| b & m == *m)
    }

    pub fn has_any(&self, mask: ButtonState) -> bool {
        self.0.iter().zip(mask.0.iter()).any(|(b, m)| b & m != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0; 3]
    }

    /// Clears every bit that the given side is responsible for, so that side
    /// can contribute its own bits without clobbering the other half.
    pub fn remove(self, side: Side) -> Self {
        let owned = match side {
            Side::Left => LEFT_OWNED,
            Side::Right => RIGHT_OWNED,
            Side::Both => LEFT_OWNED.union(RIGHT_OWNED),
        };
        Self([
            self.0[0] & !owned.0[0],
            self.0[1] & !owned.0[1],
            self.0[2] & !owned.0[2],
        ])
    }

    /// Iterates over the buttons currently set
    pub fn pressed(&self) -> impl Iterator<Item = ButtonId> + '_ {
        ButtonId::ALL.into_iter().filter(|id| self.get(*id))
    }
}

impl fmt::Display for ButtonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.pressed().map(|id| id.name()).collect();
        write!(f, "[{}]", names.join(" "))
    }
}
