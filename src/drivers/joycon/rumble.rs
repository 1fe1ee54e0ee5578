use std::collections::VecDeque;

/// One rumble pattern and the number of frames it should be repeated for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RumbleData {
    pub data: [u8; 8],
    pub frames: u32,
}

impl RumbleData {
    pub const NEUTRAL: RumbleData = RumbleData {
        data: [0x00, 0x01, 0x40, 0x40, 0x00, 0x01, 0x40, 0x40],
        frames: 8,
    };

    pub fn new(data: [u8; 8], frames: u32) -> Self {
        Self { data, frames }
    }
}

/// Next rumble frame produced by the [RumbleScheduler]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RumbleFrame {
    pub data: [u8; 8],
    /// False when the frame repeats the previous pattern and need not be
    /// written on its own
    pub changed: bool,
}

/// Plays queued rumble patterns one frame at a time, falling back to the
/// neutral pattern when the queue runs dry.
#[derive(Debug)]
pub struct RumbleScheduler {
    queue: VecDeque<RumbleData>,
    current: RumbleData,
}

impl Default for RumbleScheduler {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            // Start non-neutral so the first frame is always written
            current: RumbleData::new([0; 8], 0),
        }
    }
}

impl RumbleScheduler {
    pub fn push(&mut self, patterns: &[RumbleData]) {
        self.queue.extend(patterns.iter().copied());
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn next_frame(&mut self) -> RumbleFrame {
        if self.current.frames > 0 {
            self.current.frames -= 1;
            return RumbleFrame {
                data: self.current.data,
                changed: false,
            };
        }

        if let Some(next) = self.queue.pop_front() {
            self.current = next;
            return RumbleFrame {
                data: next.data,
                changed: true,
            };
        }

        let changed = self.current.data != RumbleData::NEUTRAL.data;
        self.current = RumbleData::NEUTRAL;
        RumbleFrame {
            data: self.current.data,
            changed,
        }
    }
}
