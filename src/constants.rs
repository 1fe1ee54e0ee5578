use std::time::Duration;

/// Interval between output frames (~60Hz)
pub const FRAME_INTERVAL: Duration = Duration::from_micros(16666);
/// Interval between device scans
pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);
/// Default number of player slots
pub const MAX_CONTROLLERS: usize = 4;
/// Player light pattern for each slot. Index 0 is unused.
pub const PLAYER_LIGHTS: [u8; 9] = [0xF0, 0x01, 0x03, 0x07, 0x0F, 0x05, 0x09, 0x06, 0x0A];
/// Capacity of the driver notification channel
pub const NOTIFICATION_CAPACITY: usize = 1024;
/// Time given to the last packets to flush on shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);
