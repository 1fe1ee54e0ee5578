use std::{
    collections::VecDeque,
    fmt,
    ops::{BitOr, BitOrAssign},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    thread,
    time::Duration,
};

use packed_struct::prelude::*;
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};

use crate::sync::{ReceiveTimeoutError, TimeoutReceiver};

use super::{
    buttons::ButtonState,
    calibration::{
        decode_u12, parse_user_calibration, Colors, FactoryCalibration, StickCalibration,
        FACTORY_CALIBRATION_ADDR, FACTORY_CALIBRATION_LEN, USER_CALIBRATION_ADDR,
        USER_CALIBRATION_LEN,
    },
    hid_report::{
        output_report, parse_imu_frames, parse_spi_reply, shutdown_report, subcommand_reply_id,
        BatteryConnection, DeviceInfoReply, GyroFrame, PackedInputReport, ReportType,
        SubcommandId, INPUT_HEADER_SIZE, REPLY_DATA_OFFSET, SPI_FLASH_SIZE, SPI_MAX_DATA,
    },
    rumble::{RumbleData, RumbleScheduler},
    transport::{HidHandle, TransportError},
};

// Hardware IDs
pub const VID: u16 = 0x057e;
pub const PID_LEFT: u16 = 0x2006;
pub const PID_RIGHT: u16 = 0x2007;
pub const PID_PRO: u16 = 0x2009;
pub const PID_CHARGING_GRIP: u16 = 0x200e;

/// Size of the HID read buffer
const PACKET_SIZE: usize = 0x100;
/// How long a single transport read may block
const READ_TIMEOUT_MS: i32 = 4;
/// Delay between retries while the reader has no handle
const IDLE_SLEEP: Duration = Duration::from_millis(10);
/// Delay before reading calibration after connecting
const CALIBRATION_DELAY: Duration = Duration::from_millis(100);
/// How long to wait for a single SPI read reply
pub const SPI_TIMEOUT: Duration = Duration::from_secs(1);
/// Concurrent workers used for SPI reads larger than [SPI_MAX_DATA]
const SPI_READ_WORKERS: usize = 3;
/// Retries per chunk after the first failed attempt
const SPI_READ_RETRIES: usize = 4;

/// Which half (or both halves) of a controller a physical unit provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
    Both,
}

impl Side {
    pub fn is_left(&self) -> bool {
        matches!(self, Side::Left | Side::Both)
    }

    pub fn is_right(&self) -> bool {
        matches!(self, Side::Right | Side::Both)
    }

    /// Maps a product id (and interface number for the charging grip) to the
    /// side the enumerated interface provides
    pub fn from_product(product_id: u16, interface_number: i32) -> Option<Side> {
        match product_id {
            PID_LEFT => Some(Side::Left),
            PID_RIGHT => Some(Side::Right),
            PID_PRO => Some(Side::Both),
            PID_CHARGING_GRIP => match interface_number {
                0 => Some(Side::Left),
                1 => Some(Side::Right),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Side::Left => "Left Joy-Con",
            Side::Right => "Right Joy-Con",
            Side::Both => "Pro Controller",
        };
        write!(f, "{name}")
    }
}

/// Input report mode of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InputMode {
    IrPolling = 0x00,
    IrPollingUnused = 0x01,
    IrPollingSpecial = 0x02,
    /// Not fully known
    McuUpdate = 0x23,
    Standard = 0x30,
    Nfc = 0x31,
    Unknown33 = 0x33,
    Unknown35 = 0x35,
    LazyButtons = 0x3F,
    /// Driver-only mode that keeps sending rumble packets every frame
    ActivePolling = 0x13F,
}

impl InputMode {
    pub fn needs_empty_rumbles(&self) -> bool {
        *self == InputMode::ActivePolling
    }

    /// Value sent to the device with the set input mode subcommand
    pub fn report_byte(&self) -> u8 {
        (*self as u16 & 0xFF) as u8
    }
}

/// Reasons a [Notification] was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotifyFlags(u8);

impl NotifyFlags {
    pub const INPUT: NotifyFlags = NotifyFlags(1);
    pub const CONNECTION: NotifyFlags = NotifyFlags(1 << 1);
    pub const BATTERY: NotifyFlags = NotifyFlags(1 << 2);

    pub fn contains(&self, other: NotifyFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for NotifyFlags {
    type Output = NotifyFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        NotifyFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for NotifyFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Informational event from a [Driver]. Receivers re-read driver state.
#[derive(Clone)]
pub struct Notification {
    pub driver: Arc<Driver>,
    pub flags: NotifyFlags,
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("serial", &self.driver.serial())
            .field("flags", &self.flags)
            .finish()
    }
}

/// Input state of one logical controller for a single update
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CombinedState {
    /// Three most recent IMU frames
    pub gyro: [GyroFrame; 3],
    /// [left, right][horizontal, vertical], each in [-0x7FF, 0x7FF]
    pub sticks: [[i16; 2]; 2],
    pub buttons: ButtonState,
}

/// Possible errors from a [Driver]
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("device is not connected")]
    NotConnected,
    #[error("device has been shut down")]
    Stopped,
    #[error("timed out waiting for SPI read of {length} bytes at {address:#x}")]
    Timeout { address: u32, length: u8 },
    #[error("reply channel closed")]
    ChannelClosed,
    #[error("payload of {len} bytes exceeds the maximum of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("SPI range of {length} bytes at {address:#x} is outside the flash")]
    OutOfRange { address: u32, length: usize },
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    #[error("failed to pack report: {0}")]
    Packing(#[from] PackingError),
}

impl DriverError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout { .. } | DriverError::ChannelClosed | DriverError::MalformedReply(_)
        )
    }
}

/// Rejects ranges that run past the end of the flash
fn check_flash_range(address: u32, length: usize) -> Result<(), DriverError> {
    let end = u32::try_from(length)
        .ok()
        .and_then(|length| address.checked_add(length));
    match end {
        Some(end) if end <= SPI_FLASH_SIZE => Ok(()),
        _ => Err(DriverError::OutOfRange { address, length }),
    }
}

/// Outstanding SPI read waiting for its reply
#[derive(Debug)]
struct SpiRequest {
    address: u32,
    length: u8,
    tx: oneshot::Sender<Vec<u8>>,
}

struct DriverState {
    handle: Option<Arc<dyn HidHandle>>,
    /// Cleared on a transport error; [Driver::reconnect] sets it again
    is_alive: bool,
    /// Set by [Driver::close] and [Driver::shutdown]. Terminal.
    is_shutdown: bool,
    /// Bumped on every reconnect so stale reader threads exit
    generation: u64,
    mode: InputMode,
    battery: BatteryConnection,
    buttons: ButtonState,
    /// [left, right][x, y]
    raw_sticks: [[u16; 2]; 2],
    calibration: [StickCalibration; 2],
    have_gyro: bool,
    gyro: [GyroFrame; 3],
    colors: Option<Colors>,
    /// Bluetooth address from the device info reply
    mac: Option<[u8; 6]>,
    rumble: RumbleScheduler,
    packet_timer: u8,
    subcommands: VecDeque<Vec<u8>>,
    spi_reads: Vec<SpiRequest>,
}

/// Protocol engine for one physical unit. Decodes input reports on a
/// dedicated reader thread and writes at most one output report per frame.
pub struct Driver {
    serial: String,
    side: Side,
    state: Mutex<DriverState>,
    notifier: mpsc::Sender<Notification>,
    dropped_notifications: AtomicU64,
    this: Weak<Driver>,
}

impl Driver {
    pub fn new(
        serial: String,
        side: Side,
        handle: Arc<dyn HidHandle>,
        notifier: mpsc::Sender<Notification>,
    ) -> Arc<Self> {
        let state = DriverState {
            handle: Some(handle),
            is_alive: true,
            is_shutdown: false,
            generation: 0,
            mode: InputMode::LazyButtons,
            battery: BatteryConnection::default(),
            buttons: ButtonState::EMPTY,
            raw_sticks: [[0x800; 2]; 2],
            calibration: [StickCalibration::FALLBACK; 2],
            have_gyro: false,
            gyro: Default::default(),
            colors: None,
            mac: None,
            rumble: RumbleScheduler::default(),
            packet_timer: 0,
            subcommands: VecDeque::new(),
            spi_reads: Vec::new(),
        };

        Arc::new_cyclic(|this| Self {
            serial,
            side,
            state: Mutex::new(state),
            notifier,
            dropped_notifications: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the reader thread for the current connection
    pub fn start(&self) {
        let generation = self.state().generation;
        self.spawn_reader(generation);
    }

    /// Reads stick calibration and colors in the background. The results are
    /// applied by the SPI reply handler.
    pub fn spawn_calibration_load(&self) {
        let Some(driver) = self.this.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("{}: no async runtime to load calibration", self.serial);
            return;
        };
        runtime.spawn(async move {
            tokio::time::sleep(CALIBRATION_DELAY).await;
            let regions = [
                (FACTORY_CALIBRATION_ADDR, FACTORY_CALIBRATION_LEN),
                (USER_CALIBRATION_ADDR, USER_CALIBRATION_LEN),
            ];
            for (address, length) in regions {
                if let Err(e) = driver.spi_read(address, length as usize).await {
                    log::warn!(
                        "{}: failed to read calibration at {address:#x}: {e}",
                        driver.serial
                    );
                }
            }
        });
    }

    fn spawn_reader(&self, generation: u64) {
        let weak = self.this.clone();
        let result = thread::Builder::new()
            .name(format!("joycon-{}", self.serial))
            .spawn(move || Driver::read_loop(weak, generation));
        if let Err(e) = result {
            log::error!("{}: failed to spawn reader thread: {e}", self.serial);
        }
    }

    /// Blocking read loop. Exits once the driver is dropped, shut down or
    /// reconnected with a newer handle.
    fn read_loop(weak: Weak<Driver>, generation: u64) {
        let mut buf = [0u8; PACKET_SIZE];
        loop {
            let Some(driver) = weak.upgrade() else {
                return;
            };
            let handle = {
                let state = driver.state();
                if state.is_shutdown || state.generation != generation {
                    log::debug!("{}: reader {generation} stopping", driver.serial);
                    return;
                }
                state.handle.clone()
            };
            let Some(handle) = handle else {
                drop(driver);
                thread::sleep(IDLE_SLEEP);
                continue;
            };

            let bytes_read = match handle.read_timeout(&mut buf, READ_TIMEOUT_MS) {
                Ok(n) => n,
                Err(e) => {
                    driver.on_transport_error(e);
                    return;
                }
            };
            if bytes_read == 0 {
                continue;
            }
            driver.handle_packet(&buf[..bytes_read]);
        }
    }

    /// Decodes a single input report
    pub fn handle_packet(&self, packet: &[u8]) {
        let Some(report_id) = packet.first().copied() else {
            return;
        };
        let report_type = match ReportType::try_from(report_id) {
            Ok(report_type) => report_type,
            Err(_) => {
                log::debug!(
                    "{}: unknown input report {report_id:#04x}: {:02x?}",
                    self.serial,
                    &packet[1..]
                );
                return;
            }
        };
        log::trace!("{}: received report: {report_type:?}", self.serial);

        match report_type {
            ReportType::CommandInputReport
            | ReportType::McuInputReport
            | ReportType::AttachmentInputReport
            | ReportType::_Unused1 => {
                let Some(flags) = self.fill_input(packet) else {
                    return;
                };
                self.handle_subcommand_reply(packet);
                self.notify(flags);
            }
            ReportType::BasicInputReport => {
                let Some(flags) = self.fill_input(packet) else {
                    return;
                };
                self.fill_gyro(packet);
                self.notify(flags);
            }
            ReportType::GenericInputReport => {
                let mut state = self.state();
                if state.mode == InputMode::LazyButtons {
                    state.subcommands.push_back(vec![SubcommandId::Empty as u8]);
                }
            }
            _ => {
                log::debug!(
                    "{}: unexpected report {report_type:?}: {:02x?}",
                    self.serial,
                    packet
                );
            }
        }
    }

    /// Updates battery, buttons and sticks from the standard report header.
    /// Returns the flags to notify with, or None if the report is malformed.
    fn fill_input(&self, packet: &[u8]) -> Option<NotifyFlags> {
        let header = match packet.get(..INPUT_HEADER_SIZE) {
            Some(bytes) => PackedInputReport::unpack_from_slice(bytes),
            None => {
                log::debug!("{}: short input report: {packet:02x?}", self.serial);
                return None;
            }
        };
        let header = match header {
            Ok(header) => header,
            Err(e) => {
                log::debug!("{}: failed to unpack input report: {e}", self.serial);
                return None;
            }
        };

        let mut flags = NotifyFlags::INPUT;
        let mut state = self.state();
        let battery = header.info;
        if battery.level() != state.battery.level() || battery.charging != state.battery.charging
        {
            flags |= NotifyFlags::BATTERY;
        }
        state.battery = battery;
        state.buttons = ButtonState(header.buttons);
        if self.side.is_left() {
            let (x, y) = decode_u12(&header.left_stick);
            state.raw_sticks[0] = [x, y];
        }
        if self.side.is_right() {
            let (x, y) = decode_u12(&header.right_stick);
            state.raw_sticks[1] = [x, y];
        }

        Some(flags)
    }

    fn fill_gyro(&self, packet: &[u8]) {
        let mut state = self.state();
        if !state.have_gyro {
            return;
        }
        let Some(frames) = parse_imu_frames(packet) else {
            log::debug!("{}: short IMU report", self.serial);
            return;
        };
        state.gyro = frames;
        log::trace!("{}: gyro {:?}", self.serial, frames);
    }

    fn handle_subcommand_reply(&self, packet: &[u8]) {
        let Some(reply_id) = subcommand_reply_id(packet) else {
            return;
        };

        match reply_id {
            id if id == SubcommandId::DeviceInfo as u8 => {
                let info = packet
                    .get(REPLY_DATA_OFFSET..REPLY_DATA_OFFSET + 12)
                    .and_then(|bytes| DeviceInfoReply::unpack_from_slice(bytes).ok());
                match info {
                    Some(info) => {
                        log::info!(
                            "{}: firmware {}.{}, type {}, MAC {}, colors {}",
                            self.serial,
                            info.firmware_major,
                            info.firmware_minor,
                            info.device_type,
                            info.mac_string(),
                            info.spi_colors
                        );
                        self.state().mac = Some(info.mac);
                    }
                    None => log::debug!("{}: malformed device info reply", self.serial),
                }
            }
            id if id == SubcommandId::SpiRead as u8 => self.handle_spi_reply(packet),
            id => {
                log::debug!(
                    "{}: ignoring reply to subcommand {id:#04x}: {:02x?}",
                    self.serial,
                    packet.get(REPLY_DATA_OFFSET..).unwrap_or_default()
                );
            }
        }
    }

    fn handle_spi_reply(&self, packet: &[u8]) {
        let Some((header, data)) = parse_spi_reply(packet) else {
            log::debug!("{}: malformed SPI reply: {packet:02x?}", self.serial);
            return;
        };
        let (address, length) = (header.address, header.length);
        log::debug!(
            "{}: SPI read returned [{address:#x}+{length}]: {data:02x?}",
            self.serial
        );

        if address == FACTORY_CALIBRATION_ADDR && length == FACTORY_CALIBRATION_LEN {
            if let Some(factory) = FactoryCalibration::parse(data) {
                let mut state = self.state();
                state.calibration = factory.sticks;
                state.colors = Some(factory.colors);
                log::info!(
                    "{}: got factory calibration, body {} buttons {}",
                    self.serial,
                    factory.colors.body,
                    factory.colors.buttons
                );
            }
        } else if address == USER_CALIBRATION_ADDR && length == USER_CALIBRATION_LEN {
            let user = parse_user_calibration(data);
            let mut state = self.state();
            for (slot, calibration) in user.into_iter().enumerate() {
                if let Some(calibration) = calibration {
                    log::info!("{}: using user stick calibration {calibration}", self.serial);
                    state.calibration[slot] = calibration;
                }
            }
        }

        let mut state = self.state();
        let pending = std::mem::take(&mut state.spi_reads);
        for request in pending {
            if request.address == address && request.length == length {
                // The waiter may have timed out already
                let _ = request.tx.send(data.to_vec());
            } else if !request.tx.is_closed() {
                state.spi_reads.push(request);
            }
        }
    }

    fn notify(&self, flags: NotifyFlags) {
        let Some(driver) = self.this.upgrade() else {
            return;
        };
        match self.notifier.try_send(Notification { driver, flags }) {
            Ok(_) => (),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped_notifications.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "{}: notification channel full, dropped {dropped} notification(s)",
                    self.serial
                );
            }
            Err(TrySendError::Closed(_)) => {
                log::trace!("{}: notification receiver closed", self.serial);
            }
        }
    }

    fn on_transport_error(&self, err: TransportError) {
        {
            let mut state = self.state();
            if state.is_shutdown {
                return;
            }
            state.is_alive = false;
            if let Some(handle) = state.handle.take() {
                handle.close();
            }
        }
        log::error!("{}: communication error: {err}", self.serial);
        self.notify(NotifyFlags::CONNECTION);
    }

    /// Sends the next rumble frame and queued subcommand, if there is anything
    /// to send. Called once per output frame.
    pub fn on_frame(&self) {
        let (handle, timer, rumble, subcommand) = {
            let mut state = self.state();
            if !state.is_alive || state.is_shutdown {
                return;
            }
            let Some(handle) = state.handle.clone() else {
                return;
            };
            let frame = state.rumble.next_frame();
            let subcommand = state.subcommands.pop_front();
            if !state.mode.needs_empty_rumbles() && !frame.changed && subcommand.is_none() {
                return;
            }
            let timer = state.packet_timer;
            state.packet_timer = (state.packet_timer + 1) & 0xF;
            (handle, timer, frame.data, subcommand)
        };

        let report = match output_report(timer, rumble, subcommand.as_deref()) {
            Ok(report) => report,
            Err(e) => {
                log::error!("{}: failed to pack output report: {e}", self.serial);
                return;
            }
        };
        if let Err(e) = handle.write(&report) {
            self.on_transport_error(e);
        }
    }

    fn queue_subcommand(&self, subcommand: Vec<u8>) {
        self.state().subcommands.push_back(subcommand);
    }

    /// Identity key of this unit
    pub fn serial(&self) -> &str {
        self.serial.as_str()
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn buttons(&self) -> ButtonState {
        self.state().buttons
    }

    /// Raw 12-bit stick values, [left, right][x, y]
    pub fn raw_sticks(&self) -> [[u16; 2]; 2] {
        self.state().raw_sticks
    }

    /// Battery level (0=empty to 4=full) and charging state
    pub fn battery(&self) -> (u8, bool) {
        let state = self.state();
        (state.battery.level(), state.battery.charging)
    }

    /// Body and button colors, once calibration has been read
    pub fn colors(&self) -> Option<Colors> {
        self.state().colors
    }

    /// Bluetooth address, once the device info reply has arrived
    pub fn mac(&self) -> Option<[u8; 6]> {
        self.state().mac
    }

    pub fn input_mode(&self) -> InputMode {
        self.state().mode
    }

    pub fn is_alive(&self) -> bool {
        self.state().is_alive
    }

    /// True if a communication error occurred and the driver has not been
    /// closed or shut down since
    pub fn wants_reconnect(&self) -> bool {
        let state = self.state();
        !state.is_alive && !state.is_shutdown
    }

    /// True once [Driver::close] or [Driver::shutdown] has been called
    pub fn is_stopping(&self) -> bool {
        self.state().is_shutdown
    }

    pub fn dropped_notifications(&self) -> u64 {
        self.dropped_notifications.load(Ordering::Relaxed)
    }

    /// Number of subcommands waiting to be sent
    pub fn pending_subcommands(&self) -> usize {
        self.state().subcommands.len()
    }

    /// Queues a switch to the given input mode. Returns false if the driver
    /// is already in that mode.
    pub fn change_input_mode(&self, mode: InputMode) -> bool {
        let mut state = self.state();
        if state.mode == mode {
            return false;
        }
        state
            .subcommands
            .push_back(vec![SubcommandId::SetInputMode as u8, mode.report_byte()]);
        state.mode = mode;
        true
    }

    pub fn enable_gyro(&self, enabled: bool) {
        let mut state = self.state();
        state.have_gyro = enabled;
        state
            .subcommands
            .push_back(vec![SubcommandId::EnableImu as u8, enabled as u8]);
    }

    pub fn rumble(&self, patterns: &[RumbleData]) {
        self.state().rumble.push(patterns);
    }

    /// Asks for firmware version, device type and Bluetooth address
    pub fn request_device_info(&self) {
        self.queue_subcommand(vec![SubcommandId::DeviceInfo as u8]);
    }

    pub fn send_custom_subcommand(&self, subcommand: &[u8]) {
        self.queue_subcommand(subcommand.to_vec());
    }

    pub fn set_player_lights(&self, pattern: u8) {
        self.queue_subcommand(vec![SubcommandId::SetPlayerLights as u8, pattern]);
    }

    pub fn set_home_light(&self, pulse: &[u8]) {
        let mut subcommand = vec![SubcommandId::SetHomeLight as u8];
        subcommand.extend_from_slice(pulse);
        self.queue_subcommand(subcommand);
    }

    /// Merges this unit's buttons, calibrated sticks and (optionally) gyro
    /// into the given state without touching bits owned by the other half
    pub fn read_into(&self, out: &mut CombinedState, include_gyro: bool) {
        let state = self.state();
        out.buttons = out.buttons.remove(self.side).union(state.buttons);
        if self.side.is_left() {
            out.sticks[0] = state.calibration[0].adjust(state.raw_sticks[0]);
        }
        if self.side.is_right() {
            out.sticks[1] = state.calibration[1].adjust(state.raw_sticks[1]);
        }
        if include_gyro {
            out.gyro = if state.have_gyro {
                state.gyro
            } else {
                Default::default()
            };
        }
    }

    /// Reads `length` bytes of SPI flash. Reads larger than a single command
    /// are split into chunks read by a small pool of workers.
    pub async fn spi_read(&self, address: u32, length: usize) -> Result<Vec<u8>, DriverError> {
        check_flash_range(address, length)?;
        if length <= SPI_MAX_DATA {
            return self.spi_read_single(address, length as u8).await;
        }

        let chunks: VecDeque<(usize, u8)> = (0..length)
            .step_by(SPI_MAX_DATA)
            .map(|offset| (offset, SPI_MAX_DATA.min(length - offset) as u8))
            .collect();
        let queue = Mutex::new(chunks);
        let buffer = Mutex::new(vec![0u8; length]);

        let workers = (0..SPI_READ_WORKERS).map(|_| self.spi_read_worker(address, &queue, &buffer));
        futures::future::try_join_all(workers).await?;

        Ok(buffer.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    async fn spi_read_worker(
        &self,
        base: u32,
        queue: &Mutex<VecDeque<(usize, u8)>>,
        buffer: &Mutex<Vec<u8>>,
    ) -> Result<(), DriverError> {
        loop {
            let next = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some((offset, length)) = next else {
                return Ok(());
            };

            let address = base + offset as u32;
            let mut attempt = 0;
            let data = loop {
                let result = self
                    .spi_read_single(address, length)
                    .await
                    .and_then(|data| {
                        if data.len() < length as usize {
                            Err(DriverError::MalformedReply(format!(
                                "expected {length} bytes at {address:#x}, got {}",
                                data.len()
                            )))
                        } else {
                            Ok(data)
                        }
                    });
                match result {
                    Ok(data) => break data,
                    Err(e) if e.is_retryable() && attempt < SPI_READ_RETRIES => {
                        attempt += 1;
                        log::debug!(
                            "{}: retrying SPI read at {address:#x} ({attempt}): {e}",
                            self.serial
                        );
                    }
                    Err(e) => return Err(e),
                }
            };

            let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
            let end = offset + length as usize;
            buffer[offset..end].copy_from_slice(&data[..length as usize]);
        }
    }

    async fn spi_read_single(&self, address: u32, length: u8) -> Result<Vec<u8>, DriverError> {
        let (tx, mut rx) = oneshot::channel();
        {
            let mut state = self.state();
            if state.is_shutdown {
                return Err(DriverError::Stopped);
            }
            if !state.is_alive {
                return Err(DriverError::NotConnected);
            }
            let mut subcommand = vec![SubcommandId::SpiRead as u8];
            subcommand.extend_from_slice(&address.to_le_bytes());
            subcommand.push(length);
            state.subcommands.push_back(subcommand);
            state.spi_reads.push(SpiRequest {
                address,
                length,
                tx,
            });
        }

        match rx.recv_timeout(SPI_TIMEOUT).await {
            Ok(data) => Ok(data),
            Err(ReceiveTimeoutError::Timeout) => Err(DriverError::Timeout { address, length }),
            Err(ReceiveTimeoutError::Closed) if self.is_stopping() => Err(DriverError::Stopped),
            Err(ReceiveTimeoutError::Closed) => Err(DriverError::ChannelClosed),
        }
    }

    /// Queues an SPI flash write. Payloads larger than a single command are
    /// rejected.
    pub fn spi_write(&self, address: u32, data: &[u8]) -> Result<(), DriverError> {
        check_flash_range(address, data.len())?;
        if data.len() > SPI_MAX_DATA {
            return Err(DriverError::TooLarge {
                len: data.len(),
                max: SPI_MAX_DATA,
            });
        }
        let mut subcommand = vec![SubcommandId::SpiWrite as u8];
        subcommand.extend_from_slice(&address.to_le_bytes());
        subcommand.push(data.len() as u8);
        subcommand.extend_from_slice(data);
        self.queue_subcommand(subcommand);
        Ok(())
    }

    /// Revives a disconnected driver with a freshly opened handle. Ignored
    /// once the driver has been closed or shut down.
    pub fn reconnect(&self, handle: Arc<dyn HidHandle>) {
        let generation = {
            let mut state = self.state();
            if state.is_shutdown {
                handle.close();
                return;
            }
            if let Some(old) = state.handle.replace(handle) {
                old.close();
            }
            state.is_alive = true;
            state.generation += 1;
            state.generation
        };
        log::info!("{}: reconnected", self.serial);
        self.spawn_reader(generation);
        self.notify(NotifyFlags::CONNECTION);
    }

    /// Asks the unit to disconnect, then closes it for good
    pub fn shutdown(&self) {
        {
            let mut state = self.state();
            if let Some(handle) = state.handle.take() {
                if let Err(e) = handle.write(&shutdown_report()) {
                    log::debug!("{}: failed to send disconnect: {e}", self.serial);
                }
                handle.close();
            }
            state.is_shutdown = true;
            state.is_alive = false;
            // Wakes every SPI waiter
            state.spi_reads.clear();
        }
        self.notify(NotifyFlags::CONNECTION);
    }

    /// Closes the handle without asking the unit to disconnect
    pub fn close(&self) {
        {
            let mut state = self.state();
            if let Some(handle) = state.handle.take() {
                handle.close();
            }
            state.is_shutdown = true;
            state.is_alive = false;
            // Wakes every SPI waiter
            state.spi_reads.clear();
        }
        self.notify(NotifyFlags::CONNECTION);
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("serial", &self.serial)
            .field("side", &self.side)
            .finish()
    }
}
