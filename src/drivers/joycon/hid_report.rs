//! Sources:
//! - https://github.com/dekuNukem/Nintendo_Switch_Reverse_Engineering/blob/master/bluetooth_hid_notes.md
//! - https://github.com/dekuNukem/Nintendo_Switch_Reverse_Engineering/blob/master/bluetooth_hid_subcommands_notes.md
//! - https://github.com/torvalds/linux/blob/master/drivers/hid/hid-nintendo.c
use packed_struct::prelude::*;

/// Size of every output report sent to the device
pub const OUTPUT_REPORT_SIZE: usize = 0x40;
/// Size of the disconnect report
pub const SHUTDOWN_REPORT_SIZE: usize = 0x32;
/// Size of the standard input report header shared by 0x21 and 0x30-0x33
pub const INPUT_HEADER_SIZE: usize = 13;
/// Offset of the subcommand ACK byte in 0x21 reports (and of the payload in
/// 0x31-0x33 reports)
pub const REPLY_OFFSET: usize = 13;
/// Offset of the three IMU frames in 0x30 reports
pub const IMU_OFFSET: usize = 13;
/// Offset of subcommand reply data in 0x21 reports
pub const REPLY_DATA_OFFSET: usize = 15;
/// Maximum payload of a single SPI flash read or write
pub const SPI_MAX_DATA: usize = 0x1B;
/// Size of the SPI flash address space
pub const SPI_FLASH_SIZE: u32 = 0x80000;

const OUTPUT_HEADER_SIZE: usize = 10;

#[derive(PrimitiveEnum_u8, Clone, Copy, PartialEq, Debug)]
pub enum ReportType {
    CommandOutputReport = 0x01,
    RumbleOutputReport = 0x10,
    CommandInputReport = 0x21,
    BasicInputReport = 0x30,
    McuInputReport = 0x31,
    AttachmentInputReport = 0x32,
    _Unused1 = 0x33,
    GenericInputReport = 0x3F,
}

impl TryFrom<u8> for ReportType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::CommandOutputReport),
            0x10 => Ok(Self::RumbleOutputReport),
            0x21 => Ok(Self::CommandInputReport),
            0x30 => Ok(Self::BasicInputReport),
            0x31 => Ok(Self::McuInputReport),
            0x32 => Ok(Self::AttachmentInputReport),
            0x33 => Ok(Self::_Unused1),
            0x3F => Ok(Self::GenericInputReport),
            _ => Err("Invalid report type"),
        }
    }
}

/// Subcommand identifiers sent in byte 10 of a command output report
#[derive(PrimitiveEnum_u8, Clone, Copy, PartialEq, Debug)]
pub enum SubcommandId {
    Empty = 0x00,
    DeviceInfo = 0x02,
    SetInputMode = 0x03,
    Shutdown = 0x06,
    SpiRead = 0x10,
    SpiWrite = 0x11,
    SetPlayerLights = 0x30,
    SetHomeLight = 0x38,
    EnableImu = 0x40,
}

#[derive(PackedStruct, Debug, Copy, Clone, PartialEq, Default)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "1")]
pub struct BatteryConnection {
    /// Battery level. 4=full, 3=medium, 2=low, 1=critical, 0=empty.
    #[packed_field(bits = "0..=2")]
    pub battery_level: Integer<u8, packed_bits::Bits<3>>,
    #[packed_field(bits = "3")]
    pub charging: bool,
    /// Connection info. (con_info >> 1) & 3 - 3=JC, 0=Pro/ChrGrip. con_info & 1 - 1=Switch/USB powered.
    #[packed_field(bits = "4..=7")]
    pub conn_info: Integer<u8, packed_bits::Bits<4>>,
}

impl BatteryConnection {
    pub fn level(&self) -> u8 {
        self.battery_level.to_primitive()
    }
}

/// Header common to all standard input reports
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq, Default)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "13")]
pub struct PackedInputReport {
    /// Input report ID
    #[packed_field(bytes = "0")]
    pub id: u8,
    /// Timer. Increments very fast. Can be used to estimate excess Bluetooth latency.
    #[packed_field(bytes = "1")]
    pub timer: u8,
    /// Battery and connection information
    #[packed_field(bytes = "2")]
    pub info: BatteryConnection,
    /// Button status, see [super::buttons::ButtonState]
    #[packed_field(bytes = "3..=5")]
    pub buttons: [u8; 3],
    /// Left analog stick, two packed 12-bit values
    #[packed_field(bytes = "6..=8")]
    pub left_stick: [u8; 3],
    /// Right analog stick, two packed 12-bit values
    #[packed_field(bytes = "9..=11")]
    pub right_stick: [u8; 3],
    /// Vibrator input report. Decides if next vibration pattern should be sent.
    #[packed_field(bytes = "12")]
    pub vibrator_report: u8,
}

/// The 6-Axis data is repeated 3 times. On Joy-con with a 15ms packet push,
/// this is translated to 5ms difference sampling. E.g. 1st sample 0ms, 2nd 5ms,
/// 3rd 10ms. Using all 3 samples let you have a 5ms precision instead of 15ms.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq, Default)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct ImuData {
    #[packed_field(bytes = "0..=1", endian = "lsb")]
    pub accel_x: Integer<i16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub accel_y: Integer<i16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub accel_z: Integer<i16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "6..=7", endian = "lsb")]
    pub gyro_x: Integer<i16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "8..=9", endian = "lsb")]
    pub gyro_y: Integer<i16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "10..=11", endian = "lsb")]
    pub gyro_z: Integer<i16, packed_bits::Bits<16>>,
}

/// One IMU sample in report order: accel x/y/z then gyro x/y/z
pub type GyroFrame = [i16; 6];

impl From<ImuData> for GyroFrame {
    fn from(value: ImuData) -> Self {
        [
            value.accel_x.to_primitive(),
            value.accel_y.to_primitive(),
            value.accel_z.to_primitive(),
            value.gyro_x.to_primitive(),
            value.gyro_y.to_primitive(),
            value.gyro_z.to_primitive(),
        ]
    }
}

/// Header of an SPI flash read reply, found at [REPLY_DATA_OFFSET]
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq, Default)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "5")]
pub struct SpiReplyHeader {
    #[packed_field(bytes = "0..=3", endian = "lsb")]
    pub address: u32,
    #[packed_field(bytes = "4")]
    pub length: u8,
}

/// Reply to the device info subcommand, found at [REPLY_DATA_OFFSET]
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq, Default)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct DeviceInfoReply {
    #[packed_field(bytes = "0")]
    pub firmware_major: u8,
    #[packed_field(bytes = "1")]
    pub firmware_minor: u8,
    /// 1=Left Joy-Con, 2=Right Joy-Con, 3=Pro Controller
    #[packed_field(bytes = "2")]
    pub device_type: u8,
    #[packed_field(bytes = "3")]
    pub _unknown1: u8,
    /// MAC address, big endian
    #[packed_field(bytes = "4..=9")]
    pub mac: [u8; 6],
    #[packed_field(bytes = "10")]
    pub _unknown2: u8,
    /// 1 if colors in SPI flash are used
    #[packed_field(bytes = "11")]
    pub spi_colors: u8,
}

impl DeviceInfoReply {
    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<String>>()
            .join(":")
    }
}

/// Header of every output report: report id, packet timer and rumble data
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq, Default)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "10")]
pub struct PackedOutputReportHeader {
    #[packed_field(bytes = "0")]
    pub id: u8,
    /// Global packet number, 0x0-0xF
    #[packed_field(bytes = "1")]
    pub timer: u8,
    /// Left and right rumble data
    #[packed_field(bytes = "2..=9")]
    pub rumble: [u8; 8],
}

/// Builds a command output report carrying the given rumble data and an
/// optional subcommand. Subcommand bytes that do not fit are dropped.
pub fn output_report(
    timer: u8,
    rumble: [u8; 8],
    subcommand: Option<&[u8]>,
) -> Result<[u8; OUTPUT_REPORT_SIZE], PackingError> {
    let header = PackedOutputReportHeader {
        id: ReportType::CommandOutputReport as u8,
        timer,
        rumble,
    };
    let mut report = [0u8; OUTPUT_REPORT_SIZE];
    report[..OUTPUT_HEADER_SIZE].copy_from_slice(&header.pack()?);
    if let Some(subcommand) = subcommand {
        let len = subcommand.len().min(OUTPUT_REPORT_SIZE - OUTPUT_HEADER_SIZE);
        report[OUTPUT_HEADER_SIZE..OUTPUT_HEADER_SIZE + len].copy_from_slice(&subcommand[..len]);
    }
    Ok(report)
}

/// Report asking the unit to disconnect and power down its radio
pub fn shutdown_report() -> [u8; SHUTDOWN_REPORT_SIZE] {
    let mut report = [0u8; SHUTDOWN_REPORT_SIZE];
    report[0] = ReportType::CommandOutputReport as u8;
    report[OUTPUT_HEADER_SIZE] = SubcommandId::Shutdown as u8;
    report
}

/// Returns the id of the subcommand a report replies to, if any.
/// 0x21 reports carry an ACK byte with the high bit set; 0x31-0x33 carry the
/// id directly.
pub fn subcommand_reply_id(report: &[u8]) -> Option<u8> {
    let id = *report.first()?;
    let byte = *report.get(REPLY_OFFSET)?;
    let reply = if id == ReportType::CommandInputReport as u8 {
        if byte < 0x80 {
            return None;
        }
        byte - 0x80
    } else {
        byte
    };
    (reply != 0).then_some(reply)
}

/// Splits an SPI read reply into its header and (at most `length` bytes of) data
pub fn parse_spi_reply(report: &[u8]) -> Option<(SpiReplyHeader, &[u8])> {
    let start = REPLY_DATA_OFFSET;
    let header_bytes = report.get(start..start + 5)?;
    let header = SpiReplyHeader::unpack_from_slice(header_bytes).ok()?;
    let data = report.get(start + 5..)?;
    let data = if data.len() >= header.length as usize {
        &data[..header.length as usize]
    } else {
        data
    };
    Some((header, data))
}

/// Decodes the three IMU frames of a 0x30 report
pub fn parse_imu_frames(report: &[u8]) -> Option<[GyroFrame; 3]> {
    let mut frames = [GyroFrame::default(); 3];
    for (i, frame) in frames.iter_mut().enumerate() {
        let start = IMU_OFFSET + i * 12;
        let bytes = report.get(start..start + 12)?;
        *frame = ImuData::unpack_from_slice(bytes).ok()?.into();
    }
    Some(frames)
}
