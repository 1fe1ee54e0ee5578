//! Line based console for inspecting and poking connected units.
//!
//! Units are addressed with selectors: `u<N>` picks the Nth unpaired unit,
//! `c<N>` the Nth paired controller and `c<N>l`/`c<N>r` one half of a dual
//! controller.
use std::{fmt::Write, sync::Arc};

use tabled::{
    settings::{Panel, Style},
    Table, Tabled,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::{
    bluetooth::BluetoothError,
    drivers::joycon::driver::{Driver, DriverError, InputMode, Side},
    input::manager::{render_battery, Manager, Snapshot},
};

/// Possible errors when resolving a unit selector
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectError {
    #[error("Unpaired JoyCon number {0} out of range (have {1})")]
    UnpairedOutOfRange(String, usize),
    #[error("Controller number {0} out of range (have {1})")]
    ControllerOutOfRange(String, usize),
    #[error("Controller number {0} is a dual, please specify l/r suffix")]
    NeedsSide(String),
    #[error("Not a valid JoyCon selector: '{0}'")]
    Invalid(String),
    #[error("No JoyCon selected")]
    Missing,
}

/// Possible errors from a console command
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("unknown command {0}, try 'help'")]
    Unknown(String),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error("{0}")]
    Usage(&'static str),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("wrong number of data bytes")]
    WrongDataLength,
    #[error("SPI read {address:06x} {size} error: {source}")]
    SpiRead {
        address: u32,
        size: usize,
        source: DriverError,
    },
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
}

/// What the console loop should do after a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Print the text (if any) and read the next line
    Continue(String),
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Help,
    List,
    Sync,
    SyncOff,
    ResetSync,
    Disconnect,
    DisconnectAll,
    SetPlayerLights,
    SetHomeLights,
    Imu,
    Mode,
    Read,
    Write,
    Send,
    Exit,
}

impl Command {
    const ALL: [Command; 15] = [
        Command::Help,
        Command::List,
        Command::Sync,
        Command::SyncOff,
        Command::ResetSync,
        Command::Disconnect,
        Command::DisconnectAll,
        Command::SetPlayerLights,
        Command::SetHomeLights,
        Command::Imu,
        Command::Mode,
        Command::Read,
        Command::Write,
        Command::Send,
        Command::Exit,
    ];

    /// Names the command answers to. The first one is shown in the help.
    fn names(&self) -> &'static [&'static str] {
        match self {
            Command::Help => &["help", "?", "hlep"],
            Command::List => &["list", "ls"],
            Command::Sync => &["sync"],
            Command::SyncOff => &["syncoff"],
            Command::ResetSync => &["resetsync"],
            Command::Disconnect => &["disconnect"],
            Command::DisconnectAll => &["disconnectall"],
            Command::SetPlayerLights => &["setPlayerLights"],
            Command::SetHomeLights => &["setHomeLights"],
            Command::Imu => &["imu"],
            Command::Mode => &["mode"],
            Command::Read => &["read"],
            Command::Write => &["write"],
            Command::Send => &["send"],
            Command::Exit => &["exit", "quit"],
        }
    }

    fn help(&self) -> &'static str {
        match self {
            Command::Help => "Display this help text.",
            Command::List => "Show the names of all Joy-Cons connected to the system.",
            Command::Sync => "Connect a new Joy-Con (turn on bluetooth discovery).",
            Command::SyncOff => "Done connecting a new Joy-Con (turn off bluetooth discovery).",
            Command::ResetSync => "Reset Joy-Con pairing info.",
            Command::Disconnect => "Disconnect the specified JoyCon.",
            Command::DisconnectAll => "Disconnect all JoyCons.",
            Command::SetPlayerLights => "Set the player lights on the JoyCon.",
            Command::SetHomeLights => "Set the home light pattern.",
            Command::Imu => "Enable/disable IMU.",
            Command::Mode => "Change the input report mode (standard, lazy, polling).",
            Command::Read => "Read from SPI flash.",
            Command::Write => "Write to SPI flash.",
            Command::Send => "Send a subcommand packet.",
            Command::Exit => "Disconnect everything and quit.",
        }
    }

    fn find(name: &str) -> Option<Command> {
        Command::ALL
            .into_iter()
            .find(|command| command.names().contains(&name))
    }
}

#[derive(Tabled)]
struct UnitRow {
    #[tabled(rename = "Id")]
    id: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Serial")]
    serial: String,
    #[tabled(rename = "Battery")]
    battery: String,
}

impl UnitRow {
    fn new(id: String, driver: &Driver) -> Self {
        let (level, charging) = driver.battery();
        Self {
            id,
            kind: driver.side().to_string(),
            serial: driver.serial().to_string(),
            battery: render_battery(level, charging),
        }
    }
}

fn all_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Resolves a selector against the given registry snapshot
pub fn select(snapshot: &Snapshot, selector: &str) -> Result<Arc<Driver>, SelectError> {
    if let Some(number) = selector.strip_prefix('u').filter(|n| all_digits(n)) {
        let out_of_range =
            || SelectError::UnpairedOutOfRange(selector.to_string(), snapshot.unpaired.len());
        let number: usize = number.parse().map_err(|_| out_of_range())?;
        return number
            .checked_sub(1)
            .and_then(|index| snapshot.unpaired.get(index))
            .cloned()
            .ok_or_else(out_of_range);
    }

    if let Some(rest) = selector.strip_prefix('c') {
        let (number, side) = if let Some(number) = rest.strip_suffix('l') {
            (number, Some(Side::Left))
        } else if let Some(number) = rest.strip_suffix('r') {
            (number, Some(Side::Right))
        } else {
            (rest, None)
        };
        if all_digits(number) {
            let out_of_range =
                || SelectError::ControllerOutOfRange(selector.to_string(), snapshot.paired.len());
            let number: usize = number.parse().map_err(|_| out_of_range())?;
            let controller = number
                .checked_sub(1)
                .and_then(|index| snapshot.paired.get(index))
                .ok_or_else(out_of_range)?;
            return match (controller.drivers.as_slice(), side) {
                ([driver], _) => Ok(driver.clone()),
                ([left, _], Some(Side::Left)) => Ok(left.clone()),
                ([_, right], Some(Side::Right)) => Ok(right.clone()),
                _ => Err(SelectError::NeedsSide(selector.to_string())),
            };
        }
    }

    Err(SelectError::Invalid(selector.to_string()))
}

/// Parses an integer with an optional 0x, 0o or 0b prefix. A leading zero
/// means octal.
pub fn parse_number(value: &str) -> Option<u64> {
    let lower = value.to_ascii_lowercase();
    let (digits, radix) = if let Some(hex) = lower.strip_prefix("0x") {
        (hex, 16)
    } else if let Some(octal) = lower.strip_prefix("0o") {
        (octal, 8)
    } else if let Some(binary) = lower.strip_prefix("0b") {
        (binary, 2)
    } else if lower.len() > 1 && lower.starts_with('0') {
        (&lower[1..], 8)
    } else {
        (lower.as_str(), 10)
    };
    if digits.is_empty() || digits.starts_with('+') {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

fn parse_byte(value: &str) -> Result<u8, CommandError> {
    parse_number(value)
        .and_then(|n| u8::try_from(n).ok())
        .ok_or_else(|| CommandError::InvalidNumber(value.to_string()))
}

fn parse_bytes(values: &[&str]) -> Result<Vec<u8>, CommandError> {
    values.iter().map(|value| parse_byte(value)).collect()
}

/// Player light values may also be written as "x8"
fn parse_lights(value: &str) -> Option<u8> {
    match value.strip_prefix('x') {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => parse_number(value).and_then(|n| u8::try_from(n).ok()),
    }
}

/// Formats bytes as offset, hex and printable columns, 16 bytes per line
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(16).enumerate() {
        let mut hex = String::new();
        for i in 0..16 {
            if i == 8 {
                hex.push(' ');
            }
            match chunk.get(i) {
                Some(byte) => {
                    let _ = write!(hex, "{byte:02x} ");
                }
                None => hex.push_str("   "),
            }
        }
        let printable: String = chunk
            .iter()
            .map(|b| {
                if b.is_ascii_graphic() || *b == b' ' {
                    *b as char
                } else {
                    '.'
                }
            })
            .collect();
        let _ = writeln!(out, "{:08x}  {hex} |{printable}|", line * 16);
    }
    out
}

/// Renders every unpaired unit and paired controller as a table
pub fn render_units(snapshot: &Snapshot) -> String {
    let mut rows = Vec::new();
    for (index, driver) in snapshot.unpaired.iter().enumerate() {
        rows.push(UnitRow::new(format!("u{}", index + 1), driver));
    }
    for (index, controller) in snapshot.paired.iter().enumerate() {
        match controller.drivers.as_slice() {
            [left, right] => {
                rows.push(UnitRow::new(format!("c{}l", index + 1), left));
                rows.push(UnitRow::new(format!("c{}r", index + 1), right));
            }
            drivers => {
                for driver in drivers {
                    rows.push(UnitRow::new(format!("c{}", index + 1), driver));
                }
            }
        }
    }
    if rows.is_empty() {
        return "No Joy-Cons connected".to_string();
    }

    let mut table = Table::new(rows);
    table
        .with(Style::modern_rounded())
        .with(Panel::header("Connected Joy-Cons"));
    table.to_string()
}

/// Interactive console on top of a [Manager]
pub struct Console {
    manager: Arc<Manager>,
}

impl Console {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    /// Reads commands from stdin until "exit" or end of input
    pub async fn run(&self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    log::error!("Failed to read from console: {e}");
                    break;
                }
            };
            let argv: Vec<&str> = line.split_whitespace().collect();
            match self.execute(&argv).await {
                Ok(Outcome::Continue(text)) => {
                    if !text.is_empty() {
                        println!("{text}");
                    }
                }
                Ok(Outcome::Exit) => break,
                Err(e) => println!("{e}"),
            }
        }
        log::debug!("Console closed");
    }

    fn select(&self, args: &[&str]) -> Result<Arc<Driver>, SelectError> {
        let selector = args.first().ok_or(SelectError::Missing)?;
        select(&self.manager.snapshot(), selector)
    }

    /// Runs a single command line, already split into words
    pub async fn execute(&self, argv: &[&str]) -> Result<Outcome, CommandError> {
        let Some((name, args)) = argv.split_first() else {
            return Ok(Outcome::Continue(String::new()));
        };
        let command = Command::find(name).ok_or_else(|| CommandError::Unknown(name.to_string()))?;
        let bluetooth = self.manager.bluetooth();

        let text = match command {
            Command::Help => {
                let mut text = String::from("Commands:");
                for command in Command::ALL {
                    let _ = write!(text, "\n  {} - {}", command.names()[0], command.help());
                }
                text
            }
            Command::List => render_units(&self.manager.snapshot()),
            Command::Sync => {
                bluetooth.start_discovery().await?;
                [
                    "Searching for Bluetooth devices.",
                    "Hold the SYNC button on your Joy-Con to connect.",
                    "Remember to use the 'syncoff' command when done.",
                ]
                .join("\n")
            }
            Command::SyncOff => {
                bluetooth.stop_discovery().await?;
                "Stopped Bluetooth search.".to_string()
            }
            Command::ResetSync => {
                bluetooth.delete_pairing_info().await?;
                "Deleted all pairing records, joy-cons must be reconnected.".to_string()
            }
            Command::Disconnect => {
                let driver = self.select(args)?;
                driver.shutdown();
                format!("Disconnected {}", driver.serial())
            }
            Command::DisconnectAll => {
                self.manager.disconnect_all();
                "Disconnected all.".to_string()
            }
            Command::SetPlayerLights => {
                let driver = self.select(args)?;
                let value = args
                    .get(1)
                    .and_then(|value| parse_lights(value))
                    .ok_or(CommandError::Usage(
                        "must specify a value: setPlayerLights [jc] 0x8",
                    ))?;
                driver.set_player_lights(value);
                String::new()
            }
            Command::SetHomeLights => {
                let driver = self.select(args)?;
                if args.len() < 2 {
                    return Err(CommandError::Usage(
                        "must specify a value: setHomeLights [jc] 0x8 0xFF ...",
                    ));
                }
                driver.set_home_light(&parse_bytes(&args[1..])?);
                String::new()
            }
            Command::Imu => {
                let driver = self.select(args)?;
                let value = args
                    .get(1)
                    .ok_or(CommandError::Usage("specify on/off true/false"))?;
                let enable = matches!(*value, "on" | "1" | "true" | "enable");
                driver.enable_gyro(enable);
                format!("IMU {}", if enable { "enabled" } else { "disabled" })
            }
            Command::Mode => {
                let driver = self.select(args)?;
                let mode = match args.get(1).copied() {
                    Some("standard") => InputMode::Standard,
                    Some("lazy") => InputMode::LazyButtons,
                    Some("polling") => InputMode::ActivePolling,
                    _ => {
                        return Err(CommandError::Usage(
                            "specify a mode: mode [jc] standard|lazy|polling",
                        ))
                    }
                };
                if driver.change_input_mode(mode) {
                    format!("Input mode set to {mode:?}")
                } else {
                    format!("Already in {mode:?} mode")
                }
            }
            Command::Read => {
                let driver = self.select(args)?;
                let (Some(start), Some(size)) = (args.get(1), args.get(2)) else {
                    return Err(CommandError::Usage(
                        "please specify the range: read [jc] [start=0x6000] [size=0x0100]",
                    ));
                };
                let address = parse_address(start)?;
                let size = parse_size(size)?;
                match driver.spi_read(address, size).await {
                    Ok(data) => format!("SPI read {address:06x} {size} data:\n{}", hex_dump(&data)),
                    Err(source) => {
                        return Err(CommandError::SpiRead {
                            address,
                            size,
                            source,
                        })
                    }
                }
            }
            Command::Write => {
                let driver = self.select(args)?;
                let (Some(start), Some(size)) = (args.get(1), args.get(2)) else {
                    return Err(CommandError::Usage(
                        "please specify the range: write [jc] [start=0x6000] [size] [bytes...]",
                    ));
                };
                let address = parse_address(start)?;
                let size = parse_size(size)?;
                let data = &args[3..];
                if data.len() != size {
                    return Err(CommandError::WrongDataLength);
                }
                driver.spi_write(address, &parse_bytes(data)?)?;
                format!("SPI write {address:06x} {size} queued")
            }
            Command::Send => {
                let driver = self.select(args)?;
                if args.len() < 2 {
                    return Err(CommandError::Usage(
                        "must specify a value: send [jc] 0x8 0xFF ...",
                    ));
                }
                driver.send_custom_subcommand(&parse_bytes(&args[1..])?);
                String::new()
            }
            Command::Exit => return Ok(Outcome::Exit),
        };
        Ok(Outcome::Continue(text))
    }
}

fn parse_address(value: &str) -> Result<u32, CommandError> {
    parse_number(value)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| CommandError::InvalidNumber(value.to_string()))
}

fn parse_size(value: &str) -> Result<usize, CommandError> {
    parse_number(value)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| CommandError::InvalidNumber(value.to_string()))
}
