pub mod console;

#[cfg(test)]
mod console_test;

use std::path::PathBuf;

use clap::Parser;

use crate::config::{BluetoothKind, InvertAxis, OutputKind};

/// Combines Joy-Cons and Pro Controllers into virtual gamepads
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Invert a stick axis on the virtual gamepad. May be repeated.
    #[arg(long, value_enum)]
    pub invert: Vec<InvertAxis>,
    /// Number of player slots [default: 4]
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=8))]
    pub max_controllers: Option<u8>,
    /// Where controller input goes [default: uinput]
    #[arg(long, value_enum)]
    pub output: Option<OutputKind>,
    /// Source of Bluetooth connection hints [default: auto]
    #[arg(long, value_enum)]
    pub bluetooth: Option<BluetoothKind>,
    /// Path to a YAML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Run without the interactive console
    #[arg(long)]
    pub no_console: bool,
}
