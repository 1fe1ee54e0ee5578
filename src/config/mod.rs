use std::{io, path::Path};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    cli::Args,
    constants::{MAX_CONTROLLERS, PLAYER_LIGHTS},
    drivers::joycon::buttons::AxisId,
};


/// Represents all possible errors loading [Options]
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Could not read: {0}")]
    IoError(#[from] io::Error),
    #[error("Unable to deserialize: {0}")]
    DeserializeError(#[from] serde_yaml::Error),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Stick axis that can be inverted on the virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
pub enum InvertAxis {
    /// Left stick, vertical
    #[value(name = "LV", alias = "lv")]
    #[serde(rename = "LV", alias = "lv")]
    LeftVertical,
    /// Left stick, horizontal
    #[value(name = "LH", alias = "lh")]
    #[serde(rename = "LH", alias = "lh")]
    LeftHorizontal,
    /// Right stick, vertical
    #[value(name = "RV", alias = "rv")]
    #[serde(rename = "RV", alias = "rv")]
    RightVertical,
    /// Right stick, horizontal
    #[value(name = "RH", alias = "rh")]
    #[serde(rename = "RH", alias = "rh")]
    RightHorizontal,
}

impl From<InvertAxis> for AxisId {
    fn from(value: InvertAxis) -> Self {
        match value {
            InvertAxis::LeftVertical => AxisId::LeftVertical,
            InvertAxis::LeftHorizontal => AxisId::LeftHorizontal,
            InvertAxis::RightVertical => AxisId::RightVertical,
            InvertAxis::RightHorizontal => AxisId::RightHorizontal,
        }
    }
}

/// Kind of virtual device created for each paired controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Virtual evdev gamepad
    #[default]
    Uinput,
    /// Print button presses to the terminal
    Console,
}

/// Source of Bluetooth connection hints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BluetoothKind {
    /// Try BlueZ, fall back to generic
    #[default]
    Auto,
    /// BlueZ over the system bus
    Bluez,
    /// Periodic rescans only
    Generic,
    /// No Bluetooth integration
    #[value(name = "none")]
    #[serde(rename = "none")]
    Disabled,
}

/// Optional YAML configuration file. Every key may be omitted.
#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ConfigFile {
    pub invert: Option<Vec<InvertAxis>>,
    pub max_controllers: Option<usize>,
    pub output: Option<OutputKind>,
    pub bluetooth: Option<BluetoothKind>,
}

impl ConfigFile {
    /// Load a [ConfigFile] from the given YAML string
    pub fn from_yaml(content: &str) -> Result<ConfigFile, LoadError> {
        let config: ConfigFile = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Load a [ConfigFile] from the given YAML file
    pub fn from_yaml_file<P>(path: P) -> Result<ConfigFile, LoadError>
    where
        P: AsRef<Path>,
    {
        let file = std::fs::File::open(path)?;
        let config: ConfigFile = serde_yaml::from_reader(file)?;
        Ok(config)
    }
}

/// Axis remapping handed to every output on creation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemapOptions {
    pub inverted_axes: Vec<AxisId>,
}

/// Runtime options, merged from the command line and the config file
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub remap: RemapOptions,
    pub max_controllers: usize,
    pub output: OutputKind,
    pub bluetooth: BluetoothKind,
    pub console: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            remap: RemapOptions::default(),
            max_controllers: MAX_CONTROLLERS,
            output: OutputKind::default(),
            bluetooth: BluetoothKind::default(),
            console: true,
        }
    }
}

impl Options {
    /// Builds options from parsed arguments, reading the config file they
    /// point to (if any).
    pub fn load(args: &Args) -> Result<Options, LoadError> {
        let file = match args.config.as_ref() {
            Some(path) => {
                log::debug!("Loading config file: {}", path.display());
                ConfigFile::from_yaml_file(path)?
            }
            None => ConfigFile::default(),
        };
        Options::merge(args, file)
    }

    /// Merges the command line over the config file. Command line values win.
    pub fn merge(args: &Args, file: ConfigFile) -> Result<Options, LoadError> {
        let invert = if args.invert.is_empty() {
            file.invert.unwrap_or_default()
        } else {
            args.invert.clone()
        };
        let mut inverted_axes: Vec<AxisId> = Vec::with_capacity(invert.len());
        for axis in invert.into_iter().map(AxisId::from) {
            if !inverted_axes.contains(&axis) {
                inverted_axes.push(axis);
            }
        }

        let max_controllers = args
            .max_controllers
            .map(usize::from)
            .or(file.max_controllers)
            .unwrap_or(MAX_CONTROLLERS);
        let max_slots = PLAYER_LIGHTS.len() - 1;
        if max_controllers == 0 || max_controllers > max_slots {
            return Err(LoadError::InvalidValue(format!(
                "max_controllers must be between 1 and {max_slots}, got {max_controllers}"
            )));
        }

        Ok(Options {
            remap: RemapOptions { inverted_axes },
            max_controllers,
            output: args.output.or(file.output).unwrap_or_default(),
            bluetooth: args.bluetooth.or(file.bluetooth).unwrap_or_default(),
            console: !args.no_console,
        })
    }
}
