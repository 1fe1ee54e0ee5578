//! Bluetooth pairing hints.
//!
//! Newly connected controllers show up as HID devices some time after the
//! Bluetooth stack accepts them. The session manager treats every
//! [BluetoothNotification] as a hint to rescan HID devices.
pub mod bluez;
pub mod generic;


use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::BluetoothKind;

use self::{bluez::BluezBluetooth, generic::GenericBluetooth};

/// Capacity of the notification broadcast channel
const NOTIFICATION_CAPACITY: usize = 16;

/// Possible errors from a Bluetooth backend
#[derive(Error, Debug)]
pub enum BluetoothError {
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),
    #[error("D-Bus call failed: {0}")]
    Fdo(#[from] zbus::fdo::Error),
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("no paired device with address {0}")]
    UnknownDevice(String),
}

/// Sent when a device connects or discovery wants the HID devices rescanned.
/// An all-zero address means "rescan", with no particular device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BluetoothNotification {
    pub mac: [u8; 6],
    pub mac_string: String,
    pub connected: bool,
    pub new_device: bool,
}

impl BluetoothNotification {
    pub fn for_device(mac: [u8; 6], connected: bool, new_device: bool) -> Self {
        Self {
            mac,
            mac_string: format_mac(&mac),
            connected,
            new_device,
        }
    }
}

/// Formats an address as upper case, colon separated hex
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<String>>()
        .join(":")
}

/// Parses an address like "98:B6:E9:01:02:03"
pub fn parse_mac(value: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = value.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// Returns true if the Bluetooth name belongs to a supported controller
pub fn is_controller_name(name: &str) -> bool {
    name.starts_with("Joy-Con") || name == "Pro Controller"
}

/// Bluetooth backend selected at startup
#[derive(Debug)]
pub enum Bluetooth {
    /// No Bluetooth integration; discovery commands are ignored
    Disabled(broadcast::Sender<BluetoothNotification>),
    Generic(GenericBluetooth),
    Bluez(BluezBluetooth),
}

impl Bluetooth {
    /// Creates the requested backend. [BluetoothKind::Auto] tries BlueZ and
    /// falls back to the generic backend.
    pub async fn new(kind: BluetoothKind) -> Result<Self, BluetoothError> {
        let (tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        match kind {
            BluetoothKind::Disabled => Ok(Bluetooth::Disabled(tx)),
            BluetoothKind::Generic => Ok(Bluetooth::Generic(GenericBluetooth::new(tx))),
            BluetoothKind::Bluez => Ok(Bluetooth::Bluez(BluezBluetooth::connect(tx).await?)),
            BluetoothKind::Auto => match BluezBluetooth::connect(tx.clone()).await {
                Ok(bluez) => Ok(Bluetooth::Bluez(bluez)),
                Err(e) => {
                    log::info!("BlueZ unavailable ({e}), using generic Bluetooth hints");
                    Ok(Bluetooth::Generic(GenericBluetooth::new(tx)))
                }
            },
        }
    }

    /// Returns a receiver for future notifications
    pub fn subscribe(&self) -> broadcast::Receiver<BluetoothNotification> {
        match self {
            Bluetooth::Disabled(tx) => tx.subscribe(),
            Bluetooth::Generic(bt) => bt.subscribe(),
            Bluetooth::Bluez(bt) => bt.subscribe(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Bluetooth::Disabled(_) => "disabled",
            Bluetooth::Generic(_) => "generic",
            Bluetooth::Bluez(_) => "bluez",
        }
    }

    pub async fn start_discovery(&self) -> Result<(), BluetoothError> {
        match self {
            Bluetooth::Disabled(_) => Ok(()),
            Bluetooth::Generic(bt) => {
                bt.start_discovery();
                Ok(())
            }
            Bluetooth::Bluez(bt) => bt.start_discovery().await,
        }
    }

    pub async fn stop_discovery(&self) -> Result<(), BluetoothError> {
        match self {
            Bluetooth::Disabled(_) => Ok(()),
            Bluetooth::Generic(bt) => {
                bt.stop_discovery();
                Ok(())
            }
            Bluetooth::Bluez(bt) => bt.stop_discovery().await,
        }
    }

    /// Emits notifications for devices that are already connected
    pub async fn initial_scan(&self) -> Result<(), BluetoothError> {
        match self {
            Bluetooth::Disabled(_) => Ok(()),
            Bluetooth::Generic(bt) => {
                bt.initial_scan();
                Ok(())
            }
            Bluetooth::Bluez(bt) => bt.initial_scan().await,
        }
    }

    /// Marks the device as trusted so it reconnects on its own
    pub async fn save_pairing_info(&self, mac: &[u8; 6]) -> Result<(), BluetoothError> {
        match self {
            Bluetooth::Disabled(_) | Bluetooth::Generic(_) => Ok(()),
            Bluetooth::Bluez(bt) => bt.save_pairing_info(mac).await,
        }
    }

    /// Forgets every paired controller
    pub async fn delete_pairing_info(&self) -> Result<(), BluetoothError> {
        match self {
            Bluetooth::Disabled(_) | Bluetooth::Generic(_) => Ok(()),
            Bluetooth::Bluez(bt) => bt.delete_pairing_info().await,
        }
    }
}
