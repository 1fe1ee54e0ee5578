use std::{
    ffi::CString,
    sync::{Arc, Mutex, PoisonError},
};

use hidapi::{HidApi, HidDevice, HidError};
use thiserror::Error;

/// Possible errors from the raw HID transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("permission denied opening {0}: install udev rules or run as root")]
    PermissionDenied(String),
    #[error("hid error: {0}")]
    Hid(#[from] HidError),
    #[error("device handle is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::PermissionDenied(_) => true,
            Self::Hid(HidError::IoError { error }) => {
                error.kind() == std::io::ErrorKind::PermissionDenied
            }
            Self::Hid(HidError::HidApiError { message }) => {
                message.contains("Permission denied")
            }
            _ => false,
        }
    }
}

/// Enumeration entry for one HID interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: String,
    pub interface_number: i32,
}

/// An open HID handle. Implementations must be usable from the reader thread
/// and the frame ticker at the same time.
pub trait HidHandle: Send + Sync {
    /// Reads one report, returning 0 if nothing arrived within the timeout
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError>;
    fn write(&self, buf: &[u8]) -> Result<usize, TransportError>;
    fn close(&self);
}

/// Enumerates and opens HID devices
pub trait Transport: Send + Sync {
    fn enumerate(&self, vendor_id: u16) -> Result<Vec<DeviceInfo>, TransportError>;
    fn open(&self, info: &DeviceInfo) -> Result<Arc<dyn HidHandle>, TransportError>;
}

/// [Transport] backed by hidapi
pub struct HidApiTransport {
    api: Mutex<HidApi>,
}

impl HidApiTransport {
    pub fn new() -> Result<Self, TransportError> {
        let api = HidApi::new()?;
        Ok(Self {
            api: Mutex::new(api),
        })
    }
}

impl Transport for HidApiTransport {
    fn enumerate(&self, vendor_id: u16) -> Result<Vec<DeviceInfo>, TransportError> {
        let mut api = self.api.lock().unwrap_or_else(PoisonError::into_inner);
        api.refresh_devices()?;
        let devices = api
            .device_list()
            .filter(|info| info.vendor_id() == vendor_id)
            .map(|info| DeviceInfo {
                path: info.path().to_string_lossy().to_string(),
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                serial: info.serial_number().unwrap_or_default().to_string(),
                interface_number: info.interface_number(),
            })
            .collect();
        Ok(devices)
    }

    fn open(&self, info: &DeviceInfo) -> Result<Arc<dyn HidHandle>, TransportError> {
        let path = CString::new(info.path.clone()).map_err(|e| TransportError::Other(e.to_string()))?;
        let api = self.api.lock().unwrap_or_else(PoisonError::into_inner);
        let device = api.open_path(&path).map_err(|e| {
            let err = TransportError::from(e);
            if err.is_permission_denied() {
                TransportError::PermissionDenied(info.path.clone())
            } else {
                err
            }
        })?;
        Ok(Arc::new(HidApiHandle {
            device: Mutex::new(Some(device)),
        }))
    }
}

/// [HidHandle] wrapping a hidapi device
pub struct HidApiHandle {
    device: Mutex<Option<HidDevice>>,
}

impl HidHandle for HidApiHandle {
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError> {
        let device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(device) = device.as_ref() else {
            return Err(TransportError::Closed);
        };
        Ok(device.read_timeout(buf, timeout_ms)?)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        let device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(device) = device.as_ref() else {
            return Err(TransportError::Closed);
        };
        Ok(device.write(buf)?)
    }

    fn close(&self) {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        device.take();
    }
}
