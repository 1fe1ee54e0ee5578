//! In-memory transport used by tests
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use super::{
    buttons::ButtonState,
    transport::{DeviceInfo, HidHandle, Transport, TransportError},
};

#[derive(Default)]
pub struct MockHandle {
    written: Mutex<Vec<Vec<u8>>>,
    incoming: Mutex<VecDeque<Vec<u8>>>,
    closed: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MockHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a report to be returned by the next read
    pub fn push_report(&self, report: Vec<u8>) {
        self.incoming.lock().unwrap().push_back(report);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.written.lock().unwrap())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl HidHandle for MockHandle {
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TransportError::Other("read failed".into()));
        }
        let next = self.incoming.lock().unwrap().pop_front();
        let Some(report) = next else {
            thread::sleep(Duration::from_millis(timeout_ms as u64));
            return Ok(0);
        };
        let len = report.len().min(buf.len());
        buf[..len].copy_from_slice(&report[..len]);
        Ok(len)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Other("write failed".into()));
        }
        self.written.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockDevice {
    info: DeviceInfo,
    handle: Arc<MockHandle>,
    deny: bool,
}

/// Transport over a fixed list of mock devices
#[derive(Default)]
pub struct MockTransport {
    devices: Mutex<Vec<MockDevice>>,
    opened: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_device(&self, product_id: u16, serial: &str, interface_number: i32) -> Arc<MockHandle> {
        let handle = MockHandle::new();
        let info = DeviceInfo {
            path: format!("/dev/hidraw-{serial}-{interface_number}"),
            vendor_id: super::driver::VID,
            product_id,
            serial: serial.to_string(),
            interface_number,
        };
        self.devices.lock().unwrap().push(MockDevice {
            info,
            handle: handle.clone(),
            deny: false,
        });
        handle
    }

    /// Makes opening the given serial fail with a permission error
    pub fn deny(&self, serial: &str) {
        for device in self.devices.lock().unwrap().iter_mut() {
            if device.info.serial == serial {
                device.deny = true;
            }
        }
    }

    /// Replaces the handle that will be returned for the given serial
    pub fn replace_handle(&self, serial: &str) -> Arc<MockHandle> {
        let handle = MockHandle::new();
        for device in self.devices.lock().unwrap().iter_mut() {
            if device.info.serial == serial {
                device.handle = handle.clone();
            }
        }
        handle
    }

    pub fn remove_device(&self, serial: &str) {
        self.devices
            .lock()
            .unwrap()
            .retain(|device| device.info.serial != serial);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn enumerate(&self, vendor_id: u16) -> Result<Vec<DeviceInfo>, TransportError> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .filter(|device| device.info.vendor_id == vendor_id)
            .map(|device| device.info.clone())
            .collect())
    }

    fn open(&self, info: &DeviceInfo) -> Result<Arc<dyn HidHandle>, TransportError> {
        let devices = self.devices.lock().unwrap();
        let Some(device) = devices.iter().find(|device| device.info == *info) else {
            return Err(TransportError::Other(format!("no device at {}", info.path)));
        };
        if device.deny {
            return Err(TransportError::PermissionDenied(info.path.clone()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(device.handle.clone())
    }
}

/// Builds a standard input report with the given buttons, neutral sticks and
/// a full, non-charging battery
pub fn input_report(report_id: u8, buttons: ButtonState) -> Vec<u8> {
    let mut report = vec![0u8; 49];
    report[0] = report_id;
    report[2] = 0x80;
    report[3..6].copy_from_slice(&buttons.0);
    // Both sticks centered at 0x800
    report[6..9].copy_from_slice(&[0x00, 0x08, 0x80]);
    report[9..12].copy_from_slice(&[0x00, 0x08, 0x80]);
    report
}

/// Builds a 0x21 reply to an SPI flash read
pub fn spi_reply(address: u32, data: &[u8]) -> Vec<u8> {
    let mut report = input_report(0x21, ButtonState::EMPTY);
    report.resize(20 + data.len().max(0x1D), 0);
    report[13] = 0x90;
    report[14] = 0x10;
    report[15..19].copy_from_slice(&address.to_le_bytes());
    report[19] = data.len() as u8;
    report[20..20 + data.len()].copy_from_slice(data);
    report
}

/// Builds a 0x21 reply to the device info subcommand
pub fn device_info_reply(mac: [u8; 6]) -> Vec<u8> {
    let mut report = input_report(0x21, ButtonState::EMPTY);
    report[13] = 0x82;
    report[14] = 0x02;
    report[15..19].copy_from_slice(&[0x04, 0x06, 0x01, 0x02]);
    report[19..25].copy_from_slice(&mac);
    report[25] = 0x01;
    report[26] = 0x01;
    report
}

/// Parses the (address, length) of an SPI read subcommand in an output report
pub fn spi_request(report: &[u8]) -> Option<(u32, u8)> {
    if report.len() < 16 || report[0] != 0x01 || report[10] != 0x10 {
        return None;
    }
    let address = u32::from_le_bytes([report[11], report[12], report[13], report[14]]);
    Some((address, report[15]))
}
