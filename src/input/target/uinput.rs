//! Virtual evdev gamepad backed by uinput
use evdev::{
    uinput::{VirtualDevice, VirtualDeviceBuilder},
    AbsInfo, AttributeSet, BusType, EventType, InputEvent, InputId, KeyCode, SynchronizationCode,
    SynchronizationEvent, UinputAbsSetup,
};

use crate::drivers::joycon::{
    buttons::{AxisId, ButtonId},
    calibration::STICK_RANGE,
    driver::{Side, PID_LEFT, PID_PRO, PID_RIGHT, VID},
    hid_report::GyroFrame,
};

use super::{mapping::ControllerMapping, Output, OutputError};

const BUS_BLUETOOTH: u16 = 0x05;
const STICK_FUZZ: i32 = 4;
const STICK_FLAT: i32 = 4;

pub struct UinputOutput {
    device: Option<VirtualDevice>,
    mapping: ControllerMapping,
    pending: Vec<InputEvent>,
}

impl UinputOutput {
    pub fn new(mapping: ControllerMapping, name: &str, side: Side) -> Result<Self, OutputError> {
        let device = UinputOutput::create_virtual_device(&mapping, name, side)?;
        Ok(Self {
            device: Some(device),
            mapping,
            pending: Vec::new(),
        })
    }

    /// Create the virtual device to emulate
    fn create_virtual_device(
        mapping: &ControllerMapping,
        name: &str,
        side: Side,
    ) -> Result<VirtualDevice, OutputError> {
        // Setup Key inputs
        let mut keys = AttributeSet::<KeyCode>::new();
        for key in mapping.keys.iter() {
            keys.insert(key.code);
        }

        // Setup ABS inputs
        let range = STICK_RANGE as i32;
        let stick_setup = AbsInfo::new(0, -range, range, STICK_FUZZ, STICK_FLAT, 1);
        let axes: Vec<UinputAbsSetup> = mapping
            .axes
            .iter()
            .map(|axis| UinputAbsSetup::new(axis.code, stick_setup))
            .collect();

        // Identify as the physical controller type
        let product = match side {
            Side::Left => PID_LEFT,
            Side::Right => PID_RIGHT,
            Side::Both => PID_PRO,
        };
        let id = InputId::new(BusType(BUS_BLUETOOTH), VID, product, 1);

        // Build the device
        let mut builder = VirtualDeviceBuilder::new()?
            .name(name)
            .input_id(id)
            .with_keys(&keys)?;
        for axis in axes.iter() {
            builder = builder.with_absolute_axis(axis)?;
        }
        let device = builder.build()?;

        Ok(device)
    }
}

impl Output for UinputOutput {
    fn begin_update(&mut self) -> Result<(), OutputError> {
        if self.device.is_none() {
            return Err(OutputError::Closed);
        }
        self.pending.clear();
        Ok(())
    }

    fn button_update(&mut self, button: ButtonId, pressed: bool) {
        let Some(code) = self.mapping.key_for(button) else {
            return;
        };
        let event = InputEvent::new(EventType::KEY.0, code.0, pressed as i32);
        self.pending.push(event);
    }

    fn stick_update(&mut self, axis: AxisId, value: i16) {
        let Some(mapping) = self.mapping.axis_for(axis) else {
            return;
        };
        let event = InputEvent::new(EventType::ABSOLUTE.0, mapping.code.0, mapping.value(value));
        self.pending.push(event);
    }

    fn gyro_update(&mut self, _frame: GyroFrame) {}

    fn flush_update(&mut self) -> Result<(), OutputError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let Some(device) = self.device.as_mut() else {
            self.pending.clear();
            return Err(OutputError::Closed);
        };
        self.pending
            .push(SynchronizationEvent::new(SynchronizationCode::SYN_REPORT, 0).into());
        let result = device.emit(self.pending.as_slice());
        self.pending.clear();
        result?;
        Ok(())
    }

    fn on_frame(&mut self) {}

    fn close(&mut self) -> Result<(), OutputError> {
        // Dropping the device destroys it
        self.device.take();
        self.pending.clear();
        Ok(())
    }
}
