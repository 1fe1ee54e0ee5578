pub mod buttons;
pub mod calibration;
pub mod driver;
pub mod hid_report;
pub mod rumble;
pub mod transport;

#[cfg(test)]
pub mod mock;

#[cfg(test)]
mod calibration_test;
#[cfg(test)]
mod rumble_test;
