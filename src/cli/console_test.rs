use std::{error::Error, sync::Arc, time::Duration};

use tokio::sync::{broadcast, mpsc};

use crate::{
    bluetooth::Bluetooth,
    cli::console::{
        hex_dump, parse_number, render_units, select, CommandError, Console, Outcome,
        SelectError,
    },
    config::Options,
    drivers::joycon::{
        driver::{Driver, DriverError, Side, PID_LEFT, PID_RIGHT},
        mock::{spi_reply, spi_request, MockHandle, MockTransport},
    },
    input::{
        manager::{Manager, PairedInfo, Snapshot},
        target::recorder::RecorderFactory,
    },
};

fn new_driver(serial: &str, side: Side) -> Arc<Driver> {
    let (tx, _rx) = mpsc::channel(8);
    Driver::new(serial.to_string(), side, MockHandle::new(), tx)
}

/// Console over a manager with one left and one right unit admitted
fn new_console() -> Result<(Console, Arc<Manager>, Arc<MockHandle>), Box<dyn Error>> {
    let transport = MockTransport::new();
    let left = transport.add_device(PID_LEFT, "left-1", 0);
    transport.add_device(PID_RIGHT, "right-1", 0);
    let (tx, _) = broadcast::channel(4);
    let manager = Manager::new(
        transport,
        RecorderFactory::new(),
        Bluetooth::Disabled(tx),
        Options::default(),
    );
    manager.scan()?;
    Ok((Console::new(manager.clone()), manager, left))
}

fn text(outcome: Outcome) -> String {
    match outcome {
        Outcome::Continue(text) => text,
        Outcome::Exit => panic!("unexpected exit"),
    }
}

/// Flushes queued subcommands and returns everything written to the device
fn flush(driver: &Driver, handle: &MockHandle) -> Vec<Vec<u8>> {
    for _ in 0..32 {
        if driver.pending_subcommands() == 0 {
            break;
        }
        driver.on_frame();
    }
    handle.take_written()
}

#[test]
fn test_parse_number() -> Result<(), Box<dyn Error>> {
    assert_eq!(parse_number("42"), Some(42));
    assert_eq!(parse_number("0"), Some(0));
    assert_eq!(parse_number("0x6000"), Some(0x6000));
    assert_eq!(parse_number("0XfF"), Some(0xFF));
    assert_eq!(parse_number("0b101"), Some(5));
    assert_eq!(parse_number("0o17"), Some(15));
    assert_eq!(parse_number("017"), Some(15));
    assert_eq!(parse_number("0x"), None);
    assert_eq!(parse_number("08"), None);
    assert_eq!(parse_number("-1"), None);
    assert_eq!(parse_number("abc"), None);
    Ok(())
}

#[test]
fn test_select() -> Result<(), Box<dyn Error>> {
    let unpaired = new_driver("u", Side::Left);
    let single = new_driver("single", Side::Right);
    let left = new_driver("left", Side::Left);
    let right = new_driver("right", Side::Right);
    let snapshot = Snapshot {
        unpaired: vec![unpaired.clone()],
        paired: vec![
            PairedInfo {
                player: 1,
                side: Side::Right,
                drivers: vec![single.clone()],
            },
            PairedInfo {
                player: 2,
                side: Side::Both,
                drivers: vec![left.clone(), right.clone()],
            },
        ],
    };

    assert!(Arc::ptr_eq(&select(&snapshot, "u1")?, &unpaired));
    assert!(Arc::ptr_eq(&select(&snapshot, "c1")?, &single));
    assert!(Arc::ptr_eq(&select(&snapshot, "c1r")?, &single));
    assert!(Arc::ptr_eq(&select(&snapshot, "c2l")?, &left));
    assert!(Arc::ptr_eq(&select(&snapshot, "c2r")?, &right));

    assert_eq!(
        select(&snapshot, "u2").unwrap_err(),
        SelectError::UnpairedOutOfRange("u2".to_string(), 1)
    );
    assert_eq!(
        select(&snapshot, "u0").unwrap_err(),
        SelectError::UnpairedOutOfRange("u0".to_string(), 1)
    );
    assert_eq!(
        select(&snapshot, "c3").unwrap_err(),
        SelectError::ControllerOutOfRange("c3".to_string(), 2)
    );
    assert_eq!(
        select(&snapshot, "c2").unwrap_err(),
        SelectError::NeedsSide("c2".to_string())
    );
    for invalid in ["x1", "u", "u1x", "c1lr", "1", "uu1"] {
        assert_eq!(
            select(&snapshot, invalid).unwrap_err(),
            SelectError::Invalid(invalid.to_string())
        );
    }
    Ok(())
}

#[test]
fn test_hex_dump() -> Result<(), Box<dyn Error>> {
    let data: Vec<u8> = (0x41..0x52).collect();
    let dump = hex_dump(&data);
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(
        lines[0],
        "00000000  41 42 43 44 45 46 47 48  49 4a 4b 4c 4d 4e 4f 50  |ABCDEFGHIJKLMNOP|"
    );
    assert!(lines[1].starts_with("00000010  51 "));
    assert!(lines[1].ends_with("|Q|"));
    Ok(())
}

#[test]
fn test_render_units() -> Result<(), Box<dyn Error>> {
    assert_eq!(render_units(&Snapshot::default()), "No Joy-Cons connected");

    let snapshot = Snapshot {
        unpaired: vec![new_driver("SERIAL-U", Side::Left)],
        paired: vec![PairedInfo {
            player: 1,
            side: Side::Both,
            drivers: vec![
                new_driver("SERIAL-L", Side::Left),
                new_driver("SERIAL-R", Side::Right),
            ],
        }],
    };
    let table = render_units(&snapshot);
    assert!(table.contains("Connected Joy-Cons"));
    for expected in ["u1", "c1l", "c1r", "SERIAL-U", "Right Joy-Con"] {
        assert!(table.contains(expected), "missing {expected} in\n{table}");
    }
    Ok(())
}

#[tokio::test]
async fn test_basic_commands() -> Result<(), Box<dyn Error>> {
    let (console, _manager, _left) = new_console()?;

    assert_eq!(console.execute(&[]).await?, Outcome::Continue(String::new()));
    assert_eq!(console.execute(&["quit"]).await?, Outcome::Exit);

    let help = text(console.execute(&["?"]).await?);
    assert!(help.contains("setPlayerLights - Set the player lights"));
    assert!(help.contains("resetsync - Reset Joy-Con pairing info."));

    let list = text(console.execute(&["ls"]).await?);
    assert!(list.contains("left-1") && list.contains("right-1"));

    let result = console.execute(&["frobnicate"]).await;
    assert!(matches!(result, Err(CommandError::Unknown(name)) if name == "frobnicate"));

    let result = console.execute(&["imu", "u3", "on"]).await;
    assert!(matches!(
        result,
        Err(CommandError::Select(SelectError::UnpairedOutOfRange(_, 2)))
    ));

    // Bluetooth commands are accepted with the backend disabled
    let sync = text(console.execute(&["sync"]).await?);
    assert!(sync.starts_with("Searching for Bluetooth devices."));
    assert_eq!(
        text(console.execute(&["syncoff"]).await?),
        "Stopped Bluetooth search."
    );
    Ok(())
}

#[tokio::test]
async fn test_device_commands() -> Result<(), Box<dyn Error>> {
    let (console, manager, handle) = new_console()?;
    let driver = manager.snapshot().unpaired[0].clone();
    assert_eq!(driver.serial(), "left-1");
    flush(&driver, &handle);

    console.execute(&["setPlayerLights", "u1", "x8"]).await?;
    let written = flush(&driver, &handle);
    assert!(written.iter().any(|r| r[10] == 0x30 && r[11] == 0x08));

    let result = console.execute(&["setPlayerLights", "u1"]).await;
    assert!(matches!(result, Err(CommandError::Usage(_))));

    assert_eq!(text(console.execute(&["imu", "u1", "on"]).await?), "IMU enabled");
    let written = flush(&driver, &handle);
    assert!(written.iter().any(|r| r[10] == 0x40 && r[11] == 0x01));

    let result = console.execute(&["write", "u1", "0x8010", "3", "0x1", "0x2"]).await;
    assert!(matches!(result, Err(CommandError::WrongDataLength)));
    let result = console.execute(&["write", "u1", "0x8010", "1", "0x100"]).await;
    assert!(matches!(result, Err(CommandError::InvalidNumber(_))));

    console
        .execute(&["write", "u1", "0x8010", "2", "0xB2", "0xA1"])
        .await?;
    let written = flush(&driver, &handle);
    let write = written
        .iter()
        .find(|r| r[10] == 0x11)
        .ok_or("no SPI write sent")?;
    assert_eq!(&write[11..18], &[0x10, 0x80, 0x00, 0x00, 0x02, 0xB2, 0xA1]);

    assert_eq!(
        text(console.execute(&["mode", "u1", "polling"]).await?),
        "Input mode set to ActivePolling"
    );
    let written = flush(&driver, &handle);
    assert!(written.iter().any(|r| r[10] == 0x03 && r[11] == 0x3F));
    assert_eq!(
        text(console.execute(&["mode", "u1", "polling"]).await?),
        "Already in ActivePolling mode"
    );
    let result = console.execute(&["mode", "u1", "fast"]).await;
    assert!(matches!(result, Err(CommandError::Usage(_))));

    console.execute(&["send", "u1", "0x48", "0x01"]).await?;
    let written = flush(&driver, &handle);
    assert!(written.iter().any(|r| r[10] == 0x48 && r[11] == 0x01));

    assert_eq!(
        text(console.execute(&["disconnect", "u1"]).await?),
        "Disconnected left-1"
    );
    assert!(driver.is_stopping());
    Ok(())
}

#[tokio::test]
async fn test_spi_read_command() -> Result<(), Box<dyn Error>> {
    let (console, manager, handle) = new_console()?;
    let driver = manager.snapshot().unpaired[0].clone();

    // Answers every SPI read with bytes derived from the address
    let serve = async {
        loop {
            driver.on_frame();
            for (address, length) in handle.take_written().iter().filter_map(|r| spi_request(r))
            {
                let data: Vec<u8> = (0..length as u32).map(|i| (address + i) as u8).collect();
                driver.handle_packet(&spi_reply(address, &data));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };

    let output = tokio::select! {
        result = console.execute(&["read", "u1", "0x6000", "0x20"]) => text(result?),
        _ = serve => unreachable!(),
    };
    assert!(output.starts_with("SPI read 006000 32 data:\n"));
    assert!(output.contains("00000000  00 01 02 03 04 05 06 07  08 09 0a 0b"));
    assert!(output.contains("00000010  10 11 12"));

    let result = console.execute(&["read", "u1", "0x6000"]).await;
    assert!(matches!(result, Err(CommandError::Usage(_))));

    // Ranges past the end of the flash fail without touching the device
    let result = console.execute(&["read", "u1", "0xFFFFFFF0", "0x40"]).await;
    assert!(matches!(
        result,
        Err(CommandError::SpiRead {
            source: DriverError::OutOfRange { .. },
            ..
        })
    ));
    assert!(handle.take_written().iter().all(|r| spi_request(r).is_none()));
    Ok(())
}

#[tokio::test]
async fn test_disconnect_all() -> Result<(), Box<dyn Error>> {
    let (console, manager, _left) = new_console()?;
    assert_eq!(manager.snapshot().unpaired.len(), 2);
    assert_eq!(
        text(console.execute(&["disconnectall"]).await?),
        "Disconnected all."
    );
    let snapshot = manager.snapshot();
    assert!(snapshot.unpaired.is_empty() && snapshot.paired.is_empty());
    Ok(())
}
