//! Session manager.
//!
//! The [Manager] owns every physical unit the process has opened. New units
//! start out unpaired and show their position in the unpaired list on their
//! player lights. A pairing gesture groups one or two units into a
//! [Controller], assigns it the lowest free player slot and binds it to an
//! output created by the [OutputFactory].

use std::{
    error::Error,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc, watch,
    },
    task::JoinSet,
    time::MissedTickBehavior,
};

use crate::{
    bluetooth::{Bluetooth, BluetoothNotification},
    config::Options,
    constants::{
        FRAME_INTERVAL, NOTIFICATION_CAPACITY, PLAYER_LIGHTS, SCAN_INTERVAL, SHUTDOWN_GRACE,
    },
    drivers::joycon::{
        buttons::{ButtonState, ANY_PAIRING, L_R, L_ZL, R_ZR, SLSR_LEFT, SLSR_RIGHT, ZL_ZR},
        driver::{Driver, Notification, NotifyFlags, Side, PID_CHARGING_GRIP, VID},
        transport::{DeviceInfo, Transport, TransportError},
    },
    input::{
        controller::{Controller, UpdateOutcome},
        target::OutputFactory,
    },
};

/// Possible errors from [Manager::scan]
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("failed to enumerate HID devices: {0}")]
    Enumerate(TransportError),
    #[error("couldn't open {serial}: {source}")]
    Open {
        serial: String,
        source: TransportError,
    },
    #[error("couldn't open {serial}: install udev rules or run as root")]
    PermissionDenied { serial: String },
}

impl ScanError {
    fn open(serial: String, source: TransportError) -> Self {
        if source.is_permission_denied() {
            ScanError::PermissionDenied { serial }
        } else {
            ScanError::Open { serial, source }
        }
    }
}

/// What a single scan changed
#[derive(Debug, Default)]
pub struct ScanSummary {
    pub added: usize,
    pub reconnected: usize,
    /// Units that could not be opened. They are retried on the next scan.
    pub failed: Vec<ScanError>,
}

/// Paired controller as seen from the console
#[derive(Debug, Clone)]
pub struct PairedInfo {
    pub player: usize,
    pub side: Side,
    /// Left half first for dual controllers
    pub drivers: Vec<Arc<Driver>>,
}

/// Point in time copy of the registry
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub unpaired: Vec<Arc<Driver>>,
    pub paired: Vec<PairedInfo>,
}

/// Unit waiting for a pairing gesture
struct UnpairedUnit {
    driver: Arc<Driver>,
    previous: ButtonState,
    current: ButtonState,
}

impl UnpairedUnit {
    fn new(driver: Arc<Driver>) -> Self {
        Self {
            driver,
            previous: ButtonState::EMPTY,
            current: ButtonState::EMPTY,
        }
    }
}

struct PairedController {
    player: usize,
    controller: Controller,
}

#[derive(Default)]
struct Registry {
    unpaired: Vec<UnpairedUnit>,
    paired: Vec<PairedController>,
    /// Units that lost their connection and may come back
    want_reconnect: Vec<Arc<Driver>>,
}

impl Registry {
    fn contains_serial(&self, serial: &str) -> bool {
        let unpaired = self.unpaired.iter().any(|unit| unit.driver.serial() == serial);
        let paired = self.paired.iter().any(|paired| {
            paired
                .controller
                .drivers()
                .iter()
                .any(|driver| driver.serial() == serial)
        });
        let waiting = self
            .want_reconnect
            .iter()
            .any(|driver| driver.serial() == serial);
        unpaired || paired || waiting
    }

    fn unpaired_index(&self, driver: &Arc<Driver>) -> Option<usize> {
        self.unpaired
            .iter()
            .position(|unit| Arc::ptr_eq(&unit.driver, driver))
    }

    /// Lowest player slot in 1..=max that is not taken
    fn free_player(&self, max: usize) -> Option<usize> {
        (1..=max).find(|player| !self.paired.iter().any(|paired| paired.player == *player))
    }

    /// Paired units show their player slot, unpaired units their position
    /// in the unpaired list
    fn fix_player_lights(&self) {
        for paired in self.paired.iter() {
            let pattern = PLAYER_LIGHTS
                .get(paired.player)
                .copied()
                .unwrap_or(PLAYER_LIGHTS[0]);
            for driver in paired.controller.drivers() {
                driver.set_player_lights(pattern);
            }
        }
        for (index, unit) in self.unpaired.iter().enumerate() {
            unit.driver.set_player_lights(unpaired_lights(index));
        }
    }
}

/// Light pattern of the unpaired unit at the given index
pub fn unpaired_lights(index: usize) -> u8 {
    (((index + 1) & 0x0F) << 4) as u8
}

/// Human readable battery state
pub fn render_battery(level: u8, charging: bool) -> String {
    let name = match level {
        0 => "empty",
        1 => "critical",
        2 => "low",
        3 => "medium",
        _ => "full",
    };
    if charging {
        format!("{name} (charging)")
    } else {
        name.to_string()
    }
}

/// Identity key of an enumerated interface. The two halves of a charging
/// grip share a serial number.
fn unit_key(info: &DeviceInfo) -> String {
    if info.product_id == PID_CHARGING_GRIP {
        format!("{}#{}", info.serial, info.interface_number)
    } else {
        info.serial.clone()
    }
}

/// Returns true if the other interface of a charging grip is enumerated too
fn has_grip_partner(info: &DeviceInfo, devices: &[DeviceInfo]) -> bool {
    devices.iter().any(|other| {
        other.product_id == PID_CHARGING_GRIP
            && other.serial == info.serial
            && other.interface_number == 1 - info.interface_number
    })
}

/// Finds the units that should be paired, as lists of indices into the
/// unpaired list. Partner pairs list the left half first.
fn find_pairing_groups(units: &[UnpairedUnit]) -> Vec<Vec<usize>> {
    let mut used = vec![false; units.len()];
    let mut groups = Vec::new();
    for (index, unit) in units.iter().enumerate() {
        if used[index] {
            continue;
        }
        let buttons = unit.current;
        let self_pair = buttons.has_all(SLSR_LEFT)
            || buttons.has_all(SLSR_RIGHT)
            || buttons.has_all(L_R)
            || buttons.has_all(ZL_ZR);
        if self_pair {
            used[index] = true;
            groups.push(vec![index]);
            continue;
        }

        if unit.driver.side() != Side::Left || !buttons.has_any(L_ZL) {
            continue;
        }
        let partner = (0..units.len()).find(|other| {
            *other != index
                && !used[*other]
                && units[*other].driver.side() == Side::Right
                && units[*other].current.has_any(R_ZR)
        });
        if let Some(partner) = partner {
            used[index] = true;
            used[partner] = true;
            groups.push(vec![index, partner]);
        }
    }
    groups
}

/// Failed units are retried on the next scan. Permission errors are only
/// logged at debug since the scan reports them to its caller.
fn record_open_failure(err: ScanError, summary: &mut ScanSummary) {
    if let ScanError::PermissionDenied { .. } = err {
        log::debug!("{err}");
    } else {
        log::warn!("{err}");
    }
    summary.failed.push(err);
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Manages physical units and the controllers built from them
pub struct Manager {
    transport: Arc<dyn Transport>,
    factory: Arc<dyn OutputFactory>,
    bluetooth: Bluetooth,
    options: Options,
    registry: Mutex<Registry>,
    notification_tx: mpsc::Sender<Notification>,
    notification_rx: Mutex<Option<mpsc::Receiver<Notification>>>,
    /// Capacity of one, so bursts of gestures trigger a single attempt
    pairing_tx: mpsc::Sender<()>,
    pairing_rx: Mutex<Option<mpsc::Receiver<()>>>,
    stop_tx: watch::Sender<bool>,
}

impl Manager {
    pub fn new(
        transport: Arc<dyn Transport>,
        factory: Arc<dyn OutputFactory>,
        bluetooth: Bluetooth,
        options: Options,
    ) -> Arc<Self> {
        let (notification_tx, notification_rx) = mpsc::channel(NOTIFICATION_CAPACITY);
        let (pairing_tx, pairing_rx) = mpsc::channel(1);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            transport,
            factory,
            bluetooth,
            options,
            registry: Mutex::new(Registry::default()),
            notification_tx,
            notification_rx: Mutex::new(Some(notification_rx)),
            pairing_tx,
            pairing_rx: Mutex::new(Some(pairing_rx)),
            stop_tx,
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn bluetooth(&self) -> &Bluetooth {
        &self.bluetooth
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn snapshot(&self) -> Snapshot {
        let registry = self.registry();
        Snapshot {
            unpaired: registry
                .unpaired
                .iter()
                .map(|unit| unit.driver.clone())
                .collect(),
            paired: registry
                .paired
                .iter()
                .map(|paired| PairedInfo {
                    player: paired.player,
                    side: paired.controller.side(),
                    drivers: paired.controller.drivers(),
                })
                .collect(),
        }
    }

    /// Enumerates HID devices, reconnects units that came back and admits
    /// new ones as unpaired. Every device is visited; if any of them could
    /// not be opened for lack of permissions, that error is returned once the
    /// scan is done.
    pub fn scan(&self) -> Result<ScanSummary, ScanError> {
        let devices = self
            .transport
            .enumerate(VID)
            .map_err(ScanError::Enumerate)?;

        let mut summary = ScanSummary::default();
        {
            let mut registry = self.registry();
            self.scan_devices(&mut registry, &devices, &mut summary);
            if summary.added > 0 || summary.reconnected > 0 {
                registry.fix_player_lights();
            }
        }

        let denied = summary
            .failed
            .iter()
            .position(|err| matches!(err, ScanError::PermissionDenied { .. }));
        match denied {
            Some(index) => Err(summary.failed.swap_remove(index)),
            None => Ok(summary),
        }
    }

    fn scan_devices(
        &self,
        registry: &mut Registry,
        devices: &[DeviceInfo],
        summary: &mut ScanSummary,
    ) {
        for info in devices {
            let Some(side) = Side::from_product(info.product_id, info.interface_number) else {
                log::trace!(
                    "Ignoring {:04x}:{:04x} interface {}",
                    info.vendor_id,
                    info.product_id,
                    info.interface_number
                );
                continue;
            };
            let key = unit_key(info);

            let returning = registry
                .want_reconnect
                .iter()
                .find(|driver| driver.serial() == key && driver.wants_reconnect())
                .cloned();
            if let Some(driver) = returning {
                match self.transport.open(info) {
                    Ok(handle) => {
                        driver.reconnect(handle);
                        registry
                            .want_reconnect
                            .retain(|other| !Arc::ptr_eq(other, &driver));
                        summary.reconnected += 1;
                    }
                    Err(e) => record_open_failure(ScanError::open(key, e), summary),
                }
                continue;
            }

            if registry.contains_serial(&key) {
                continue;
            }
            if info.product_id == PID_CHARGING_GRIP && !has_grip_partner(info, devices) {
                log::debug!("{key}: waiting for the other half of the charging grip");
                continue;
            }

            let handle = match self.transport.open(info) {
                Ok(handle) => handle,
                Err(e) => {
                    record_open_failure(ScanError::open(key, e), summary);
                    continue;
                }
            };
            let driver = Driver::new(key, side, handle, self.notification_tx.clone());
            driver.start();
            driver.spawn_calibration_load();
            driver.request_device_info();
            log::info!("Connected to {side} {}", driver.serial());
            registry.unpaired.push(UnpairedUnit::new(driver));
            summary.added += 1;
        }
    }

    /// Routes a driver notification to its controller, or tracks the
    /// buttons of an unpaired unit for gesture detection
    pub fn handle_notification(&self, notification: Notification) {
        let Notification { driver, flags } = notification;
        let mut registry = self.registry();

        if flags.contains(NotifyFlags::CONNECTION) {
            let listed = registry
                .want_reconnect
                .iter()
                .any(|other| Arc::ptr_eq(other, &driver));
            if driver.wants_reconnect() && !listed {
                log::info!("{}: connection lost, waiting for it to return", driver.serial());
                registry.want_reconnect.push(driver.clone());
            } else if !driver.wants_reconnect() && listed {
                registry
                    .want_reconnect
                    .retain(|other| !Arc::ptr_eq(other, &driver));
            }

            if driver.is_stopping() {
                if let Some(index) = registry.unpaired_index(&driver) {
                    log::info!("Removing {}", driver.serial());
                    registry.unpaired.remove(index);
                    registry.fix_player_lights();
                    return;
                }
            }
        }

        let paired = registry
            .paired
            .iter()
            .position(|paired| paired.controller.contains(&driver));
        if let Some(index) = paired {
            if registry.paired[index].controller.update(&driver, flags) == UpdateOutcome::Remove {
                let removed = registry.paired.remove(index);
                log::info!("Removing controller {}", removed.player);
                removed.controller.close();
                registry.fix_player_lights();
            }
        } else if flags.contains(NotifyFlags::INPUT) {
            if let Some(index) = registry.unpaired_index(&driver) {
                let unit = &mut registry.unpaired[index];
                unit.previous = unit.current;
                unit.current = driver.buttons();
                if unit.previous.diff_mask(unit.current).has_any(ANY_PAIRING) {
                    // Full means an attempt is already pending
                    let _ = self.pairing_tx.try_send(());
                }
            }
        }

        if flags.contains(NotifyFlags::BATTERY) {
            let (level, charging) = driver.battery();
            log::info!(
                "{} ({}): battery {}",
                driver.side(),
                driver.serial(),
                render_battery(level, charging)
            );
        }
    }

    /// Pairs every unpaired unit that currently holds a pairing gesture.
    /// Returns the newly paired drivers.
    pub fn attempt_pairing(&self) -> Vec<Arc<Driver>> {
        let mut registry = self.registry();
        let mut consumed = Vec::new();
        let mut newly_paired = Vec::new();

        for group in find_pairing_groups(&registry.unpaired) {
            let drivers: Vec<Arc<Driver>> = group
                .iter()
                .map(|index| registry.unpaired[*index].driver.clone())
                .collect();
            let Some(player) = registry.free_player(self.options.max_controllers) else {
                log::warn!(
                    "All {} player slots are taken, not pairing {}",
                    self.options.max_controllers,
                    drivers
                        .iter()
                        .map(|driver| driver.serial())
                        .collect::<Vec<&str>>()
                        .join(" + ")
                );
                break;
            };
            let Some(controller) = self.build_controller(&drivers, player) else {
                continue;
            };

            log::info!(
                "Player {player}: {}",
                drivers
                    .iter()
                    .map(|driver| format!("{} {}", driver.side(), driver.serial()))
                    .collect::<Vec<String>>()
                    .join(" + ")
            );
            registry.paired.push(PairedController { player, controller });
            consumed.extend(group);
            newly_paired.extend(drivers);
        }

        if !consumed.is_empty() {
            consumed.sort_unstable();
            for index in consumed.into_iter().rev() {
                registry.unpaired.remove(index);
            }
            registry.fix_player_lights();
        }
        newly_paired
    }

    fn build_controller(&self, drivers: &[Arc<Driver>], player: usize) -> Option<Controller> {
        let controller = match drivers {
            [driver] if driver.side() == Side::Both => Controller::pro(driver.clone()),
            [driver] => Controller::single(driver.clone()),
            [left, right] => Controller::dual(left.clone(), right.clone()),
            _ => return None,
        };
        match self
            .factory
            .create(controller.side(), player, &self.options.remap)
        {
            Ok(output) => {
                controller.bind(output);
                Some(controller)
            }
            Err(e) => {
                log::error!("Failed to create output for player {player}: {e}");
                None
            }
        }
    }

    pub fn fix_player_lights(&self) {
        self.registry().fix_player_lights();
    }

    /// Runs one output frame for every controller and unit
    pub fn on_frame(&self) {
        let registry = self.registry();
        for paired in registry.paired.iter() {
            paired.controller.on_frame();
            for driver in paired.controller.drivers() {
                driver.on_frame();
            }
        }
        for unit in registry.unpaired.iter() {
            unit.driver.on_frame();
        }
    }

    /// Asks every unit to disconnect and forgets all of them
    pub fn disconnect_all(&self) {
        let mut registry = self.registry();
        for paired in registry.paired.drain(..) {
            for driver in paired.controller.drivers() {
                driver.shutdown();
            }
            paired.controller.close();
        }
        for unit in registry.unpaired.drain(..) {
            unit.driver.shutdown();
        }
        registry.want_reconnect.clear();
    }

    /// Stops the run loop, releases every output and closes every unit
    pub async fn shutdown(&self) {
        if self.stop_tx.send_replace(true) {
            return;
        }
        log::info!("Disconnecting controllers");
        {
            let mut registry = self.registry();
            for paired in registry.paired.drain(..) {
                paired.controller.close();
            }
            for unit in registry.unpaired.drain(..) {
                unit.driver.close();
            }
            registry.want_reconnect.clear();
        }
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    }

    /// Runs the frame ticker, the periodic scan, the pairing and
    /// notification consumers and the Bluetooth hint listener until
    /// [Manager::shutdown] is called
    pub async fn run(self: Arc<Self>) -> Result<(), Box<dyn Error + Send + Sync>> {
        let notifications = self
            .notification_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or("session manager is already running")?;
        let pairing = self
            .pairing_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or("session manager is already running")?;

        let hints = self.bluetooth.subscribe();
        log::info!("Using {} Bluetooth backend", self.bluetooth.name());
        if let Err(e) = self.bluetooth.initial_scan().await {
            log::warn!("Initial Bluetooth scan failed: {e}");
        }

        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().run_frames());
        tasks.spawn(self.clone().run_scans());
        tasks.spawn(self.clone().run_pairing(pairing));
        tasks.spawn(self.clone().run_notifications(notifications));
        tasks.spawn(self.clone().run_bluetooth_hints(hints));

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                log::error!("Session manager task failed: {e}");
            }
        }
        log::info!("Session manager stopped");
        Ok(())
    }

    async fn run_frames(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let mut interval = tokio::time::interval(FRAME_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.on_frame(),
                _ = stopped(&mut stop) => break,
            }
        }
    }

    async fn run_scans(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Repeated failures are only logged when they change
        let mut last_error: Option<String> = None;
        loop {
            tokio::select! {
                _ = interval.tick() => match self.scan() {
                    Ok(_) => last_error = None,
                    Err(e) => {
                        let message = e.to_string();
                        if last_error.as_deref() != Some(message.as_str()) {
                            log::error!("{message}");
                        }
                        last_error = Some(message);
                    }
                },
                _ = stopped(&mut stop) => break,
            }
        }
    }

    async fn run_pairing(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        let mut stop = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                signal = rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    for driver in self.attempt_pairing() {
                        let Some(mac) = driver.mac() else {
                            continue;
                        };
                        if let Err(e) = self.bluetooth.save_pairing_info(&mac).await {
                            log::debug!("{}: pairing info not saved: {e}", driver.serial());
                        }
                    }
                },
                _ = stopped(&mut stop) => break,
            }
        }
    }

    async fn run_notifications(self: Arc<Self>, mut rx: mpsc::Receiver<Notification>) {
        let mut stop = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                notification = rx.recv() => match notification {
                    Some(notification) => self.handle_notification(notification),
                    None => break,
                },
                _ = stopped(&mut stop) => break,
            }
        }
    }

    async fn run_bluetooth_hints(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<BluetoothNotification>,
    ) {
        let mut stop = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                hint = rx.recv() => match hint {
                    Ok(hint) => {
                        log::debug!("Bluetooth hint for '{}', rescanning", hint.mac_string);
                        if let Err(e) = self.scan() {
                            log::warn!("Scan after Bluetooth hint failed: {e}");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("Skipped {skipped} Bluetooth hints");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = stopped(&mut stop) => break,
            }
        }
    }
}
