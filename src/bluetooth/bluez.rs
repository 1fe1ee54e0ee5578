use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tokio::sync::broadcast;
use zbus::{
    fdo::{ManagedObjects, ObjectManagerProxy},
    zvariant::{OwnedObjectPath, Value},
    Connection,
};

use super::{format_mac, is_controller_name, parse_mac, BluetoothError, BluetoothNotification};

const BUS_NAME: &str = "org.bluez";
const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
const DEVICE_INTERFACE: &str = "org.bluez.Device1";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Device object exported by BlueZ
#[derive(Debug, Clone)]
struct KnownDevice {
    path: OwnedObjectPath,
    address: String,
    name: String,
    connected: bool,
}

/// Backend that drives the BlueZ daemon over the system bus
#[derive(Debug)]
pub struct BluezBluetooth {
    conn: Connection,
    adapter: OwnedObjectPath,
    tx: broadcast::Sender<BluetoothNotification>,
    watching: AtomicBool,
}

impl BluezBluetooth {
    /// Connects to the system bus and picks the first Bluetooth adapter
    pub async fn connect(
        tx: broadcast::Sender<BluetoothNotification>,
    ) -> Result<Self, BluetoothError> {
        let conn = Connection::system().await?;
        let objects = managed_objects(&conn).await?;
        let adapter = objects
            .iter()
            .find(|(_, interfaces)| {
                interfaces
                    .keys()
                    .any(|name| name.as_str() == ADAPTER_INTERFACE)
            })
            .map(|(path, _)| path.clone())
            .ok_or(BluetoothError::NoAdapter)?;
        log::info!("Using Bluetooth adapter {}", adapter.as_str());

        Ok(Self {
            conn,
            adapter,
            tx,
            watching: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BluetoothNotification> {
        self.tx.subscribe()
    }

    async fn call_adapter<B>(&self, method: &str, body: &B) -> Result<(), BluetoothError>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        self.conn
            .call_method(
                Some(BUS_NAME),
                self.adapter.as_str(),
                Some(ADAPTER_INTERFACE),
                method,
                body,
            )
            .await?;
        Ok(())
    }

    pub async fn start_discovery(&self) -> Result<(), BluetoothError> {
        self.call_adapter("StartDiscovery", &()).await
    }

    pub async fn stop_discovery(&self) -> Result<(), BluetoothError> {
        self.call_adapter("StopDiscovery", &()).await
    }

    /// Replays connected controllers, then starts watching for new devices
    pub async fn initial_scan(&self) -> Result<(), BluetoothError> {
        for device in self.devices().await? {
            if !device.connected || !is_controller_name(&device.name) {
                continue;
            }
            let Some(mac) = parse_mac(&device.address) else {
                log::debug!("Ignoring device with bad address: {}", device.address);
                continue;
            };
            log::debug!("Found connected {} ({})", device.name, device.address);
            let _ = self
                .tx
                .send(BluetoothNotification::for_device(mac, true, false));
        }

        if !self.watching.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.watch_new_devices().await {
                self.watching.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn watch_new_devices(&self) -> Result<(), BluetoothError> {
        let object_manager = object_manager(&self.conn).await?;
        let mut interfaces_added = object_manager.receive_interfaces_added().await?;
        let tx = self.tx.clone();
        tokio::task::spawn(async move {
            while let Some(signal) = interfaces_added.next().await {
                let Ok(args) = signal.args() else { break };
                let Some(properties) = args
                    .interfaces_and_properties
                    .iter()
                    .find(|(name, _)| name.as_str() == DEVICE_INTERFACE)
                    .map(|(_, properties)| properties)
                else {
                    continue;
                };

                let name = properties
                    .get("Name")
                    .and_then(|value| <&str>::try_from(value).ok())
                    .unwrap_or_default();
                if !is_controller_name(name) {
                    continue;
                }
                let Some(mac) = properties
                    .get("Address")
                    .and_then(|value| <&str>::try_from(value).ok())
                    .and_then(parse_mac)
                else {
                    continue;
                };
                let connected = properties
                    .get("Connected")
                    .and_then(|value| bool::try_from(value).ok())
                    .unwrap_or(false);

                log::info!("New Bluetooth device: {name} ({})", format_mac(&mac));
                let _ = tx.send(BluetoothNotification::for_device(mac, connected, true));
            }
            log::debug!("Stopped watching for Bluetooth devices");
        });
        Ok(())
    }

    pub async fn save_pairing_info(&self, mac: &[u8; 6]) -> Result<(), BluetoothError> {
        let address = format_mac(mac);
        let device = self
            .devices()
            .await?
            .into_iter()
            .find(|device| device.address.eq_ignore_ascii_case(&address))
            .ok_or(BluetoothError::UnknownDevice(address))?;

        self.conn
            .call_method(
                Some(BUS_NAME),
                device.path.as_str(),
                Some(PROPERTIES_INTERFACE),
                "Set",
                &(DEVICE_INTERFACE, "Trusted", Value::from(true)),
            )
            .await?;
        log::info!("Marked {} ({}) as trusted", device.name, device.address);
        Ok(())
    }

    pub async fn delete_pairing_info(&self) -> Result<(), BluetoothError> {
        let mut removed = 0;
        for device in self.devices().await? {
            if !is_controller_name(&device.name) {
                continue;
            }
            self.call_adapter("RemoveDevice", &(device.path.clone(),))
                .await?;
            log::debug!("Removed {} ({})", device.name, device.address);
            removed += 1;
        }
        log::info!("Removed {removed} paired controllers");
        Ok(())
    }

    async fn devices(&self) -> Result<Vec<KnownDevice>, BluetoothError> {
        let objects = managed_objects(&self.conn).await?;
        let mut devices = Vec::new();
        for (path, interfaces) in objects {
            let Some(properties) = interfaces
                .iter()
                .find(|(name, _)| name.as_str() == DEVICE_INTERFACE)
                .map(|(_, properties)| properties)
            else {
                continue;
            };
            let text = |key: &str| {
                properties
                    .get(key)
                    .and_then(|value| <&str>::try_from(value).ok())
                    .unwrap_or_default()
                    .to_string()
            };
            devices.push(KnownDevice {
                address: text("Address"),
                name: text("Name"),
                connected: properties
                    .get("Connected")
                    .and_then(|value| bool::try_from(value).ok())
                    .unwrap_or(false),
                path,
            });
        }
        Ok(devices)
    }
}

async fn object_manager(conn: &Connection) -> Result<ObjectManagerProxy<'static>, BluetoothError> {
    let object_manager = ObjectManagerProxy::builder(conn)
        .destination(BUS_NAME)?
        .path("/")?
        .build()
        .await?;
    Ok(object_manager)
}

async fn managed_objects(conn: &Connection) -> Result<ManagedObjects, BluetoothError> {
    let objects = object_manager(conn).await?.get_managed_objects().await?;
    Ok(objects)
}
