use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::broadcast, task::JoinHandle};

use super::BluetoothNotification;

/// How often a rescan hint is sent while discovery is on
pub const HINT_INTERVAL: Duration = Duration::from_secs(2);

/// Backend for systems without a usable Bluetooth service. It cannot see
/// devices, so it asks for periodic rescans while discovery is on.
#[derive(Debug)]
pub struct GenericBluetooth {
    tx: broadcast::Sender<BluetoothNotification>,
    interval: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl GenericBluetooth {
    pub fn new(tx: broadcast::Sender<BluetoothNotification>) -> Self {
        Self::with_interval(tx, HINT_INTERVAL)
    }

    pub fn with_interval(tx: broadcast::Sender<BluetoothNotification>, interval: Duration) -> Self {
        Self {
            tx,
            interval,
            ticker: Mutex::new(None),
        }
    }

    fn ticker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.ticker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BluetoothNotification> {
        self.tx.subscribe()
    }

    pub fn is_discovering(&self) -> bool {
        self.ticker().is_some()
    }

    pub fn start_discovery(&self) {
        let mut ticker = self.ticker();
        if ticker.is_some() {
            return;
        }
        let tx = self.tx.clone();
        let period = self.interval;
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                // Nobody listening is fine
                let _ = tx.send(BluetoothNotification::default());
            }
        }));
        log::debug!("Generic Bluetooth discovery started");
    }

    pub fn stop_discovery(&self) {
        if let Some(ticker) = self.ticker().take() {
            ticker.abort();
            log::debug!("Generic Bluetooth discovery stopped");
        }
    }

    pub fn initial_scan(&self) {
        let _ = self.tx.send(BluetoothNotification::default());
    }
}

impl Drop for GenericBluetooth {
    fn drop(&mut self) {
        self.stop_discovery();
    }
}
