//! # Platform BLE Backend
//!
//! `GattStack` implementation on top of btleplug.
//!
//! btleplug is async and request/response shaped; the session manager expects
//! fire-and-forget requests whose results come back as callbacks. Every request
//! therefore spawns a task on a private Tokio runtime that performs the call and
//! sends the matching `GattCallback` down the connection's callback channel.
//!
//! Notifications are enabled through the CCCD descriptor on the wire. btleplug
//! only exposes that as subscribe/unsubscribe, so a CCCD write is mapped onto
//! those two calls and acknowledged with a `DescriptorWrite` callback.

use crate::error::GattError;
use crate::gatt::{
    CallbackSender, CharacteristicId, DescriptorId, DeviceAddress, GattCallback, GattEvent,
    GattHandle, GattService, GattStack, ProfileState, RemoteDevice, CCCD_UUID, GATT_FAILURE,
    GATT_SUCCESS,
};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

/// How long to scan when an address is not yet known to the adapter
const SCAN_WINDOW: Duration = Duration::from_secs(5);

/// The notification forwarder of one connection.
///
/// btleplug notification streams can outlive the link, so a forwarder is never
/// left to end on its own: it is aborted on disconnect, on close and whenever a
/// reconnect installs its successor.
#[derive(Default)]
struct NotificationTask {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationTask {
    /// Installs `task`, aborting the forwarder it replaces.
    fn replace(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.slot().replace(task) {
            previous.abort();
        }
    }

    fn stop(&self) {
        if let Some(task) = self.slot().take() {
            task.abort();
        }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.slot().as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    fn slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Routing entry for adapter-level events
struct Link {
    address: DeviceAddress,
    callbacks: CallbackSender,
    connected: Arc<AtomicBool>,
    notifications: Arc<NotificationTask>,
}

type Links = Arc<Mutex<HashMap<PeripheralId, Link>>>;

pub struct BtleplugStack {
    runtime: Arc<Runtime>,
    adapter: Option<Adapter>,
    peripherals: HashMap<DeviceAddress, Peripheral>,
    links: Links,
}

impl BtleplugStack {
    /// Creates the backend and its runtime. No Bluetooth calls are made yet.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            runtime: Arc::new(Runtime::new()?),
            adapter: None,
            peripherals: HashMap::new(),
            links: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Watches adapter events so remote disconnects reach the session manager.
    fn watch_adapter(&self, adapter: Adapter) {
        let links = Arc::clone(&self.links);
        self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    log::warn!("Adapter events unavailable: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    let routes = lock(&links);
                    if let Some(link) = routes.get(&id) {
                        link.notifications.stop();
                        if link.connected.swap(false, Ordering::SeqCst) {
                            emit(
                                &link.callbacks,
                                &link.address,
                                GattCallback::ConnectionStateChange {
                                    status: GATT_SUCCESS,
                                    new_state: ProfileState::Disconnected,
                                },
                            );
                        }
                    }
                }
            }
            log::debug!("Adapter event stream ended");
        });
    }

    async fn find_peripheral(adapter: &Adapter, address: &DeviceAddress) -> Option<Peripheral> {
        let peripherals = adapter.peripherals().await.ok()?;
        peripherals
            .into_iter()
            .find(|p| DeviceAddress::parse(&p.address().to_string()).as_ref() == Some(address))
    }
}

impl GattStack for BtleplugStack {
    fn acquire_adapter(&mut self) -> bool {
        if self.adapter.is_some() {
            return true;
        }
        let adapter = self.runtime.block_on(async {
            let manager = Manager::new().await.ok()?;
            manager.adapters().await.ok()?.into_iter().next()
        });
        match adapter {
            Some(adapter) => {
                self.watch_adapter(adapter.clone());
                self.adapter = Some(adapter);
                true
            }
            None => {
                log::error!("No Bluetooth adapter found");
                false
            }
        }
    }

    fn remote_device(&mut self, address: &DeviceAddress) -> Option<RemoteDevice> {
        let adapter = self.adapter.clone()?;
        let lookup = address.clone();
        let peripheral = self.runtime.block_on(async move {
            if let Some(peripheral) = Self::find_peripheral(&adapter, &lookup).await {
                return Some(peripheral);
            }
            log::info!("{} not cached by the adapter, scanning", lookup);
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                log::warn!("Failed to start scan: {}", e);
                return None;
            }
            tokio::time::sleep(SCAN_WINDOW).await;
            if let Err(e) = adapter.stop_scan().await {
                log::warn!("Failed to stop scan: {}", e);
            }
            Self::find_peripheral(&adapter, &lookup).await
        })?;

        let name = self
            .runtime
            .block_on(peripheral.properties())
            .ok()
            .flatten()
            .and_then(|props| props.local_name);
        self.peripherals.insert(address.clone(), peripheral);
        Some(RemoteDevice {
            address: address.clone(),
            name,
        })
    }

    fn connect_gatt(
        &mut self,
        device: &RemoteDevice,
        _auto_connect: bool,
        callbacks: CallbackSender,
    ) -> Box<dyn GattHandle> {
        let peripheral = self.peripherals.get(&device.address).cloned();
        let connected = Arc::new(AtomicBool::new(false));
        let notifications = Arc::new(NotificationTask::default());
        if let Some(peripheral) = &peripheral {
            lock(&self.links).insert(
                peripheral.id(),
                Link {
                    address: device.address.clone(),
                    callbacks: callbacks.clone(),
                    connected: Arc::clone(&connected),
                    notifications: Arc::clone(&notifications),
                },
            );
        }

        let mut handle = BtleplugHandle {
            runtime: Arc::clone(&self.runtime),
            peripheral,
            address: device.address.clone(),
            callbacks,
            connected,
            notifications,
            links: Arc::clone(&self.links),
            closed: false,
        };
        if !handle.connect() {
            log::warn!("{} was not resolved before connecting", device.address);
        }
        Box::new(handle)
    }
}

pub struct BtleplugHandle {
    runtime: Arc<Runtime>,
    peripheral: Option<Peripheral>,
    address: DeviceAddress,
    callbacks: CallbackSender,
    connected: Arc<AtomicBool>,
    notifications: Arc<NotificationTask>,
    links: Links,
    closed: bool,
}

impl BtleplugHandle {
    fn peripheral(&self) -> Result<&Peripheral, GattError> {
        match &self.peripheral {
            Some(peripheral) if !self.closed => Ok(peripheral),
            _ => Err(GattError::NotConnected),
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }

    fn characteristic(&self, id: &CharacteristicId) -> Result<Characteristic, GattError> {
        self.peripheral()?
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == id.service && c.uuid == id.characteristic)
            .ok_or_else(|| GattError::AttributeNotFound(id.characteristic.to_string()))
    }
}

impl GattHandle for BtleplugHandle {
    fn connect(&mut self) -> bool {
        let peripheral = match self.peripheral() {
            Ok(peripheral) => peripheral.clone(),
            Err(_) => return false,
        };
        let address = self.address.clone();
        let callbacks = self.callbacks.clone();
        let connected = Arc::clone(&self.connected);
        let notifications = Arc::clone(&self.notifications);
        notifications.stop();

        self.spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    connected.store(true, Ordering::SeqCst);
                    notifications.replace(tokio::spawn(forward_notifications(
                        peripheral.clone(),
                        address.clone(),
                        callbacks.clone(),
                    )));
                    emit(
                        &callbacks,
                        &address,
                        GattCallback::ConnectionStateChange {
                            status: GATT_SUCCESS,
                            new_state: ProfileState::Connected,
                        },
                    );
                }
                Err(e) => {
                    log::warn!("Failed to connect to {}: {}", address, e);
                    emit(
                        &callbacks,
                        &address,
                        GattCallback::ConnectionStateChange {
                            status: GATT_FAILURE,
                            new_state: ProfileState::Disconnected,
                        },
                    );
                }
            }
        });
        true
    }

    fn disconnect(&mut self) {
        let Ok(peripheral) = self.peripheral().cloned() else {
            return;
        };
        self.notifications.stop();
        let address = self.address.clone();
        let callbacks = self.callbacks.clone();
        let connected = Arc::clone(&self.connected);
        self.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                log::warn!("Failed to disconnect from {}: {}", address, e);
            }
            // Some backends never raise DeviceDisconnected for local requests
            if connected.swap(false, Ordering::SeqCst) {
                emit(
                    &callbacks,
                    &address,
                    GattCallback::ConnectionStateChange {
                        status: GATT_SUCCESS,
                        new_state: ProfileState::Disconnected,
                    },
                );
            }
        });
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.notifications.stop();
        let Some(peripheral) = self.peripheral.clone() else {
            return;
        };
        lock(&self.links).remove(&peripheral.id());
        if self.connected.swap(false, Ordering::SeqCst) {
            let address = self.address.clone();
            self.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    log::debug!("Disconnect on close of {} failed: {}", address, e);
                }
            });
        }
    }

    fn discover_services(&mut self) -> bool {
        let Ok(peripheral) = self.peripheral().cloned() else {
            return false;
        };
        let address = self.address.clone();
        let callbacks = self.callbacks.clone();
        self.spawn(async move {
            let status = match peripheral.discover_services().await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    log::warn!("Service discovery on {} failed: {}", address, e);
                    GATT_FAILURE
                }
            };
            emit(&callbacks, &address, GattCallback::ServicesDiscovered { status });
        });
        true
    }

    fn read_characteristic(&mut self, characteristic: &CharacteristicId) -> Result<(), GattError> {
        let peripheral = self.peripheral()?.clone();
        let target = self.characteristic(characteristic)?;
        let id = *characteristic;
        let address = self.address.clone();
        let callbacks = self.callbacks.clone();
        self.spawn(async move {
            let callback = match peripheral.read(&target).await {
                Ok(value) => GattCallback::CharacteristicRead {
                    characteristic: id,
                    value,
                    status: GATT_SUCCESS,
                },
                Err(e) => {
                    log::warn!("Read of {} on {} failed: {}", id.characteristic, address, e);
                    GattCallback::CharacteristicRead {
                        characteristic: id,
                        value: Vec::new(),
                        status: GATT_FAILURE,
                    }
                }
            };
            emit(&callbacks, &address, callback);
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        characteristic: &CharacteristicId,
        value: &[u8],
    ) -> Result<(), GattError> {
        let peripheral = self.peripheral()?.clone();
        let target = self.characteristic(characteristic)?;
        let id = *characteristic;
        let value = value.to_vec();
        let address = self.address.clone();
        let callbacks = self.callbacks.clone();
        self.spawn(async move {
            let status = match peripheral.write(&target, &value, WriteType::WithResponse).await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    log::warn!("Write to {} on {} failed: {}", id.characteristic, address, e);
                    GATT_FAILURE
                }
            };
            emit(
                &callbacks,
                &address,
                GattCallback::CharacteristicWrite { characteristic: id, status },
            );
        });
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        descriptor: &DescriptorId,
        value: &[u8],
    ) -> Result<(), GattError> {
        let peripheral = self.peripheral()?.clone();
        let target = self.characteristic(&descriptor.characteristic)?;
        let id = *descriptor;
        let address = self.address.clone();
        let callbacks = self.callbacks.clone();

        if id.descriptor == CCCD_UUID {
            let enable = notifications_requested(value);
            self.spawn(async move {
                let result = if enable {
                    peripheral.subscribe(&target).await
                } else {
                    peripheral.unsubscribe(&target).await
                };
                let status = match result {
                    Ok(()) => GATT_SUCCESS,
                    Err(e) => {
                        log::warn!("Notification toggle on {} failed: {}", address, e);
                        GATT_FAILURE
                    }
                };
                let callback = GattCallback::DescriptorWrite { descriptor: id, status };
                emit(&callbacks, &address, callback);
            });
            return Ok(());
        }

        let target = target
            .descriptors
            .iter()
            .find(|d| d.uuid == id.descriptor)
            .cloned()
            .ok_or_else(|| GattError::AttributeNotFound(id.descriptor.to_string()))?;
        let value = value.to_vec();
        self.spawn(async move {
            let status = match peripheral.write_descriptor(&target, &value).await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    log::warn!("Descriptor write on {} failed: {}", address, e);
                    GATT_FAILURE
                }
            };
            emit(&callbacks, &address, GattCallback::DescriptorWrite { descriptor: id, status });
        });
        Ok(())
    }

    fn services(&self) -> Vec<GattService> {
        match &self.peripheral {
            Some(peripheral) => peripheral.services().iter().map(to_gatt_service).collect(),
            None => Vec::new(),
        }
    }
}

/// Forwards value notifications until aborted or the stream ends.
async fn forward_notifications(
    peripheral: Peripheral,
    address: DeviceAddress,
    callbacks: CallbackSender,
) {
    let mut stream = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("Notifications unavailable for {}: {}", address, e);
            return;
        }
    };
    while let Some(notification) = stream.next().await {
        let service = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == notification.uuid)
            .map(|c| c.service_uuid);
        match service {
            Some(service) => emit(
                &callbacks,
                &address,
                GattCallback::CharacteristicChanged {
                    characteristic: CharacteristicId::new(service, notification.uuid),
                    value: notification.value,
                },
            ),
            None => log::debug!("Notification from unknown characteristic {}", notification.uuid),
        }
    }
    log::debug!("Notification stream for {} ended", address);
}

fn emit(callbacks: &CallbackSender, address: &DeviceAddress, callback: GattCallback) {
    let event = GattEvent {
        address: address.clone(),
        callback,
    };
    if callbacks.send(event).is_err() {
        log::debug!("Callback for {} dropped, session manager gone", address);
    }
}

fn lock(links: &Links) -> std::sync::MutexGuard<'_, HashMap<PeripheralId, Link>> {
    links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Whether a CCCD value turns notifications or indications on.
fn notifications_requested(value: &[u8]) -> bool {
    value.first().map(|b| b & 0x03 != 0).unwrap_or(false)
}

fn to_gatt_service(service: &Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE};
    use crate::sensor::{HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};
    use btleplug::api::CharPropFlags;
    use std::collections::BTreeSet;

    async fn hold(marker: Arc<()>) {
        let _marker = marker;
        std::future::pending::<()>().await
    }

    /// Waits for an aborted task to drop its copy of `marker`.
    fn released(marker: &Arc<()>) -> bool {
        for _ in 0..200 {
            if Arc::strong_count(marker) == 1 {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_reconnect_leaves_one_forwarder() {
        let runtime = Runtime::new().unwrap();
        let notifications = NotificationTask::default();
        let first = Arc::new(());
        let second = Arc::new(());

        notifications.replace(runtime.spawn(hold(Arc::clone(&first))));
        notifications.replace(runtime.spawn(hold(Arc::clone(&second))));

        assert!(released(&first));
        assert_eq!(Arc::strong_count(&second), 2);
        assert!(notifications.is_running());
    }

    #[test]
    fn test_stop_aborts_forwarder() {
        let runtime = Runtime::new().unwrap();
        let notifications = NotificationTask::default();
        let marker = Arc::new(());

        notifications.replace(runtime.spawn(hold(Arc::clone(&marker))));
        notifications.stop();

        assert!(released(&marker));
        assert!(!notifications.is_running());
        // Stopping twice is harmless
        notifications.stop();
    }

    #[test]
    fn test_cccd_values() {
        assert!(notifications_requested(&ENABLE_NOTIFICATION_VALUE));
        assert!(notifications_requested(&[0x02, 0x00]));
        assert!(!notifications_requested(&DISABLE_NOTIFICATION_VALUE));
        assert!(!notifications_requested(&[]));
    }

    #[test]
    fn test_service_conversion() {
        let mut characteristics = BTreeSet::new();
        characteristics.insert(Characteristic {
            uuid: HEART_RATE_MEASUREMENT,
            service_uuid: HEART_RATE_SERVICE,
            properties: CharPropFlags::NOTIFY,
            descriptors: BTreeSet::new(),
        });
        let service = Service {
            uuid: HEART_RATE_SERVICE,
            primary: true,
            characteristics,
        };

        let converted = to_gatt_service(&service);
        assert_eq!(converted.uuid, HEART_RATE_SERVICE);
        assert_eq!(converted.characteristics, vec![HEART_RATE_MEASUREMENT]);
    }
}
