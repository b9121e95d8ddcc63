//! # Session Management Module
//!
//! Tracks every GATT connection by device address and routes stack callbacks
//! to decoding, event publication and storage.
//!
//! ## Key Components
//! - `SessionManager`: registry of sessions and the host-facing API
//! - `Session`: one connection with its handle, executor and state
//! - `ConnectionState`: per-session state, aggregated on demand
//!
//! ## Execution Model
//! Stack callbacks arrive as `GattEvent` messages on a channel. Whoever owns the
//! manager feeds them to `handle_event` (or drains them with `pump`), so
//! callback handling and host commands never run concurrently on the session
//! map. File I/O happens on the storage thread, the NTP query on its own
//! thread; neither blocks the manager.

use crate::clock::{ClockOffset, NtpClient, SntpClient};
use crate::config::Config;
use crate::error::SessionError;
use crate::events::{Event, EventBus};
use crate::gatt::{
    CallbackSender, CharacteristicId, DeviceAddress, GattCallback, GattEvent, GattExecutor,
    GattHandle, GattService, GattStack, ProfileState, GATT_SUCCESS,
};
use crate::sensor::{Measurement, Sample, SensorDecoder, SensorRegistry};
use crate::storage::{LogIndexer, MediaIndexer, StorageCommand, StorageContext};
use crossbeam_channel::{unbounded, Receiver};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Connection state, ordered so the aggregate is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One logical connection to one peripheral
pub struct Session {
    address: DeviceAddress,
    handle: Box<dyn GattHandle>,
    executor: GattExecutor,
    state: ConnectionState,
    /// An `Open` was posted and its `Close` is still owed
    storage_open: bool,
    /// Characteristics with notifications requested on this link
    notifying: HashSet<CharacteristicId>,
}

impl Session {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn executor(&self) -> &GattExecutor {
        &self.executor
    }
}

pub struct SessionManager {
    stack: Box<dyn GattStack>,
    adapter_ready: bool,
    sessions: BTreeMap<DeviceAddress, Session>,
    registry: Arc<SensorRegistry>,
    clock: Arc<ClockOffset>,
    ntp_client: Arc<dyn NtpClient>,
    ntp_host: String,
    ntp_timeout_ms: u32,
    ntp_thread: Option<JoinHandle<()>>,
    bus: Arc<EventBus>,
    storage: Option<StorageContext>,
    storage_root: PathBuf,
    indexer: Option<Box<dyn MediaIndexer>>,
    store_data: bool,
    /// Last transition seen on any session
    legacy_state: ConnectionState,
    callback_tx: CallbackSender,
    callback_rx: Receiver<GattEvent>,
}

impl SessionManager {
    pub fn new(stack: Box<dyn GattStack>, config: &Config) -> Self {
        let (callback_tx, callback_rx) = unbounded();
        Self {
            stack,
            adapter_ready: false,
            sessions: BTreeMap::new(),
            registry: Arc::new(SensorRegistry::with_defaults()),
            clock: Arc::new(ClockOffset::system()),
            ntp_client: Arc::new(SntpClient::new()),
            ntp_host: config.ntp_host.clone(),
            ntp_timeout_ms: config.ntp_timeout_ms,
            ntp_thread: None,
            bus: Arc::new(EventBus::new()),
            storage: None,
            storage_root: config.storage_root(),
            indexer: Some(Box::new(LogIndexer)),
            store_data: config.store_data,
            legacy_state: ConnectionState::Disconnected,
            callback_tx,
            callback_rx,
        }
    }

    pub fn with_registry(mut self, registry: Arc<SensorRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<ClockOffset>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ntp_client(mut self, client: Arc<dyn NtpClient>) -> Self {
        self.ntp_client = client;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Replaces the indexer told about finished files. Takes effect at `initialize`.
    pub fn with_media_indexer(mut self, indexer: Box<dyn MediaIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn registry(&self) -> &Arc<SensorRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<ClockOffset> {
        &self.clock
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Receiving end of the stack callback channel.
    pub fn callback_receiver(&self) -> Receiver<GattEvent> {
        self.callback_rx.clone()
    }

    /// Acquires the adapter, starts the storage thread and the NTP bootstrap.
    ///
    /// Idempotent. Returns false if no adapter is available.
    pub fn initialize(&mut self) -> bool {
        if !self.adapter_ready {
            if !self.stack.acquire_adapter() {
                log::error!("{}", SessionError::AdapterUnavailable);
                return false;
            }
            self.adapter_ready = true;
        }

        if self.storage.is_none() {
            if let Some(indexer) = self.indexer.take() {
                match StorageContext::start(self.storage_root.clone(), indexer) {
                    Ok(storage) => self.storage = Some(storage),
                    Err(e) => log::error!("{}", e),
                }
            }
        }

        if self.ntp_thread.is_none() && !self.clock.is_synchronized() {
            self.ntp_thread = self.clock.bootstrap(
                Arc::clone(&self.ntp_client),
                self.ntp_host.clone(),
                self.ntp_timeout_ms,
            );
        }

        true
    }

    /// Connects to `address`, reusing the cached handle of a known session.
    ///
    /// The outcome arrives later as a callback; false means the attempt could
    /// not even be started.
    pub fn connect(&mut self, address: &str) -> bool {
        match self.try_connect(address) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}", e);
                false
            }
        }
    }

    pub fn try_connect(&mut self, address: &str) -> Result<(), SessionError> {
        if !self.adapter_ready {
            return Err(SessionError::AdapterUnavailable);
        }
        let address = DeviceAddress::parse(address)
            .ok_or_else(|| SessionError::UnknownDevice(address.to_string()))?;

        if let Some(session) = self.sessions.get_mut(&address) {
            log::debug!("Trying to use an existing connection for {}", address);
            if !session.handle.connect() {
                return Err(SessionError::ReconnectRejected(address.to_string()));
            }
            session.state = ConnectionState::Connecting;
            self.legacy_state = ConnectionState::Connecting;
            return Ok(());
        }

        let device = self
            .stack
            .remote_device(&address)
            .ok_or_else(|| SessionError::UnknownDevice(address.to_string()))?;

        log::debug!("Trying to create a new connection to {}", address);
        let handle = self.stack.connect_gatt(&device, false, self.callback_tx.clone());
        self.sessions.insert(
            address.clone(),
            Session {
                address,
                handle,
                executor: GattExecutor::new(),
                state: ConnectionState::Connecting,
                storage_open: false,
                notifying: HashSet::new(),
            },
        );
        self.legacy_state = ConnectionState::Connecting;
        Ok(())
    }

    /// Requests disconnect on every session. Sessions stay cached for reconnect.
    pub fn disconnect(&mut self) {
        if !self.has_sessions("disconnect") {
            return;
        }
        for session in self.sessions.values_mut() {
            session.handle.disconnect();
        }
    }

    /// Closes every handle and forgets every session.
    pub fn close(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        for (address, mut session) in std::mem::take(&mut self.sessions) {
            if session.storage_open {
                if let Some(storage) = &self.storage {
                    storage.post(&address, StorageCommand::Close);
                }
            }
            session.handle.close();
        }
    }

    /// Turns the decoder's notifications on or off on every live session.
    ///
    /// Sessions already in the requested state are skipped, so enabling again
    /// when another device comes up costs no GATT traffic on the others.
    pub fn enable_sensor(&mut self, decoder: &dyn SensorDecoder, on: bool) {
        if !self.has_sessions("enable sensor") {
            return;
        }
        log::debug!("Number of devices connected: {}", self.sessions.len());
        let characteristic = CharacteristicId::new(decoder.service_uuid(), decoder.data_uuid());
        let verb = if on { "Enabling" } else { "Disabling" };
        for session in self.live_sessions() {
            if session.notifying.contains(&characteristic) == on {
                continue;
            }
            log::debug!("{} {} for {}", verb, decoder.name(), session.address);
            if on {
                session.notifying.insert(characteristic);
            } else {
                session.notifying.remove(&characteristic);
            }
            session.executor.enable(decoder, on);
            Self::drain(session);
        }
    }

    pub fn read_characteristic(&mut self, characteristic: CharacteristicId) {
        if !self.has_sessions("read characteristic") {
            return;
        }
        for session in self.live_sessions() {
            session.executor.read(characteristic);
            Self::drain(session);
        }
    }

    pub fn update_sensor(&mut self, decoder: &dyn SensorDecoder) {
        if !self.has_sessions("update sensor") {
            return;
        }
        for session in self.live_sessions() {
            session.executor.update(decoder);
            Self::drain(session);
        }
    }

    /// Services of one connected session, or any session if none is connected.
    pub fn supported_services(&self) -> Option<Vec<GattService>> {
        self.sessions
            .values()
            .find(|s| s.state == ConnectionState::Connected)
            .or_else(|| self.sessions.values().next())
            .map(|s| s.handle.services())
    }

    pub fn set_logging(&mut self, on: bool) {
        self.store_data = on;
    }

    pub fn is_logging(&self) -> bool {
        self.store_data
    }

    pub fn session(&self, address: &str) -> Option<&Session> {
        DeviceAddress::parse(address).and_then(|a| self.sessions.get(&a))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Maximum state over all sessions
    pub fn connection_state(&self) -> ConnectionState {
        self.sessions
            .values()
            .map(|s| s.state)
            .max()
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Single process-wide state, last transition wins
    pub fn legacy_connection_state(&self) -> ConnectionState {
        self.legacy_state
    }

    /// Handles every callback already queued. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.callback_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Blocks until everything posted to storage so far is on disk.
    pub fn sync_storage(&self) {
        if let Some(storage) = &self.storage {
            storage.sync();
        }
    }

    /// Routes one stack callback.
    pub fn handle_event(&mut self, event: GattEvent) {
        let GattEvent { address, callback } = event;
        let Some(session) = self.sessions.get_mut(&address) else {
            log::debug!("Callback for unknown session {}: {:?}", address, callback);
            return;
        };

        match &callback {
            GattCallback::ConnectionStateChange { status, new_state } => {
                if *status != GATT_SUCCESS {
                    log::warn!("Connection state change for {} with status {}", address, status);
                }
                match new_state {
                    ProfileState::Connected => {
                        session.state = ConnectionState::Connected;
                        self.legacy_state = ConnectionState::Connected;
                        log::info!("Connected to GATT server {}", address);
                        self.bus.publish(Event::Connected { address: address.clone() });

                        let discovering = session.handle.discover_services();
                        log::info!("Attempting to start service discovery: {}", discovering);

                        if self.store_data {
                            if let Some(storage) = &self.storage {
                                storage.post(&address, StorageCommand::Open);
                                session.storage_open = true;
                            }
                        }
                    }
                    ProfileState::Disconnected => {
                        session.state = ConnectionState::Disconnected;
                        session.executor.reset();
                        session.notifying.clear();
                        self.legacy_state = ConnectionState::Disconnected;
                        log::info!("Disconnected from GATT server {}", address);
                        self.bus.publish(Event::Disconnected { address: address.clone() });

                        if session.storage_open {
                            if let Some(storage) = &self.storage {
                                storage.post(&address, StorageCommand::Close);
                            }
                            session.storage_open = false;
                        }
                    }
                    ProfileState::Connecting => {
                        session.state = ConnectionState::Connecting;
                        self.legacy_state = ConnectionState::Connecting;
                    }
                    ProfileState::Disconnecting => {
                        log::debug!("{} disconnecting", address);
                    }
                }
            }
            GattCallback::ServicesDiscovered { status } => {
                if *status == GATT_SUCCESS {
                    self.bus.publish(Event::ServicesDiscovered { address: address.clone() });
                    // Requests queued while the link came up
                    Self::drain(session);
                } else {
                    log::warn!("Service discovery on {} failed with status {}", address, status);
                }
            }
            GattCallback::CharacteristicRead { characteristic, value, status } => {
                session.executor.on_callback(&callback, session.handle.as_mut());
                if *status == GATT_SUCCESS {
                    self.deliver(&address, *characteristic, value);
                } else {
                    log::warn!(
                        "Read of {:?} on {} failed with status {}",
                        characteristic,
                        address,
                        status
                    );
                }
            }
            GattCallback::CharacteristicChanged { characteristic, value } => {
                self.deliver(&address, *characteristic, value);
            }
            GattCallback::CharacteristicWrite { status, .. }
            | GattCallback::DescriptorWrite { status, .. } => {
                if *status != GATT_SUCCESS {
                    log::warn!("Write on {} completed with status {}", address, status);
                }
                session.executor.on_callback(&callback, session.handle.as_mut());
            }
        }
    }

    /// Decodes, publishes and stores one characteristic value.
    fn deliver(&mut self, address: &DeviceAddress, characteristic: CharacteristicId, value: &[u8]) {
        let Some(decoder) = self.registry.get(&characteristic.service) else {
            self.bus.publish(Event::DataAvailable {
                address: address.clone(),
                service_uuid: characteristic.service,
                characteristic_uuid: characteristic.characteristic,
                text: raw_text(value),
                sample: None,
            });
            return;
        };

        let wall_ms = self.clock.now_wall_ms();
        let measurement = match decoder.decode(value) {
            Ok(measurement) => measurement,
            Err(e) => {
                log::warn!("Dropping {} notification from {}: {}", decoder.name(), address, e);
                return;
            }
        };
        let sample = Sample { measurement, wall_ms };
        let text = decoder.render(&sample);
        log::debug!("{}: {}", address, text);

        let store = self.store_data
            && self
                .sessions
                .get(address)
                .map(|s| s.storage_open)
                .unwrap_or(false);
        let write = match (&sample.measurement, store) {
            (Measurement::HeartRate(hr), true) => Some(StorageCommand::Write {
                heart_rate: hr.heart_rate_bpm,
                rr_intervals: hr.rr_intervals.clone(),
                wall_ms,
            }),
            _ => None,
        };

        self.bus.publish(Event::DataAvailable {
            address: address.clone(),
            service_uuid: characteristic.service,
            characteristic_uuid: characteristic.characteristic,
            text,
            sample: Some(sample),
        });

        if let (Some(command), Some(storage)) = (write, &self.storage) {
            log::debug!("Writing from device: {}", address);
            storage.post(address, command);
        }
    }

    /// Process-level teardown: close logs, drop connections, stop threads.
    pub fn shutdown(&mut self) {
        if let Some(storage) = &self.storage {
            for (address, session) in self.sessions.iter_mut() {
                if session.storage_open {
                    storage.post(address, StorageCommand::Close);
                    session.storage_open = false;
                }
            }
        }

        for session in self.sessions.values_mut() {
            session.handle.disconnect();
        }
        self.close();

        if let Some(mut storage) = self.storage.take() {
            storage.shutdown();
        }

        if let Some(handle) = self.ntp_thread.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::debug!("NTP request still running, detaching");
            }
        }

        log::debug!("Session manager stopped");
    }

    fn has_sessions(&self, operation: &str) -> bool {
        if !self.adapter_ready || self.sessions.is_empty() {
            log::warn!("Cannot {}: Bluetooth adapter not initialized or no sessions", operation);
            return false;
        }
        true
    }

    fn live_sessions(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions
            .values_mut()
            .filter(|s| s.state != ConnectionState::Disconnected)
    }

    /// Issues queued requests only once the link is up.
    fn drain(session: &mut Session) {
        if session.state == ConnectionState::Connected {
            session.executor.execute(session.handle.as_mut());
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Text for values without a decoder: the raw bytes as text, a newline, then
/// uppercase hex separated by single spaces.
fn raw_text(value: &[u8]) -> String {
    if value.is_empty() {
        return String::new();
    }
    let hex: Vec<String> = value.iter().map(|b| format!("{:02X}", b)).collect();
    format!("{}\n{}", String::from_utf8_lossy(value), hex.join(" "))
}
