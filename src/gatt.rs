//! # GATT Abstraction Module
//!
//! The seam between the session manager and a platform BLE stack, plus the
//! per-connection operation executor.
//!
//! ## Key Components
//! - `GattStack` / `GattHandle`: what the manager needs from a platform stack
//! - `GattEvent`: stack callbacks delivered as messages over a channel
//! - `GattExecutor`: queue that keeps at most one GATT request outstanding
//!
//! ## Executor State Machine
//! ```text
//! Idle ──issue──▶ Issuing ──accepted──▶ AwaitingAck ──completion──▶ Idle
//!                    └──rejected──▶ next request (or Idle)
//! ```
//! There is no timeout. A disconnect drops the queue and releases the wait.

use crate::error::GattError;
use crate::sensor::{sig_uuid, SensorDecoder};
use crossbeam_channel::Sender;
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// Only status value treated as success
pub const GATT_SUCCESS: i32 = 0;
pub const GATT_FAILURE: i32 = 0x101;

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = sig_uuid(0x2902);
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Canonical `XX:XX:XX:XX:XX:XX` device address (uppercase hex)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Accepts six colon-separated hex bytes in either case.
    pub fn parse(address: &str) -> Option<Self> {
        let parts: Vec<&str> = address.trim().split(':').collect();
        let valid = parts.len() == 6
            && parts
                .iter()
                .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()));
        if valid {
            Some(Self(parts.join(":").to_ascii_uppercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address with separators removed, as used in log file names.
    pub fn without_colons(&self) -> String {
        self.0.replace(':', "")
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Link state reported by the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self { service, characteristic }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId {
    pub characteristic: CharacteristicId,
    pub descriptor: Uuid,
}

/// A discovered service and the UUIDs of its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Remote peripheral resolved from an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    pub address: DeviceAddress,
    pub name: Option<String>,
}

/// Callback surface of the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCallback {
    ConnectionStateChange { status: i32, new_state: ProfileState },
    ServicesDiscovered { status: i32 },
    CharacteristicRead { characteristic: CharacteristicId, value: Vec<u8>, status: i32 },
    CharacteristicChanged { characteristic: CharacteristicId, value: Vec<u8> },
    CharacteristicWrite { characteristic: CharacteristicId, status: i32 },
    DescriptorWrite { descriptor: DescriptorId, status: i32 },
}

/// A callback tagged with the connection it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattEvent {
    pub address: DeviceAddress,
    pub callback: GattCallback,
}

pub type CallbackSender = Sender<GattEvent>;

/// Platform BLE provider.
pub trait GattStack: Send {
    /// Acquires the local adapter. Returns false if none is available.
    fn acquire_adapter(&mut self) -> bool;

    fn remote_device(&mut self, address: &DeviceAddress) -> Option<RemoteDevice>;

    /// Opens a connection. Results arrive on `callbacks`.
    fn connect_gatt(
        &mut self,
        device: &RemoteDevice,
        auto_connect: bool,
        callbacks: CallbackSender,
    ) -> Box<dyn GattHandle>;
}

/// One GATT connection. Every request completes through a `GattCallback`.
pub trait GattHandle: Send {
    /// Reconnects a previously opened connection.
    fn connect(&mut self) -> bool;

    fn disconnect(&mut self);

    fn close(&mut self);

    fn discover_services(&mut self) -> bool;

    fn read_characteristic(&mut self, characteristic: &CharacteristicId) -> Result<(), GattError>;

    fn write_characteristic(
        &mut self,
        characteristic: &CharacteristicId,
        value: &[u8],
    ) -> Result<(), GattError>;

    fn write_descriptor(
        &mut self,
        descriptor: &DescriptorId,
        value: &[u8],
    ) -> Result<(), GattError>;

    fn services(&self) -> Vec<GattService>;
}

/// A queued GATT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattRequest {
    SetNotification { characteristic: CharacteristicId, enable: bool },
    Read(CharacteristicId),
    Write { characteristic: CharacteristicId, value: Vec<u8> },
}

impl GattRequest {
    fn issue(&self, handle: &mut dyn GattHandle) -> Result<(), GattError> {
        match self {
            GattRequest::SetNotification { characteristic, enable } => {
                let descriptor = DescriptorId {
                    characteristic: *characteristic,
                    descriptor: CCCD_UUID,
                };
                let value = if *enable {
                    ENABLE_NOTIFICATION_VALUE
                } else {
                    DISABLE_NOTIFICATION_VALUE
                };
                handle.write_descriptor(&descriptor, &value)
            }
            GattRequest::Read(characteristic) => handle.read_characteristic(characteristic),
            GattRequest::Write { characteristic, value } => {
                handle.write_characteristic(characteristic, value)
            }
        }
    }

    /// Whether `callback` is the completion of this request.
    fn completed_by(&self, callback: &GattCallback) -> bool {
        match (self, callback) {
            (
                GattRequest::SetNotification { characteristic, .. },
                GattCallback::DescriptorWrite { descriptor, .. },
            ) => descriptor.characteristic == *characteristic && descriptor.descriptor == CCCD_UUID,
            (
                GattRequest::Read(expected),
                GattCallback::CharacteristicRead { characteristic, .. },
            ) => characteristic == expected,
            (
                GattRequest::Write { characteristic: expected, .. },
                GattCallback::CharacteristicWrite { characteristic, .. },
            ) => characteristic == expected,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Issuing,
    AwaitingAck,
}

/// Serializes GATT requests against one connection.
#[derive(Debug)]
pub struct GattExecutor {
    queue: VecDeque<GattRequest>,
    in_flight: Option<GattRequest>,
    state: ExecutorState,
}

impl Default for GattExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl GattExecutor {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: None,
            state: ExecutorState::Idle,
        }
    }

    /// Queues a CCCD write turning notifications of the decoder's data characteristic on or off.
    pub fn enable(&mut self, decoder: &dyn SensorDecoder, on: bool) {
        self.queue.push_back(GattRequest::SetNotification {
            characteristic: CharacteristicId::new(decoder.service_uuid(), decoder.data_uuid()),
            enable: on,
        });
    }

    pub fn read(&mut self, characteristic: CharacteristicId) {
        self.queue.push_back(GattRequest::Read(characteristic));
    }

    /// Queues the decoder's reconfiguration write, if it defines one.
    pub fn update(&mut self, decoder: &dyn SensorDecoder) {
        if let Some(write) = decoder.update_write() {
            self.queue.push_back(GattRequest::Write {
                characteristic: CharacteristicId::new(decoder.service_uuid(), write.characteristic),
                value: write.value,
            });
        }
    }

    /// Starts draining the queue against `handle` if nothing is outstanding.
    pub fn execute(&mut self, handle: &mut dyn GattHandle) {
        if self.state == ExecutorState::Idle {
            self.issue_next(handle);
        }
    }

    /// Feeds a stack callback to the executor.
    ///
    /// Returns true if it completed the outstanding request, in which case the
    /// next queued request has already been issued.
    pub fn on_callback(&mut self, callback: &GattCallback, handle: &mut dyn GattHandle) -> bool {
        let matched = self
            .in_flight
            .as_ref()
            .map(|request| request.completed_by(callback))
            .unwrap_or(false);
        if !matched {
            return false;
        }

        self.in_flight = None;
        self.state = ExecutorState::Idle;
        self.issue_next(handle);
        true
    }

    /// Drops every queued and outstanding request.
    pub fn reset(&mut self) {
        if !self.queue.is_empty() || self.in_flight.is_some() {
            log::debug!("Dropping {} queued GATT requests", self.pending());
        }
        self.queue.clear();
        self.in_flight = None;
        self.state = ExecutorState::Idle;
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn in_flight(&self) -> Option<&GattRequest> {
        self.in_flight.as_ref()
    }

    /// Queued plus outstanding requests
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    fn issue_next(&mut self, handle: &mut dyn GattHandle) {
        while let Some(request) = self.queue.pop_front() {
            self.state = ExecutorState::Issuing;
            match request.issue(handle) {
                Ok(()) => {
                    log::debug!("Issued GATT request {:?}", request);
                    self.in_flight = Some(request);
                    self.state = ExecutorState::AwaitingAck;
                    return;
                }
                Err(e) => {
                    log::warn!("GATT request {:?} not issued: {}", request, e);
                }
            }
        }
        self.state = ExecutorState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHandle;
    use crate::sensor::{HeartRateSensor, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};

    fn hr_char() -> CharacteristicId {
        CharacteristicId::new(HEART_RATE_SERVICE, HEART_RATE_MEASUREMENT)
    }

    fn cccd_ack(status: i32) -> GattCallback {
        GattCallback::DescriptorWrite {
            descriptor: DescriptorId { characteristic: hr_char(), descriptor: CCCD_UUID },
            status,
        }
    }

    #[test]
    fn test_address_parsing() {
        let address = DeviceAddress::parse("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(address.as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(address.without_colons(), "AABBCCDDEEFF");
        assert!(DeviceAddress::parse("AA:BB:CC").is_none());
        assert!(DeviceAddress::parse("AA:BB:CC:DD:EE:GG").is_none());
        assert!(DeviceAddress::parse("").is_none());
    }

    #[test]
    fn test_enable_writes_cccd() {
        let (mut handle, log) = MockHandle::detached();
        let mut executor = GattExecutor::new();

        executor.enable(&HeartRateSensor, true);
        executor.execute(&mut handle);

        assert_eq!(executor.state(), ExecutorState::AwaitingAck);
        assert_eq!(log.issued(), vec![format!("write_descriptor {:?} [1, 0]", hr_char())]);
    }

    #[test]
    fn test_next_request_waits_for_ack() {
        let (mut handle, log) = MockHandle::detached();
        let mut executor = GattExecutor::new();

        executor.enable(&HeartRateSensor, true);
        executor.read(hr_char());
        executor.update(&HeartRateSensor);
        executor.execute(&mut handle);
        executor.execute(&mut handle);
        assert_eq!(log.issued().len(), 1);

        // Unrelated callback does not release the wait
        assert!(!executor.on_callback(
            &GattCallback::CharacteristicChanged { characteristic: hr_char(), value: vec![0, 60] },
            &mut handle
        ));
        assert_eq!(log.issued().len(), 1);

        // Failure status still completes the request
        assert!(executor.on_callback(&cccd_ack(GATT_FAILURE), &mut handle));
        assert_eq!(log.issued().len(), 2);
        assert_eq!(executor.in_flight(), Some(&GattRequest::Read(hr_char())));

        assert!(executor.on_callback(
            &GattCallback::CharacteristicRead {
                characteristic: hr_char(),
                value: vec![],
                status: GATT_SUCCESS,
            },
            &mut handle
        ));
        assert_eq!(log.issued().len(), 3);
        assert!(log.issued()[2].starts_with("write_characteristic"));
    }

    #[test]
    fn test_rejected_request_is_skipped() {
        let (mut handle, log) = MockHandle::detached();
        log.reject_next(1);
        let mut executor = GattExecutor::new();

        executor.enable(&HeartRateSensor, true);
        executor.read(hr_char());
        executor.execute(&mut handle);

        assert_eq!(executor.in_flight(), Some(&GattRequest::Read(hr_char())));
        assert_eq!(executor.pending(), 1);
    }

    #[test]
    fn test_reset_drops_queue() {
        let (mut handle, _log) = MockHandle::detached();
        let mut executor = GattExecutor::new();

        executor.enable(&HeartRateSensor, true);
        executor.enable(&HeartRateSensor, false);
        executor.execute(&mut handle);
        executor.reset();

        assert_eq!(executor.state(), ExecutorState::Idle);
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn test_at_most_one_outstanding_under_interleaving() {
        let (mut handle, log) = MockHandle::detached();
        let mut executor = GattExecutor::new();
        let mut state: u32 = 7;
        let mut acked = 0;

        for _ in 0..2_000 {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            match state >> 30 {
                0 => executor.enable(&HeartRateSensor, state & 1 == 0),
                1 => executor.read(hr_char()),
                2 => executor.execute(&mut handle),
                _ => {
                    let ack = match executor.in_flight() {
                        Some(GattRequest::SetNotification { .. }) => Some(cccd_ack(GATT_SUCCESS)),
                        Some(GattRequest::Read(c)) => Some(GattCallback::CharacteristicRead {
                            characteristic: *c,
                            value: vec![],
                            status: GATT_SUCCESS,
                        }),
                        _ => None,
                    };
                    if let Some(ack) = ack {
                        assert!(executor.on_callback(&ack, &mut handle));
                        acked += 1;
                    }
                }
            }

            let outstanding = log.issued().len() - acked;
            assert!(outstanding <= 1, "{} requests outstanding", outstanding);
            assert_eq!(outstanding == 1, executor.state() == ExecutorState::AwaitingAck);
        }
    }
}
