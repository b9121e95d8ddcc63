//! Scripted in-memory GATT stack for tests.
//!
//! Handles record every request they are asked to issue; tests inject stack
//! callbacks through the same channel the session manager listens on.

use crate::error::GattError;
use crate::gatt::{
    CallbackSender, CharacteristicId, DescriptorId, DeviceAddress, GattCallback, GattEvent,
    GattHandle, GattService, GattStack, ProfileState, RemoteDevice, GATT_SUCCESS,
};
use crate::sensor::{HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct LogInner {
    issued: Vec<String>,
    lifecycle: Vec<String>,
    reject: usize,
}

/// Shared record of what a handle was asked to do
#[derive(Clone, Default)]
pub(crate) struct MockLog {
    inner: Arc<Mutex<LogInner>>,
}

impl MockLog {
    pub(crate) fn issued(&self) -> Vec<String> {
        self.inner.lock().unwrap().issued.clone()
    }

    pub(crate) fn lifecycle(&self) -> Vec<String> {
        self.inner.lock().unwrap().lifecycle.clone()
    }

    /// Makes the next `count` requests fail to issue.
    pub(crate) fn reject_next(&self, count: usize) {
        self.inner.lock().unwrap().reject = count;
    }

    fn request(&self, entry: String) -> Result<(), GattError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.reject > 0 {
            inner.reject -= 1;
            return Err(GattError::Rejected(entry));
        }
        inner.issued.push(entry);
        Ok(())
    }

    fn lifecycle_event(&self, entry: &str) {
        self.inner.lock().unwrap().lifecycle.push(entry.to_string());
    }
}

pub(crate) struct MockHandle {
    log: MockLog,
}

impl MockHandle {
    /// Handle not attached to any stack.
    pub(crate) fn detached() -> (Self, MockLog) {
        let log = MockLog::default();
        (Self { log: log.clone() }, log)
    }
}

impl GattHandle for MockHandle {
    fn connect(&mut self) -> bool {
        self.log.lifecycle_event("connect");
        true
    }

    fn disconnect(&mut self) {
        self.log.lifecycle_event("disconnect");
    }

    fn close(&mut self) {
        self.log.lifecycle_event("close");
    }

    fn discover_services(&mut self) -> bool {
        self.log.lifecycle_event("discover_services");
        true
    }

    fn read_characteristic(&mut self, characteristic: &CharacteristicId) -> Result<(), GattError> {
        self.log.request(format!("read_characteristic {:?}", characteristic))
    }

    fn write_characteristic(
        &mut self,
        characteristic: &CharacteristicId,
        value: &[u8],
    ) -> Result<(), GattError> {
        self.log
            .request(format!("write_characteristic {:?} {:?}", characteristic, value))
    }

    fn write_descriptor(
        &mut self,
        descriptor: &DescriptorId,
        value: &[u8],
    ) -> Result<(), GattError> {
        self.log
            .request(format!("write_descriptor {:?} {:?}", descriptor.characteristic, value))
    }

    fn services(&self) -> Vec<GattService> {
        vec![GattService {
            uuid: HEART_RATE_SERVICE,
            characteristics: vec![HEART_RATE_MEASUREMENT],
        }]
    }
}

#[derive(Default)]
struct StackInner {
    adapter: bool,
    known: Vec<DeviceAddress>,
    callbacks: HashMap<DeviceAddress, CallbackSender>,
    logs: HashMap<DeviceAddress, MockLog>,
    connect_gatt_calls: usize,
}

/// Stack double; clones share state so a test can keep one after handing
/// the other to the manager.
#[derive(Clone, Default)]
pub(crate) struct MockStack {
    inner: Arc<Mutex<StackInner>>,
}

impl MockStack {
    pub(crate) fn new(adapter: bool) -> Self {
        let stack = Self::default();
        stack.inner.lock().unwrap().adapter = adapter;
        stack
    }

    pub(crate) fn with_device(self, address: &str) -> Self {
        let address = DeviceAddress::parse(address).unwrap();
        self.inner.lock().unwrap().known.push(address);
        self
    }

    pub(crate) fn log(&self, address: &str) -> MockLog {
        let address = DeviceAddress::parse(address).unwrap();
        self.inner.lock().unwrap().logs.get(&address).cloned().unwrap_or_default()
    }

    pub(crate) fn connect_gatt_calls(&self) -> usize {
        self.inner.lock().unwrap().connect_gatt_calls
    }

    /// Delivers a callback as the stack would, from its own context.
    pub(crate) fn emit(&self, address: &str, callback: GattCallback) {
        let address = DeviceAddress::parse(address).unwrap();
        let sender = self.inner.lock().unwrap().callbacks.get(&address).cloned();
        if let Some(sender) = sender {
            sender.send(GattEvent { address, callback }).unwrap();
        }
    }

    pub(crate) fn set_state(&self, address: &str, new_state: ProfileState) {
        self.emit(
            address,
            GattCallback::ConnectionStateChange { status: GATT_SUCCESS, new_state },
        );
    }

    pub(crate) fn notify(&self, address: &str, value: &[u8]) {
        self.emit(
            address,
            GattCallback::CharacteristicChanged {
                characteristic: CharacteristicId::new(HEART_RATE_SERVICE, HEART_RATE_MEASUREMENT),
                value: value.to_vec(),
            },
        );
    }
}

impl GattStack for MockStack {
    fn acquire_adapter(&mut self) -> bool {
        self.inner.lock().unwrap().adapter
    }

    fn remote_device(&mut self, address: &DeviceAddress) -> Option<RemoteDevice> {
        let inner = self.inner.lock().unwrap();
        inner.known.contains(address).then(|| RemoteDevice {
            address: address.clone(),
            name: Some("Mock HR".to_string()),
        })
    }

    fn connect_gatt(
        &mut self,
        device: &RemoteDevice,
        _auto_connect: bool,
        callbacks: CallbackSender,
    ) -> Box<dyn GattHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.connect_gatt_calls += 1;
        inner.callbacks.insert(device.address.clone(), callbacks);
        let log = MockLog::default();
        inner.logs.insert(device.address.clone(), log.clone());
        Box::new(MockHandle { log })
    }
}
