//! # Event Bus Module
//!
//! Broadcasts session events to any number of subscribers.
//!
//! Each subscriber owns the receiving end of its own unbounded channel. The
//! bus keeps only the sending ends and prunes them once the receiver is
//! dropped, so subscribers come and go without the publisher noticing.
//! Events are delivered in publication order and never redelivered.

use crate::gatt::DeviceAddress;
use crate::sensor::Sample;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Mutex;
use uuid::Uuid;

pub const ACTION_GATT_CONNECTED: &str = "hrv_logger.ACTION_GATT_CONNECTED";
pub const ACTION_GATT_DISCONNECTED: &str = "hrv_logger.ACTION_GATT_DISCONNECTED";
pub const ACTION_GATT_SERVICES_DISCOVERED: &str = "hrv_logger.ACTION_GATT_SERVICES_DISCOVERED";
pub const ACTION_DATA_AVAILABLE: &str = "hrv_logger.ACTION_DATA_AVAILABLE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected {
        address: DeviceAddress,
    },
    Disconnected {
        address: DeviceAddress,
    },
    ServicesDiscovered {
        address: DeviceAddress,
    },
    DataAvailable {
        address: DeviceAddress,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        text: String,
        /// Present when a registered decoder handled the payload
        sample: Option<Sample>,
    },
}

impl Event {
    /// Stable, namespaced action name
    pub fn action(&self) -> &'static str {
        match self {
            Event::Connected { .. } => ACTION_GATT_CONNECTED,
            Event::Disconnected { .. } => ACTION_GATT_DISCONNECTED,
            Event::ServicesDiscovered { .. } => ACTION_GATT_SERVICES_DISCOVERED,
            Event::DataAvailable { .. } => ACTION_DATA_AVAILABLE,
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        match self {
            Event::Connected { address }
            | Event::Disconnected { address }
            | Event::ServicesDiscovered { address }
            | Event::DataAvailable { address, .. } => address,
        }
    }
}

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (sender, receiver) = unbounded();
        self.lock().push(sender);
        receiver
    }

    pub fn publish(&self, event: Event) {
        log::debug!("{} from {}", event.action(), event.address());
        self.lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<Event>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> DeviceAddress {
        DeviceAddress::parse("AA:BB:CC:DD:EE:FF").unwrap()
    }

    #[test]
    fn test_events_arrive_in_order() {
        let bus = EventBus::new();
        let receiver = bus.subscribe();

        bus.publish(Event::Connected { address: address() });
        bus.publish(Event::ServicesDiscovered { address: address() });
        bus.publish(Event::Disconnected { address: address() });

        let actions: Vec<&str> = receiver.try_iter().map(|e| e.action()).collect();
        assert_eq!(
            actions,
            vec![ACTION_GATT_CONNECTED, ACTION_GATT_SERVICES_DISCOVERED, ACTION_GATT_DISCONNECTED]
        );
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        let dropped = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(dropped);
        bus.publish(Event::Connected { address: address() });

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_iter().count(), 1);
    }

    #[test]
    fn test_late_subscriber_sees_no_history() {
        let bus = EventBus::new();
        bus.publish(Event::Connected { address: address() });
        let late = bus.subscribe();
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn test_action_names_share_prefix() {
        let event = Event::Disconnected { address: address() };
        assert!(event.action().starts_with("hrv_logger."));
        assert_eq!(event.address().as_str(), "AA:BB:CC:DD:EE:FF");
    }
}
