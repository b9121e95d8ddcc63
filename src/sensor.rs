//! # Sensor Decoding Module
//!
//! Maps GATT service UUIDs to decoders that turn raw characteristic payloads
//! into typed measurements.
//!
//! ## Key Types
//! - `SensorDecoder`: capability set shared by every supported sensor
//! - `SensorRegistry`: `service_uuid → decoder` lookup
//! - `HeartRateSensor`: Heart Rate Service (0x180D) measurement decoder
//! - `BatterySensor`: Battery Service (0x180F) level decoder
//!
//! ## Heart Rate Measurement Layout
//! ```text
//! byte 0      flags   bit 0: HR is u16 (else u8)
//!                     bit 3: energy expended (u16) present
//!                     bit 4: R-R intervals follow
//! byte 1..    HR value, energy expended, then u16 LE R-R values (1/1024 s)
//! ```
//!
//! Decoders do not timestamp. The session manager stamps each measurement
//! with the synchronized wall clock to form a `Sample`.

use crate::error::DecodeError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Expands a 16-bit SIG-assigned UUID onto the Bluetooth base UUID.
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

pub const HEART_RATE_SERVICE: Uuid = sig_uuid(0x180D);
pub const HEART_RATE_MEASUREMENT: Uuid = sig_uuid(0x2A37);
pub const HEART_RATE_CONTROL_POINT: Uuid = sig_uuid(0x2A39);
pub const BATTERY_SERVICE: Uuid = sig_uuid(0x180F);
pub const BATTERY_LEVEL: Uuid = sig_uuid(0x2A19);

const FLAG_HR_U16: u8 = 0x01;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_PRESENT: u8 = 0x10;

// Heart Rate Control Point opcode: reset energy expended
const RESET_ENERGY_EXPENDED: u8 = 0x01;

/// Decoded Heart Rate Measurement characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartRate {
    pub flags: u8,
    pub heart_rate_bpm: u16,
    pub energy_expended: Option<u16>,
    /// R-R intervals in 1/1024 s
    pub rr_intervals: Vec<u16>,
}

impl HeartRate {
    /// Parses a notification payload.
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        let flags = *payload
            .first()
            .ok_or(DecodeError::MalformedPayload { expected: 1, actual: 0 })?;

        let mut reader = Reader { payload, offset: 1 };
        let heart_rate_bpm = if flags & FLAG_HR_U16 != 0 {
            reader.u16()?
        } else {
            u16::from(reader.u8()?)
        };

        let energy_expended = if flags & FLAG_ENERGY_EXPENDED != 0 {
            Some(reader.u16()?)
        } else {
            None
        };

        let mut rr_intervals = Vec::new();
        if flags & FLAG_RR_PRESENT != 0 {
            let tail = reader.rest();
            if tail.len() % 2 != 0 {
                log::debug!("Ignoring trailing odd byte in R-R list");
            }
            rr_intervals.extend(
                tail.chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]])),
            );
        }

        Ok(Self {
            flags,
            heart_rate_bpm,
            energy_expended,
            rr_intervals,
        })
    }

    /// Serializes back to the wire layout described by `flags`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + 2 * self.rr_intervals.len());
        out.push(self.flags);
        if self.flags & FLAG_HR_U16 != 0 {
            out.extend_from_slice(&self.heart_rate_bpm.to_le_bytes());
        } else {
            out.push(self.heart_rate_bpm as u8);
        }
        if let Some(energy) = self.energy_expended {
            out.extend_from_slice(&energy.to_le_bytes());
        }
        if self.flags & FLAG_RR_PRESENT != 0 {
            for rr in &self.rr_intervals {
                out.extend_from_slice(&rr.to_le_bytes());
            }
        }
        out
    }
}

struct Reader<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let value = *self.payload.get(self.offset).ok_or(DecodeError::MalformedPayload {
            expected: self.offset + 1,
            actual: self.payload.len(),
        })?;
        self.offset += 1;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self
            .payload
            .get(self.offset..self.offset + 2)
            .ok_or(DecodeError::MalformedPayload {
                expected: self.offset + 2,
                actual: self.payload.len(),
            })?;
        self.offset += 2;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn rest(&self) -> &'a [u8] {
        &self.payload[self.offset.min(self.payload.len())..]
    }
}

/// Typed result of decoding one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Measurement {
    HeartRate(HeartRate),
    BatteryLevel(u8),
}

/// A measurement stamped with wall-clock milliseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub measurement: Measurement,
    pub wall_ms: i64,
}

impl Sample {
    pub fn heart_rate(&self) -> Option<&HeartRate> {
        match &self.measurement {
            Measurement::HeartRate(hr) => Some(hr),
            _ => None,
        }
    }
}

/// Characteristic write that reconfigures a sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWrite {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Capability set of a supported GATT sensor.
pub trait SensorDecoder: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn service_uuid(&self) -> Uuid;

    /// Characteristic carrying the notified data
    fn data_uuid(&self) -> Uuid;

    fn decode(&self, payload: &[u8]) -> Result<Measurement, DecodeError>;

    fn render(&self, sample: &Sample) -> String;

    /// Reconfiguration step run by `update_sensor`, if the sensor has one.
    fn update_write(&self) -> Option<ConfigWrite> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeartRateSensor;

impl SensorDecoder for HeartRateSensor {
    fn name(&self) -> &'static str {
        "Heart Rate"
    }

    fn service_uuid(&self) -> Uuid {
        HEART_RATE_SERVICE
    }

    fn data_uuid(&self) -> Uuid {
        HEART_RATE_MEASUREMENT
    }

    fn decode(&self, payload: &[u8]) -> Result<Measurement, DecodeError> {
        HeartRate::parse(payload).map(Measurement::HeartRate)
    }

    fn render(&self, sample: &Sample) -> String {
        match sample.heart_rate() {
            Some(hr) if hr.rr_intervals.is_empty() => format!("{} bpm", hr.heart_rate_bpm),
            Some(hr) => {
                let rr: Vec<String> = hr.rr_intervals.iter().map(|rr| rr.to_string()).collect();
                format!("{} bpm\nRR: {}", hr.heart_rate_bpm, rr.join(", "))
            }
            None => String::new(),
        }
    }

    fn update_write(&self) -> Option<ConfigWrite> {
        Some(ConfigWrite {
            characteristic: HEART_RATE_CONTROL_POINT,
            value: vec![RESET_ENERGY_EXPENDED],
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatterySensor;

impl SensorDecoder for BatterySensor {
    fn name(&self) -> &'static str {
        "Battery"
    }

    fn service_uuid(&self) -> Uuid {
        BATTERY_SERVICE
    }

    fn data_uuid(&self) -> Uuid {
        BATTERY_LEVEL
    }

    fn decode(&self, payload: &[u8]) -> Result<Measurement, DecodeError> {
        payload
            .first()
            .map(|level| Measurement::BatteryLevel(*level))
            .ok_or(DecodeError::MalformedPayload { expected: 1, actual: 0 })
    }

    fn render(&self, sample: &Sample) -> String {
        match sample.measurement {
            Measurement::BatteryLevel(level) => format!("{}%", level),
            _ => String::new(),
        }
    }
}

/// Lookup from service UUID to decoder.
#[derive(Debug, Default)]
pub struct SensorRegistry {
    decoders: HashMap<Uuid, Arc<dyn SensorDecoder>>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shipping the heart-rate and battery decoders.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HeartRateSensor));
        registry.register(Arc::new(BatterySensor));
        registry
    }

    pub fn register(&mut self, decoder: Arc<dyn SensorDecoder>) {
        self.decoders.insert(decoder.service_uuid(), decoder);
    }

    pub fn get(&self, service_uuid: &Uuid) -> Option<Arc<dyn SensorDecoder>> {
        self.decoders.get(service_uuid).cloned()
    }

    pub fn heart_rate(&self) -> Option<Arc<dyn SensorDecoder>> {
        self.get(&HEART_RATE_SERVICE)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_uuid_expansion() {
        assert_eq!(
            HEART_RATE_SERVICE.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            HEART_RATE_MEASUREMENT.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_u8_heart_rate_without_rr() {
        let hr = HeartRate::parse(&[0x00, 0x48]).unwrap();
        assert_eq!(hr.heart_rate_bpm, 72);
        assert!(hr.rr_intervals.is_empty());
    }

    #[test]
    fn test_u8_heart_rate_with_rr() {
        let hr = HeartRate::parse(&[0x10, 0x50, 0x00, 0x04, 0x00, 0x02]).unwrap();
        assert_eq!(hr.heart_rate_bpm, 80);
        assert_eq!(hr.rr_intervals, vec![1024, 512]);
    }

    #[test]
    fn test_u16_heart_rate() {
        let hr = HeartRate::parse(&[0x01, 0xC8, 0x00]).unwrap();
        assert_eq!(hr.heart_rate_bpm, 200);
        assert!(hr.rr_intervals.is_empty());
    }

    #[test]
    fn test_energy_expended_is_skipped() {
        let hr = HeartRate::parse(&[0x18, 0x3C, 0x10, 0x00, 0x00, 0x04]).unwrap();
        assert_eq!(hr.heart_rate_bpm, 60);
        assert_eq!(hr.energy_expended, Some(16));
        assert_eq!(hr.rr_intervals, vec![1024]);
    }

    #[test]
    fn test_malformed_payloads() {
        assert_eq!(
            HeartRate::parse(&[]),
            Err(DecodeError::MalformedPayload { expected: 1, actual: 0 })
        );
        assert_eq!(
            HeartRate::parse(&[0x00]),
            Err(DecodeError::MalformedPayload { expected: 2, actual: 1 })
        );
        assert_eq!(
            HeartRate::parse(&[0x01, 0xC8]),
            Err(DecodeError::MalformedPayload { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn test_round_trip_over_flag_combinations() {
        // Small LCG so the case set is fixed between runs
        let mut state: u32 = 0x2545_F491;
        let mut next = move || {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 16) as u8
        };

        for case in 0..512 {
            let wide = case & 1 != 0;
            let with_rr = case & 2 != 0;
            let width = if wide { FLAG_HR_U16 } else { 0 };
            let flags = width | if with_rr { FLAG_RR_PRESENT } else { 0 };

            let mut payload = vec![flags, next()];
            if wide {
                payload.push(next());
            }
            if with_rr {
                let pairs = next() % 6;
                for _ in 0..pairs {
                    payload.push(next());
                    payload.push(next());
                }
            }

            let decoded = HeartRate::parse(&payload).unwrap();
            assert_eq!(decoded.encode(), payload, "case {}", case);
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = SensorRegistry::with_defaults();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.heart_rate().unwrap().data_uuid(), HEART_RATE_MEASUREMENT);
        assert_eq!(registry.get(&BATTERY_SERVICE).unwrap().name(), "Battery");
        assert!(registry.get(&sig_uuid(0x1800)).is_none());
    }

    #[test]
    fn test_render_heart_rate() {
        let sensor = HeartRateSensor;
        let sample = Sample {
            measurement: sensor.decode(&[0x10, 0x50, 0x00, 0x04, 0x00, 0x02]).unwrap(),
            wall_ms: 0,
        };
        assert_eq!(sensor.render(&sample), "80 bpm\nRR: 1024, 512");
    }

    #[test]
    fn test_battery_decode() {
        let sensor = BatterySensor;
        assert_eq!(sensor.decode(&[87]), Ok(Measurement::BatteryLevel(87)));
        assert!(sensor.decode(&[]).is_err());
    }
}
