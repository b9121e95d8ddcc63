//! # Error Types Module
//!
//! Centralized error handling for the HRV logger.
//! Provides custom error types for each module with proper context and error chaining.
//!
//! ## Error Types
//! - `SessionError`: adapter and device resolution failures surfaced to the host
//! - `GattError`: a GATT request the stack refused to issue
//! - `DecodeError`: a sensor decoder rejected a notification payload
//! - `StorageError`: CSV file I/O failures on the storage thread
//! - `ClockError`: NTP bootstrap failures
//! - `ConfigError`: configuration file I/O and parsing errors
//!
//! ## Recovery Policy
//! Only `SessionError` ever reaches the caller. Everything else is logged where
//! it happens and the offending sample, write or request is dropped.

use std::fmt;
use std::io;

/// Errors surfaced by `SessionManager::initialize` / `SessionManager::try_connect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// BLE stack or adapter not reachable
    AdapterUnavailable,
    /// Address does not resolve to a remote device
    UnknownDevice(String),
    /// Cached connection refused to reconnect
    ReconnectRejected(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AdapterUnavailable => {
                write!(f, "No Bluetooth adapter available. Please ensure Bluetooth is enabled.")
            }
            SessionError::UnknownDevice(address) => {
                write!(f, "Device {} not found. Unable to connect.", address)
            }
            SessionError::ReconnectRejected(address) => {
                write!(f, "Reconnect to {} was rejected by the Bluetooth stack", address)
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Errors returned by a `GattHandle` when a request could not be issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    /// Handle has been closed or the peripheral is gone
    NotConnected,
    /// Characteristic or descriptor is not part of the discovered services
    AttributeNotFound(String),
    /// The stack refused the request
    Rejected(String),
}

impl fmt::Display for GattError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattError::NotConnected => write!(f, "GATT handle is not connected"),
            GattError::AttributeNotFound(uuid) => write!(f, "GATT attribute {} not found", uuid),
            GattError::Rejected(reason) => write!(f, "GATT request rejected: {}", reason),
        }
    }
}

impl std::error::Error for GattError {}

/// Errors produced by sensor decoders
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is shorter than the fields its flags declare
    MalformedPayload { expected: usize, actual: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::MalformedPayload { expected, actual } => write!(
                f,
                "Malformed payload: expected at least {} bytes, got {}",
                expected, actual
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur while opening, writing or closing CSV logs
#[derive(Debug)]
pub enum StorageError {
    /// Could not create the log directory
    CreateDir(io::Error),
    /// Could not create or truncate a log file
    Open(io::Error),
    /// Write or flush failed
    Write(io::Error),
    /// Could not start the storage thread
    Spawn(io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::CreateDir(e) => write!(f, "Failed to create log directory: {}", e),
            StorageError::Open(e) => write!(f, "Failed to open log file: {}", e),
            StorageError::Write(e) => write!(f, "Failed to write log file: {}", e),
            StorageError::Spawn(e) => write!(f, "Failed to start storage thread: {}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::CreateDir(e) => Some(e),
            StorageError::Open(e) => Some(e),
            StorageError::Write(e) => Some(e),
            StorageError::Spawn(e) => Some(e),
        }
    }
}

/// Errors from the one-shot NTP bootstrap
#[derive(Debug)]
pub enum ClockError {
    /// Host could not be resolved or reached
    NtpUnavailable(String),
    /// Socket-level failure
    Io(io::Error),
    /// Server answered with something that is not a usable time
    InvalidResponse(String),
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockError::NtpUnavailable(host) => write!(f, "NTP server {} unavailable", host),
            ClockError::Io(e) => write!(f, "NTP request failed: {}", e),
            ClockError::InvalidResponse(reason) => write!(f, "Invalid NTP response: {}", reason),
        }
    }
}

impl std::error::Error for ClockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClockError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClockError {
    fn from(e: io::Error) -> Self {
        ClockError::Io(e)
    }
}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(io::Error),
    /// Failed to write config file
    WriteFailed(io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
        }
    }
}
