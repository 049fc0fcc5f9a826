// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

//! # USB transport abstraction
//!
//! The connection manager never talks to libusb directly. Everything it needs
//! from the host USB stack goes through [`UsbTransport`], which keeps the
//! protocol logic testable against a recording mock and lets other backends
//! plug in.

use crate::constants::{EMITTER_PRODUCT_ID, EMITTER_VENDOR_ID};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Vendor/product pair a device has to match exactly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::new(EMITTER_VENDOR_ID, EMITTER_PRODUCT_ID)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Stable identity of one physical unit.
///
/// Bus number plus the chain of hub ports. Unlike the bus address it does not
/// change when the device re-enumerates after a reset, and two units of the
/// same model on different ports compare unequal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub bus_number: u8,
    pub port_path: Vec<u8>,
}

impl DeviceId {
    pub fn new(bus_number: u8, port_path: Vec<u8>) -> Self {
        Self {
            bus_number,
            port_path,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ports: Vec<String> = self.port_path.iter().map(|p| p.to_string()).collect();
        write!(f, "bus {} port {}", self.bus_number, ports.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub number: u8,
    pub direction: Direction,
}

impl Endpoint {
    pub fn new(number: u8, direction: Direction) -> Self {
        Self { number, direction }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlternateSetting {
    pub setting: u8,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Interface {
    pub number: u8,
    pub alternates: Vec<AlternateSetting>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    pub value: u8,
    pub interfaces: Vec<Interface>,
}

/// Configurations -> interfaces -> alternate settings -> endpoints, in the
/// order the device reports them
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DescriptorTree {
    pub configurations: Vec<Configuration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Setup stage of a host-to-device control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    pub fn vendor_device(request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: RequestType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
        }
    }
}

/// Hot-plug notification from the host USB stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    Attached(DeviceId),
    Detached(DeviceId),
}

/// Errors raised by a transport backend
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Device {0} not found")]
    DeviceNotFound(DeviceId),

    #[error("Device {0} is not open")]
    NotOpen(DeviceId),

    #[error("Hot-plug notifications are not supported on this platform")]
    HotplugUnsupported,

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("USB worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Capability surface of the host USB stack.
///
/// Every call may fail, and callers await each one before issuing the next
/// dependent step.
#[async_trait]
pub trait UsbTransport: Send + Sync {
    /// Devices matching `identity` the host has already granted access to
    async fn authorized_devices(
        &self,
        identity: DeviceIdentity,
    ) -> Result<Vec<DeviceId>, TransportError>;

    /// Ask the user to pick a device. `None` means nothing was selected.
    async fn request_device(
        &self,
        identity: DeviceIdentity,
    ) -> Result<Option<DeviceId>, TransportError>;

    async fn is_open(&self, device: &DeviceId) -> bool;

    async fn open(&self, device: &DeviceId) -> Result<(), TransportError>;

    async fn close(&self, device: &DeviceId) -> Result<(), TransportError>;

    async fn descriptors(&self, device: &DeviceId) -> Result<DescriptorTree, TransportError>;

    async fn select_configuration(&self, device: &DeviceId, value: u8)
        -> Result<(), TransportError>;

    async fn claim_interface(&self, device: &DeviceId, interface: u8)
        -> Result<(), TransportError>;

    async fn select_alternate_setting(
        &self,
        device: &DeviceId,
        interface: u8,
        alternate: u8,
    ) -> Result<(), TransportError>;

    async fn bulk_transfer_out(
        &self,
        device: &DeviceId,
        endpoint: u8,
        data: &[u8],
    ) -> Result<usize, TransportError>;

    async fn bulk_transfer_in(
        &self,
        device: &DeviceId,
        endpoint: u8,
        length: usize,
    ) -> Result<Vec<u8>, TransportError>;

    async fn control_transfer_out(
        &self,
        device: &DeviceId,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<usize, TransportError>;

    async fn reset(&self, device: &DeviceId) -> Result<(), TransportError>;
}
