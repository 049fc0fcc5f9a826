// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

//! # 3D Vision IR Emitter Library
//!
//! This library drives the USB infrared emitter of stereoscopic shutter
//! glasses, including:
//! - Device discovery, pairing and hot-plug handling
//! - Firmware upload into an unflashed emitter
//! - Timer programming for a display refresh rate
//! - Per-frame eye toggling and front panel key reads

pub mod constants;
pub mod device;
pub mod endpoint;
pub mod firmware;
pub mod libusb;
pub mod timing;
pub mod transport;

// Re-export commonly used types
pub use constants::*;
pub use device::{
    ConnectionState, DeviceSession, Emitter, EmitterError, EmitterEvent, EmitterOptions,
    EventCallback, Keys,
};
pub use endpoint::{resolve_in_endpoint, resolve_out_endpoint, ResolvedEndpoint};
pub use firmware::{FirmwareError, FirmwareFile, FirmwareImage, FirmwareRecord, FirmwareSource};
pub use libusb::LibUsbTransport;
pub use timing::{
    ClockDomain, EmitterCommand, EyeState, RegisterRead, RegisterWrite, SetEye, TimingProgram,
};
pub use transport::{
    ControlSetup, DescriptorTree, DeviceId, DeviceIdentity, Direction, TransportError, UsbEvent,
    UsbTransport,
};
