// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

use nvstusb::transport::{ControlSetup, DeviceId, TransportError, UsbTransport};
use nvstusb::LibUsbTransport;
use std::time::Duration;

// Hosts without a usable libusb (e.g. containers without usbfs) skip these.
fn transport() -> Option<LibUsbTransport> {
    LibUsbTransport::with_timeout(Duration::from_millis(100)).ok()
}

fn unknown_device() -> DeviceId {
    DeviceId::new(250, vec![9, 9, 9])
}

#[tokio::test(flavor = "current_thread")]
async fn test_transfers_on_closed_device_fail_fast() {
    let Some(transport) = transport() else {
        return;
    };
    let device = unknown_device();

    assert!(!transport.is_open(&device).await);
    assert!(matches!(
        transport.bulk_transfer_out(&device, 1, &[0xaa]).await,
        Err(TransportError::NotOpen(_))
    ));
    assert!(matches!(
        transport.bulk_transfer_in(&device, 2, 7).await,
        Err(TransportError::NotOpen(_))
    ));
    assert!(matches!(
        transport
            .control_transfer_out(&device, ControlSetup::vendor_device(0xa0, 0, 0), &[])
            .await,
        Err(TransportError::NotOpen(_))
    ));
    assert!(matches!(
        transport.reset(&device).await,
        Err(TransportError::NotOpen(_))
    ));
    assert!(matches!(
        transport.close(&device).await,
        Err(TransportError::NotOpen(_))
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn test_unknown_device_is_not_found() {
    let Some(transport) = transport() else {
        return;
    };

    let devices = transport
        .authorized_devices(Default::default())
        .await
        .unwrap();

    assert!(!devices.contains(&unknown_device()));
    assert!(matches!(
        transport.open(&unknown_device()).await,
        Err(TransportError::DeviceNotFound(_))
    ));
    assert!(matches!(
        transport.descriptors(&unknown_device()).await,
        Err(TransportError::DeviceNotFound(_))
    ));
}
