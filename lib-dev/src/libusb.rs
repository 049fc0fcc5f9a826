// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

//! libusb backend for [`UsbTransport`]
//!
//! libusb calls block for up to the transfer timeout, so every one of them
//! runs on tokio's blocking pool. Each open device has its own lock; the
//! handle map is only locked long enough to look a handle up.

use crate::constants::TRANSFER_TIMEOUT;
use crate::transport::{
    AlternateSetting, Configuration, ControlSetup, DescriptorTree, DeviceId, DeviceIdentity,
    Direction, Endpoint, Interface, Recipient, RequestType, TransportError, UsbEvent,
    UsbTransport,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;

type SharedHandle = Arc<Mutex<DeviceHandle<Context>>>;

fn device_id<T: UsbContext>(device: &Device<T>) -> DeviceId {
    DeviceId::new(
        device.bus_number(),
        device.port_numbers().unwrap_or_default(),
    )
}

fn find_device(context: &Context, id: &DeviceId) -> Result<Device<Context>, TransportError> {
    for device in context.devices()?.iter() {
        if device_id(&device) == *id {
            return Ok(device);
        }
    }
    Err(TransportError::DeviceNotFound(id.clone()))
}

fn matching_devices(
    context: &Context,
    identity: DeviceIdentity,
) -> Result<Vec<DeviceId>, TransportError> {
    let mut found = Vec::new();
    for device in context.devices()?.iter() {
        if let Ok(descriptor) = device.device_descriptor() {
            if identity.matches(descriptor.vendor_id(), descriptor.product_id()) {
                found.push(device_id(&device));
            }
        }
    }
    Ok(found)
}

fn read_descriptors(context: &Context, id: &DeviceId) -> Result<DescriptorTree, TransportError> {
    let usb_device = find_device(context, id)?;
    let descriptor = usb_device.device_descriptor()?;

    let mut tree = DescriptorTree::default();
    for index in 0..descriptor.num_configurations() {
        let config = usb_device.config_descriptor(index)?;
        tree.configurations.push(Configuration {
            value: config.number(),
            interfaces: config
                .interfaces()
                .map(|interface| Interface {
                    number: interface.number(),
                    alternates: interface
                        .descriptors()
                        .map(|alt| AlternateSetting {
                            setting: alt.setting_number(),
                            endpoints: alt
                                .endpoint_descriptors()
                                .map(|ep| Endpoint::new(ep.number(), direction(ep.direction())))
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        });
    }
    Ok(tree)
}

/// Transport backed by a private libusb context
pub struct LibUsbTransport {
    context: Context,
    handles: Mutex<HashMap<DeviceId, SharedHandle>>,
    timeout: Duration,
    hotplug: Mutex<Option<Registration<Context>>>,
    stopping: Arc<AtomicBool>,
}

impl LibUsbTransport {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(TRANSFER_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            context: Context::new()?,
            handles: Mutex::new(HashMap::new()),
            timeout,
            hotplug: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<DeviceId, SharedHandle>> {
        // A panic while holding the lock leaves the map itself intact.
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, id: &DeviceId) -> Result<SharedHandle, TransportError> {
        self.handles()
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::NotOpen(id.clone()))
    }

    /// Run `f` against the open handle of `id` on the blocking pool
    async fn with_handle<R, F>(&self, id: &DeviceId, f: F) -> Result<R, TransportError>
    where
        R: Send + 'static,
        F: FnOnce(&mut DeviceHandle<Context>) -> Result<R, rusb::Error> + Send + 'static,
    {
        let handle = self.handle(id)?;
        let result = spawn_blocking(move || {
            let mut handle = handle.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut handle)
        })
        .await?;
        Ok(result?)
    }

    /// Run `f` against the libusb context on the blocking pool
    async fn with_context<R, F>(&self, f: F) -> Result<R, TransportError>
    where
        R: Send + 'static,
        F: FnOnce(&Context) -> Result<R, TransportError> + Send + 'static,
    {
        let context = self.context.clone();
        spawn_blocking(move || f(&context)).await?
    }

    /// Register for attach/detach notifications of devices matching `identity`.
    ///
    /// Spawns a thread that pumps libusb events until the transport is dropped.
    pub fn watch_hotplug(
        &self,
        identity: DeviceIdentity,
    ) -> Result<mpsc::UnboundedReceiver<UsbEvent>, TransportError> {
        if !rusb::has_hotplug() {
            return Err(TransportError::HotplugUnsupported);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let registration = HotplugBuilder::new()
            .vendor_id(identity.vendor_id)
            .product_id(identity.product_id)
            .enumerate(false)
            .register(&self.context, Box::new(HotplugForwarder { sender: tx }))?;

        let mut hotplug = self.hotplug.lock().unwrap_or_else(|e| e.into_inner());
        *hotplug = Some(registration);

        let context = self.context.clone();
        let stopping = self.stopping.clone();
        thread::spawn(move || {
            while !stopping.load(Ordering::Relaxed) {
                if let Err(e) = context.handle_events(Some(Duration::from_millis(100))) {
                    warn!("libusb event handling failed: {}", e);
                    break;
                }
            }
            debug!("Hot-plug event thread stopped");
        });

        info!("Watching for {} hot-plug events", identity);
        Ok(rx)
    }
}

impl Drop for LibUsbTransport {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::Relaxed);
    }
}

struct HotplugForwarder {
    sender: mpsc::UnboundedSender<UsbEvent>,
}

impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        let id = device_id(&device);
        debug!("Hot-plug: device arrived ({})", id);
        let _ = self.sender.send(UsbEvent::Attached(id));
    }

    fn device_left(&mut self, device: Device<T>) {
        let id = device_id(&device);
        debug!("Hot-plug: device left ({})", id);
        let _ = self.sender.send(UsbEvent::Detached(id));
    }
}

fn direction(direction: rusb::Direction) -> Direction {
    match direction {
        rusb::Direction::In => Direction::In,
        rusb::Direction::Out => Direction::Out,
    }
}

fn request_type(setup: &ControlSetup) -> u8 {
    let kind = match setup.request_type {
        RequestType::Standard => rusb::RequestType::Standard,
        RequestType::Class => rusb::RequestType::Class,
        RequestType::Vendor => rusb::RequestType::Vendor,
    };
    let recipient = match setup.recipient {
        Recipient::Device => rusb::Recipient::Device,
        Recipient::Interface => rusb::Recipient::Interface,
        Recipient::Endpoint => rusb::Recipient::Endpoint,
        Recipient::Other => rusb::Recipient::Other,
    };
    rusb::request_type(rusb::Direction::Out, kind, recipient)
}

#[async_trait]
impl UsbTransport for LibUsbTransport {
    async fn authorized_devices(
        &self,
        identity: DeviceIdentity,
    ) -> Result<Vec<DeviceId>, TransportError> {
        self.with_context(move |context| matching_devices(context, identity))
            .await
    }

    async fn request_device(
        &self,
        identity: DeviceIdentity,
    ) -> Result<Option<DeviceId>, TransportError> {
        // libusb has no device chooser, the OS permissions decide access.
        let devices = self
            .with_context(move |context| matching_devices(context, identity))
            .await?;
        Ok(devices.into_iter().next())
    }

    async fn is_open(&self, device: &DeviceId) -> bool {
        self.handles().contains_key(device)
    }

    async fn open(&self, device: &DeviceId) -> Result<(), TransportError> {
        let id = device.clone();
        let handle = self
            .with_context(move |context| {
                let mut handle = find_device(context, &id)?.open()?;
                if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
                    debug!("Kernel driver auto-detach unavailable: {}", e);
                }
                Ok(handle)
            })
            .await?;

        debug!("Opened {}", device);
        self.handles()
            .insert(device.clone(), Arc::new(Mutex::new(handle)));
        Ok(())
    }

    async fn close(&self, device: &DeviceId) -> Result<(), TransportError> {
        // The handle closes once the last in-flight transfer lets go of it.
        match self.handles().remove(device) {
            Some(_handle) => {
                debug!("Closed {}", device);
                Ok(())
            }
            None => Err(TransportError::NotOpen(device.clone())),
        }
    }

    async fn descriptors(&self, device: &DeviceId) -> Result<DescriptorTree, TransportError> {
        let id = device.clone();
        self.with_context(move |context| read_descriptors(context, &id))
            .await
    }

    async fn select_configuration(
        &self,
        device: &DeviceId,
        value: u8,
    ) -> Result<(), TransportError> {
        self.with_handle(device, move |h| h.set_active_configuration(value))
            .await
    }

    async fn claim_interface(
        &self,
        device: &DeviceId,
        interface: u8,
    ) -> Result<(), TransportError> {
        self.with_handle(device, move |h| h.claim_interface(interface))
            .await
    }

    async fn select_alternate_setting(
        &self,
        device: &DeviceId,
        interface: u8,
        alternate: u8,
    ) -> Result<(), TransportError> {
        self.with_handle(device, move |h| h.set_alternate_setting(interface, alternate))
            .await
    }

    async fn bulk_transfer_out(
        &self,
        device: &DeviceId,
        endpoint: u8,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        let timeout = self.timeout;
        let data = data.to_vec();
        self.with_handle(device, move |h| h.write_bulk(endpoint, &data, timeout))
            .await
    }

    async fn bulk_transfer_in(
        &self,
        device: &DeviceId,
        endpoint: u8,
        length: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let timeout = self.timeout;
        self.with_handle(device, move |h| {
            let mut buf = vec![0; length];
            let read = h.read_bulk(0x80 | endpoint, &mut buf, timeout)?;
            buf.truncate(read);
            Ok(buf)
        })
        .await
    }

    async fn control_transfer_out(
        &self,
        device: &DeviceId,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        let timeout = self.timeout;
        let data = data.to_vec();
        self.with_handle(device, move |h| {
            h.write_control(
                request_type(&setup),
                setup.request,
                setup.value,
                setup.index,
                &data,
                timeout,
            )
        })
        .await
    }

    async fn reset(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.with_handle(device, |h| h.reset()).await
    }
}
