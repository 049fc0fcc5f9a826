// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

use crate::constants::{REG_KEYS, SETTLE_DELAY};
use crate::endpoint::{endpoint_count, resolve_in_endpoint, resolve_out_endpoint, ResolvedEndpoint};
use crate::firmware::{upload_image, FirmwareError, FirmwareImage, FirmwareSource};
use crate::timing::{
    toggle_reload_count, EmitterCommand, EyeState, RegisterRead, SetEye, TimingProgram,
};
use crate::transport::{DeviceId, DeviceIdentity, TransportError, UsbEvent, UsbTransport};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unbound,
    Authorizing,
    Opening,
    Configuring,
    Connected,
    Disconnecting,
}

/// Notifications for the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterEvent {
    Connected,
    Disconnected,
}

/// Callback type for connection notifications
pub type EventCallback = Arc<dyn Fn(EmitterEvent) + Send + Sync>;

/// Errors that can occur while driving the emitter
#[derive(Debug, thiserror::Error)]
pub enum EmitterError {
    #[error("Device not found")]
    DeviceNotFound,

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Emitter not ready, no endpoint resolved")]
    NotReady,

    #[error("Malformed firmware image: {0}")]
    MalformedFirmwareImage(#[from] FirmwareError),

    #[error("Firmware image unavailable: {0}")]
    FirmwareUnavailable(#[from] std::io::Error),

    #[error("Invalid refresh rate: {0}")]
    InvalidRate(f64),

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
}

/// Settings for an [`Emitter`]
#[derive(Debug, Clone)]
pub struct EmitterOptions {
    pub identity: DeviceIdentity,
    /// Swap the left and right polarity bytes on the wire
    pub invert_eyes: bool,
    /// Wait between reset, close and reopen after a firmware upload
    pub settle_delay: Duration,
}

impl Default for EmitterOptions {
    fn default() -> Self {
        Self {
            identity: DeviceIdentity::default(),
            invert_eyes: false,
            settle_delay: SETTLE_DELAY,
        }
    }
}

/// The open device and the endpoints resolved for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    device: DeviceId,
    out: Option<ResolvedEndpoint>,
    in_endpoint: Option<u8>,
}

impl DeviceSession {
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Resolved OUT endpoint number, `None` while the firmware is missing
    pub fn out_endpoint(&self) -> Option<u8> {
        self.out.map(|ep| ep.endpoint)
    }

    pub fn in_endpoint(&self) -> Option<u8> {
        self.in_endpoint
    }

    pub fn interface(&self) -> Option<u8> {
        self.out.map(|ep| ep.interface)
    }

    pub fn alternate(&self) -> Option<u8> {
        self.out.map(|ep| ep.alternate)
    }

    pub fn configuration(&self) -> Option<u8> {
        self.out.map(|ep| ep.configuration)
    }

    fn ready(&self) -> Result<u8, EmitterError> {
        self.out_endpoint().ok_or(EmitterError::NotReady)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Session {
    Unbound,
    Bound(DeviceSession),
}

/// Front panel state of the emitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keys {
    /// Wheel movement since the last read
    pub wheel_delta: i8,
    /// Wheel movement while the wheel was held down
    pub pressed_wheel_delta: i8,
    /// The 3D button was pressed since the last read
    pub toggled_3d: bool,
}

impl Keys {
    fn from_bytes(data: &[u8]) -> Self {
        Self {
            wheel_delta: data[0] as i8,
            pressed_wheel_delta: data[1] as i8,
            toggled_3d: data[2] & 0x01 != 0,
        }
    }
}

/// Connection manager and protocol driver for one IR emitter
pub struct Emitter<T: UsbTransport> {
    transport: Arc<T>,
    options: EmitterOptions,
    session: Mutex<Session>,
    state: RwLock<ConnectionState>,
    eye: Mutex<EyeState>,
    callbacks: RwLock<Vec<EventCallback>>,
}

impl<T: UsbTransport> Emitter<T> {
    pub fn new(transport: Arc<T>, options: EmitterOptions) -> Self {
        Self {
            transport,
            options,
            session: Mutex::new(Session::Unbound),
            state: RwLock::new(ConnectionState::Unbound),
            eye: Mutex::new(EyeState::default()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn with_defaults(transport: Arc<T>) -> Self {
        Self::new(transport, EmitterOptions::default())
    }

    pub fn options(&self) -> &EmitterOptions {
        &self.options
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Get the current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.session.lock().await, Session::Bound(_))
    }

    /// Snapshot of the active session
    pub async fn session(&self) -> Option<DeviceSession> {
        match &*self.session.lock().await {
            Session::Bound(session) => Some(session.clone()),
            Session::Unbound => None,
        }
    }

    /// Device the session is bound to
    pub async fn device(&self) -> Option<DeviceId> {
        self.session().await.map(|s| s.device)
    }

    pub async fn out_endpoint(&self) -> Option<u8> {
        self.session().await.and_then(|s| s.out_endpoint())
    }

    /// Register a callback for connect and disconnect notifications
    pub async fn register_callback<F>(&self, callback: F)
    where
        F: Fn(EmitterEvent) + Send + Sync + 'static,
    {
        let mut callbacks = self.callbacks.write().await;
        callbacks.push(Arc::new(callback));
    }

    async fn emit(&self, event: EmitterEvent) {
        let callbacks = self.callbacks.read().await;
        for callback in callbacks.iter() {
            callback(event);
        }
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != next {
            debug!("Connection state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Bind the first already-authorised emitter. Never prompts.
    pub async fn reconnect_to_paired(&self) -> Result<(), EmitterError> {
        let mut session = self.session.lock().await;
        self.reconnect_locked(&mut session).await
    }

    async fn reconnect_locked(&self, session: &mut Session) -> Result<(), EmitterError> {
        if let Session::Bound(_) = session {
            return Ok(());
        }

        let devices = self
            .transport
            .authorized_devices(self.options.identity)
            .await?;

        match devices.into_iter().next() {
            Some(device) => {
                info!("Reconnecting to paired emitter at {}", device);
                self.setup_device(session, device).await
            }
            None => {
                debug!("No paired emitter {} found", self.options.identity);
                Ok(())
            }
        }
    }

    /// Connect to an emitter.
    ///
    /// Tries paired devices first. Unless `reconnect_only` is set, falls back
    /// to asking the user for a device.
    pub async fn connect(&self, reconnect_only: bool) -> Result<(), EmitterError> {
        let mut session = self.session.lock().await;
        if matches!(*session, Session::Bound(_)) {
            return Ok(());
        }

        self.reconnect_locked(&mut session).await?;
        if matches!(*session, Session::Bound(_)) || reconnect_only {
            return Ok(());
        }

        self.set_state(ConnectionState::Authorizing).await;
        let requested = self.transport.request_device(self.options.identity).await;
        let device = match requested {
            Ok(Some(device)) => device,
            Ok(None) => {
                info!("No emitter selected");
                self.set_state(ConnectionState::Unbound).await;
                return Err(EmitterError::DeviceNotFound);
            }
            Err(e) => {
                error!("Device request failed: {}", e);
                self.set_state(ConnectionState::Unbound).await;
                return Err(e.into());
            }
        };

        self.setup_device(&mut session, device).await
    }

    async fn setup_device(&self, session: &mut Session, device: DeviceId) -> Result<(), EmitterError> {
        match self.configure(&device).await {
            Ok(bound) => {
                match bound.out_endpoint() {
                    Some(endpoint) => info!("Connected to emitter at {} (endpoint {})", device, endpoint),
                    None => info!("Connected to emitter at {} without firmware", device),
                }
                *session = Session::Bound(bound);
                self.set_state(ConnectionState::Connected).await;
                self.emit(EmitterEvent::Connected).await;
                Ok(())
            }
            Err(e) => {
                error!("Failed to set up emitter at {}: {}", device, e);
                self.close_quietly(&device).await;
                self.release(session).await;
                self.set_state(ConnectionState::Unbound).await;
                Err(e)
            }
        }
    }

    async fn configure(&self, device: &DeviceId) -> Result<DeviceSession, EmitterError> {
        self.set_state(ConnectionState::Opening).await;
        if !self.transport.is_open(device).await {
            debug!("Opening {}", device);
            self.transport.open(device).await?;
        }

        self.set_state(ConnectionState::Configuring).await;
        let tree = self.transport.descriptors(device).await?;
        let out = resolve_out_endpoint(&tree);

        let in_endpoint = match &out {
            Some(ep) => {
                self.transport
                    .select_configuration(device, ep.configuration)
                    .await?;
                self.transport.claim_interface(device, ep.interface).await?;
                self.transport
                    .select_alternate_setting(device, ep.interface, ep.alternate)
                    .await?;
                debug!("Claimed {:?}", ep);
                resolve_in_endpoint(&tree, ep)
            }
            None => {
                warn!("No OUT endpoint on {}, firmware is probably missing", device);
                None
            }
        };

        Ok(DeviceSession {
            device: device.clone(),
            out,
            in_endpoint,
        })
    }

    async fn close_quietly(&self, device: &DeviceId) {
        if !self.transport.is_open(device).await {
            return;
        }
        if let Err(e) = self.transport.close(device).await {
            warn!("Device close failed: {}", e);
        }
    }

    /// Drop a bound session and tell the host about it
    async fn release(&self, session: &mut Session) {
        if let Session::Bound(_) = session {
            *session = Session::Unbound;
            self.set_state(ConnectionState::Unbound).await;
            self.emit(EmitterEvent::Disconnected).await;
        }
    }

    /// Close the device and drop the session. Close failures are only logged.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        let device = match &*session {
            Session::Bound(bound) => bound.device.clone(),
            Session::Unbound => return,
        };

        self.set_state(ConnectionState::Disconnecting).await;
        self.close_quietly(&device).await;
        info!("Disconnected from emitter at {}", device);
        self.release(&mut session).await;
    }

    /// Apply one hot-plug notification
    pub async fn handle_usb_event(&self, event: UsbEvent) -> Result<(), EmitterError> {
        let mut session = self.session.lock().await;
        match event {
            UsbEvent::Attached(device) => {
                debug!("USB attach: {}", device);
                if matches!(*session, Session::Unbound) {
                    self.reconnect_locked(&mut session).await?;
                }
            }
            UsbEvent::Detached(device) => {
                debug!("USB detach: {}", device);
                let same_device = match &*session {
                    Session::Bound(bound) => bound.device == device,
                    Session::Unbound => false,
                };
                if same_device {
                    info!("Emitter at {} was unplugged", device);
                    self.set_state(ConnectionState::Disconnecting).await;
                    self.close_quietly(&device).await;
                    self.release(&mut session).await;
                }
            }
        }
        Ok(())
    }

    /// Process hot-plug notifications until the sender goes away
    pub async fn watch(&self, mut events: mpsc::UnboundedReceiver<UsbEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_usb_event(event).await {
                error!("Failed to handle USB event: {}", e);
            }
        }
        debug!("USB event channel closed");
    }

    async fn needs_firmware(&self, device: &DeviceId) -> Result<bool, EmitterError> {
        let tree = self.transport.descriptors(device).await?;
        let endpoints = endpoint_count(&tree);
        debug!("{} exposes {} endpoints", device, endpoints);
        Ok(endpoints == 0)
    }

    /// Whether the attached emitter appears to be missing its firmware.
    ///
    /// An unflashed emitter enumerates without any endpoints. Some hosts hide
    /// endpoints from the descriptor view, so treat this as a hint.
    pub async fn firmware_check(&self) -> Result<bool, EmitterError> {
        let session = self.session.lock().await;
        match &*session {
            Session::Bound(bound) => self.needs_firmware(&bound.device).await,
            Session::Unbound => Ok(false),
        }
    }

    /// Upload firmware if the emitter needs it.
    ///
    /// Returns `true` when an upload happened. Afterwards the device is reset,
    /// reopened and set up again so the new endpoints are resolved.
    pub async fn firmware_update(&self, source: &dyn FirmwareSource) -> Result<bool, EmitterError> {
        let mut session = self.session.lock().await;
        let device = match &*session {
            Session::Bound(bound) => bound.device.clone(),
            Session::Unbound => return Ok(false),
        };

        if !self.needs_firmware(&device).await? {
            debug!("Emitter at {} already has firmware", device);
            return Ok(false);
        }

        let data = source.fetch().await?;
        let image = FirmwareImage::parse(&data)?;
        info!("Firmware upload needed - uploading {} bytes", image.len());

        upload_image(self.transport.as_ref(), &device, &image).await?;

        // The emitter usually drops off the bus as soon as it resets.
        if let Err(e) = self.transport.reset(&device).await {
            warn!("Reset error: {}", e);
        }
        sleep(self.options.settle_delay).await;

        if let Err(e) = self.transport.close(&device).await {
            warn!("Close after reset failed: {}", e);
        }
        sleep(self.options.settle_delay).await;

        if let Err(e) = self.transport.open(&device).await {
            error!("Failed to reopen emitter after firmware upload: {}", e);
            self.release(&mut session).await;
            return Err(e.into());
        }
        sleep(self.options.settle_delay).await;

        info!("Firmware upload completed");
        self.setup_device(&mut session, device).await?;
        Ok(true)
    }

    async fn send(
        &self,
        device: &DeviceId,
        endpoint: u8,
        command: &dyn EmitterCommand,
    ) -> Result<usize, EmitterError> {
        let buffer = command.to_buffer();
        debug!("USB TX ep{}: {:02x?}", endpoint, buffer);
        Ok(self
            .transport
            .bulk_transfer_out(device, endpoint, &buffer)
            .await?)
    }

    /// Program the emitter timers for a display refresh rate
    pub async fn initialize(&self, rate: f64) -> Result<(), EmitterError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(EmitterError::InvalidRate(rate));
        }

        let session = self.session.lock().await;
        let bound = match &*session {
            Session::Bound(bound) => bound,
            Session::Unbound => return Err(EmitterError::NotReady),
        };
        let endpoint = bound.ready()?;

        let program = TimingProgram::new(rate);
        info!("Programming emitter timers for {} Hz", rate);
        debug!("{:?}", program);

        for command in program.commands() {
            self.send(&bound.device, endpoint, &command).await?;
        }
        Ok(())
    }

    /// Send the current eye and switch to the other one.
    ///
    /// Call once per displayed frame. `offset_us` trims the shutter active
    /// time in microseconds. The eye only switches once the frame was sent,
    /// so a failed transfer repeats the same eye on the next call.
    pub async fn toggle_eye(&self, offset_us: f64) -> Result<SetEye, EmitterError> {
        let session = self.session.lock().await;
        let bound = match &*session {
            Session::Bound(bound) => bound,
            Session::Unbound => return Err(EmitterError::NotReady),
        };
        let endpoint = bound.ready()?;

        let mut eye = self.eye.lock().await;
        let mut next = *eye;
        let polarity = next.advance(self.options.invert_eyes);
        let command = SetEye::new(polarity, toggle_reload_count(offset_us));
        self.send(&bound.device, endpoint, &command).await?;
        *eye = next;
        Ok(command)
    }

    /// Start the next toggle from the left-off state again
    pub async fn reset_eye(&self) {
        *self.eye.lock().await = EyeState::default();
    }

    pub async fn eye_state(&self) -> EyeState {
        *self.eye.lock().await
    }

    /// Read `length` bytes from the register block, zeroing them if `clear`
    pub async fn read_register(
        &self,
        address: u8,
        length: u16,
        clear: bool,
    ) -> Result<Vec<u8>, EmitterError> {
        let session = self.session.lock().await;
        let bound = match &*session {
            Session::Bound(bound) => bound,
            Session::Unbound => return Err(EmitterError::NotReady),
        };
        let out = bound.ready()?;
        let input = bound.in_endpoint.ok_or(EmitterError::NotReady)?;

        let command = RegisterRead::new(address, length).with_clear(clear);
        self.send(&bound.device, out, &command).await?;

        // The reply echoes the 4-byte request header before the data.
        let expected = 4 + length as usize;
        let reply = self
            .transport
            .bulk_transfer_in(&bound.device, input, expected)
            .await?;
        debug!("USB RX ep{}: {:02x?}", input, reply);

        if reply.len() < expected {
            return Err(EmitterError::ShortRead {
                expected,
                actual: reply.len(),
            });
        }
        Ok(reply[4..expected].to_vec())
    }

    /// Read and clear the wheel and 3D button state
    pub async fn read_keys(&self) -> Result<Keys, EmitterError> {
        let data = self.read_register(REG_KEYS, 3, true).await?;
        Ok(Keys::from_bytes(&data))
    }
}
