// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

#![allow(dead_code)]

use async_trait::async_trait;
use nvstusb::transport::{
    AlternateSetting, Configuration, ControlSetup, DescriptorTree, DeviceId, DeviceIdentity,
    Direction, Endpoint, Interface, TransportError, UsbTransport,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// One recorded transport call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    AuthorizedDevices,
    RequestDevice,
    Open(DeviceId),
    Close(DeviceId),
    Descriptors(DeviceId),
    SelectConfiguration(u8),
    ClaimInterface(u8),
    SelectAlternate(u8, u8),
    BulkOut(u8, Vec<u8>),
    BulkIn(u8, usize),
    ControlOut(ControlSetup, Vec<u8>),
    Reset(DeviceId),
}

#[derive(Default)]
struct State {
    authorized: Vec<DeviceId>,
    requested: Option<DeviceId>,
    trees: HashMap<DeviceId, DescriptorTree>,
    /// Tree a device reports after it has been reset
    trees_after_reset: HashMap<DeviceId, DescriptorTree>,
    open: HashSet<DeviceId>,
    replies: VecDeque<Vec<u8>>,
    calls: Vec<Call>,
    fail_reset: bool,
    fail_open: bool,
    fail_bulk_out: bool,
}

/// Scriptable in-memory transport that records every call
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<State>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A paired device with the given descriptor tree
    pub fn with_paired(device: DeviceId, tree: DescriptorTree) -> Self {
        let mock = Self::new();
        mock.add_device(device.clone(), tree);
        mock.authorize(device);
        mock
    }

    pub fn add_device(&self, device: DeviceId, tree: DescriptorTree) {
        self.state.lock().unwrap().trees.insert(device, tree);
    }

    pub fn authorize(&self, device: DeviceId) {
        self.state.lock().unwrap().authorized.push(device);
    }

    pub fn set_requested(&self, device: Option<DeviceId>) {
        self.state.lock().unwrap().requested = device;
    }

    pub fn set_tree_after_reset(&self, device: DeviceId, tree: DescriptorTree) {
        self.state
            .lock()
            .unwrap()
            .trees_after_reset
            .insert(device, tree);
    }

    pub fn push_reply(&self, data: Vec<u8>) {
        self.state.lock().unwrap().replies.push_back(data);
    }

    pub fn fail_reset(&self, fail: bool) {
        self.state.lock().unwrap().fail_reset = fail;
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.lock().unwrap().fail_open = fail;
    }

    pub fn fail_bulk_out(&self, fail: bool) {
        self.state.lock().unwrap().fail_bulk_out = fail;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn bulk_out(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::BulkOut(_, data) => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn control_out(&self) -> Vec<(ControlSetup, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ControlOut(setup, data) => Some((setup, data)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn is_device_open(&self, device: &DeviceId) -> bool {
        self.state.lock().unwrap().open.contains(device)
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn require_open(&self, device: &DeviceId) -> Result<(), TransportError> {
        if self.state.lock().unwrap().open.contains(device) {
            Ok(())
        } else {
            Err(TransportError::NotOpen(device.clone()))
        }
    }
}

#[async_trait]
impl UsbTransport for MockTransport {
    async fn authorized_devices(
        &self,
        _identity: DeviceIdentity,
    ) -> Result<Vec<DeviceId>, TransportError> {
        self.record(Call::AuthorizedDevices);
        Ok(self.state.lock().unwrap().authorized.clone())
    }

    async fn request_device(
        &self,
        _identity: DeviceIdentity,
    ) -> Result<Option<DeviceId>, TransportError> {
        self.record(Call::RequestDevice);
        Ok(self.state.lock().unwrap().requested.clone())
    }

    async fn is_open(&self, device: &DeviceId) -> bool {
        self.state.lock().unwrap().open.contains(device)
    }

    async fn open(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.record(Call::Open(device.clone()));
        let mut state = self.state.lock().unwrap();
        if state.fail_open || !state.trees.contains_key(device) {
            return Err(TransportError::DeviceNotFound(device.clone()));
        }
        state.open.insert(device.clone());
        Ok(())
    }

    async fn close(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.record(Call::Close(device.clone()));
        if self.state.lock().unwrap().open.remove(device) {
            Ok(())
        } else {
            Err(TransportError::NotOpen(device.clone()))
        }
    }

    async fn descriptors(&self, device: &DeviceId) -> Result<DescriptorTree, TransportError> {
        self.record(Call::Descriptors(device.clone()));
        self.state
            .lock()
            .unwrap()
            .trees
            .get(device)
            .cloned()
            .ok_or_else(|| TransportError::DeviceNotFound(device.clone()))
    }

    async fn select_configuration(
        &self,
        device: &DeviceId,
        value: u8,
    ) -> Result<(), TransportError> {
        self.record(Call::SelectConfiguration(value));
        self.require_open(device)
    }

    async fn claim_interface(
        &self,
        device: &DeviceId,
        interface: u8,
    ) -> Result<(), TransportError> {
        self.record(Call::ClaimInterface(interface));
        self.require_open(device)
    }

    async fn select_alternate_setting(
        &self,
        device: &DeviceId,
        interface: u8,
        alternate: u8,
    ) -> Result<(), TransportError> {
        self.record(Call::SelectAlternate(interface, alternate));
        self.require_open(device)
    }

    async fn bulk_transfer_out(
        &self,
        device: &DeviceId,
        endpoint: u8,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        self.record(Call::BulkOut(endpoint, data.to_vec()));
        self.require_open(device)?;
        if self.state.lock().unwrap().fail_bulk_out {
            return Err(TransportError::TransferFailed("pipe stalled".into()));
        }
        Ok(data.len())
    }

    async fn bulk_transfer_in(
        &self,
        device: &DeviceId,
        endpoint: u8,
        length: usize,
    ) -> Result<Vec<u8>, TransportError> {
        self.record(Call::BulkIn(endpoint, length));
        self.require_open(device)?;
        let mut reply = self
            .state
            .lock()
            .unwrap()
            .replies
            .pop_front()
            .unwrap_or_default();
        reply.truncate(length);
        Ok(reply)
    }

    async fn control_transfer_out(
        &self,
        device: &DeviceId,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        self.record(Call::ControlOut(setup, data.to_vec()));
        self.require_open(device)?;
        Ok(data.len())
    }

    async fn reset(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.record(Call::Reset(device.clone()));
        let mut state = self.state.lock().unwrap();
        if let Some(tree) = state.trees_after_reset.remove(device) {
            state.trees.insert(device.clone(), tree);
        }
        if state.fail_reset {
            Err(TransportError::TransferFailed("device left the bus".into()))
        } else {
            Ok(())
        }
    }
}

pub fn device_id(port: u8) -> DeviceId {
    DeviceId::new(1, vec![2, port])
}

/// Single configuration, interface 0 alt 0, OUT endpoint 1 and IN endpoint 2
pub fn flashed_tree() -> DescriptorTree {
    tree(vec![Interface {
        number: 0,
        alternates: vec![AlternateSetting {
            setting: 0,
            endpoints: vec![
                Endpoint::new(1, Direction::Out),
                Endpoint::new(2, Direction::In),
            ],
        }],
    }])
}

/// What an emitter without firmware reports: an interface with no endpoints
pub fn unflashed_tree() -> DescriptorTree {
    tree(vec![Interface {
        number: 0,
        alternates: vec![AlternateSetting {
            setting: 0,
            endpoints: vec![],
        }],
    }])
}

pub fn tree(interfaces: Vec<Interface>) -> DescriptorTree {
    DescriptorTree {
        configurations: vec![Configuration {
            value: 1,
            interfaces,
        }],
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
