// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

use crate::constants::FIRMWARE_LOAD_REQUEST;
use crate::transport::{ControlSetup, DeviceId, TransportError, UsbTransport};
use async_trait::async_trait;
use bytes::Buf;
use log::{debug, info};
use std::path::PathBuf;

/// Framing errors in a firmware image
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("Record header at offset {offset} needs 4 bytes, {remaining} left")]
    TruncatedHeader { offset: usize, remaining: usize },

    #[error("Record at offset {offset} declares {declared} payload bytes, {remaining} left")]
    TruncatedPayload {
        offset: usize,
        declared: usize,
        remaining: usize,
    },
}

/// One piece of firmware and where it goes in device memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRecord {
    pub position: u16,
    pub payload: Vec<u8>,
}

/// A parsed firmware image.
///
/// The raw format is a sequence of records, each a big-endian u16 length, a
/// big-endian u16 destination position and `length` payload bytes. Records
/// are kept in file order; positions are memory addresses and need not be
/// monotonic.
#[derive(Debug, Clone, Default)]
pub struct FirmwareImage {
    records: Vec<FirmwareRecord>,
    len: usize,
}

impl FirmwareImage {
    /// Parse the whole image. Fails on the first record that runs past the end.
    pub fn parse(data: &[u8]) -> Result<Self, FirmwareError> {
        let mut buf = data;
        let mut records = Vec::new();

        while buf.has_remaining() {
            let offset = data.len() - buf.remaining();
            if buf.remaining() < 4 {
                return Err(FirmwareError::TruncatedHeader {
                    offset,
                    remaining: buf.remaining(),
                });
            }

            let length = buf.get_u16() as usize;
            let position = buf.get_u16();

            if buf.remaining() < length {
                return Err(FirmwareError::TruncatedPayload {
                    offset,
                    declared: length,
                    remaining: buf.remaining(),
                });
            }

            let payload = buf[..length].to_vec();
            buf.advance(length);
            records.push(FirmwareRecord { position, payload });
        }

        Ok(Self {
            records,
            len: data.len(),
        })
    }

    pub fn records(&self) -> &[FirmwareRecord] {
        &self.records
    }

    /// Size of the raw image in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes that end up in device memory
    pub fn payload_len(&self) -> usize {
        self.records.iter().map(|r| r.payload.len()).sum()
    }
}

/// Supplies the raw firmware bytes on demand
#[async_trait]
pub trait FirmwareSource: Send + Sync {
    async fn fetch(&self) -> std::io::Result<Vec<u8>>;
}

/// Firmware read from a file, e.g. `nvstusb.fw` extracted from the vendor driver
#[derive(Debug, Clone)]
pub struct FirmwareFile {
    path: PathBuf,
}

impl FirmwareFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl FirmwareSource for FirmwareFile {
    async fn fetch(&self) -> std::io::Result<Vec<u8>> {
        debug!("Reading firmware from {:?}", self.path);
        tokio::fs::read(&self.path).await
    }
}

#[async_trait]
impl FirmwareSource for Vec<u8> {
    async fn fetch(&self) -> std::io::Result<Vec<u8>> {
        Ok(self.clone())
    }
}

#[async_trait]
impl FirmwareSource for &'static [u8] {
    async fn fetch(&self) -> std::io::Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

/// Write every record into device memory, one control transfer each.
///
/// The loader on the device has no flow control, so each transfer completes
/// before the next one starts.
pub async fn upload_image<T: UsbTransport + ?Sized>(
    transport: &T,
    device: &DeviceId,
    image: &FirmwareImage,
) -> Result<(), TransportError> {
    let total = image.records().len();
    info!(
        "Uploading firmware: {} bytes in {} records",
        image.payload_len(),
        total
    );

    for (i, record) in image.records().iter().enumerate() {
        debug!(
            "copy {} bytes to {:#06x} ({}/{})",
            record.payload.len(),
            record.position,
            i + 1,
            total
        );
        let setup = ControlSetup::vendor_device(FIRMWARE_LOAD_REQUEST, record.position, 0);
        transport
            .control_transfer_out(device, setup, &record.payload)
            .await?;
    }

    Ok(())
}
