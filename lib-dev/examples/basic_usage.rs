// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

use nvstusb::{Emitter, FirmwareFile, LibUsbTransport};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let transport = Arc::new(LibUsbTransport::new()?);
    let emitter = Emitter::with_defaults(transport);

    emitter
        .register_callback(|event| {
            println!("Emitter event: {:?}", event);
        })
        .await;

    emitter.connect(false).await?;

    // An unflashed emitter needs the image from the vendor driver first
    if emitter.firmware_check().await? {
        let firmware = std::env::args().nth(1).unwrap_or_else(|| "nvstusb.fw".into());
        emitter.firmware_update(&FirmwareFile::new(firmware)).await?;
    }

    emitter.initialize(120.0).await?;

    // Two seconds of alternating eyes at 120 Hz
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_micros(8333));
    for _ in 0..240 {
        ticker.tick().await;
        emitter.toggle_eye(0.0).await?;
    }

    let keys = emitter.read_keys().await?;
    println!("Keys: {:?}", keys);

    emitter.disconnect().await;
    Ok(())
}
