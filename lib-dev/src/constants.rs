// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

use std::time::Duration;

/// USB vendor id of the 3D Vision IR emitter
pub const EMITTER_VENDOR_ID: u16 = 0x0955;

/// USB product id of the 3D Vision IR emitter
pub const EMITTER_PRODUCT_ID: u16 = 0x0007;

/// Oscillator frequency of the emitter's microcontroller in Hz
pub const BASE_CLOCK_HZ: u64 = 48_000_000;

/// Timer 0 runs at a twelfth of the base clock (4 MHz)
pub const TIMER0_CLOCK_HZ: u64 = BASE_CLOCK_HZ / 12;

/// Timer 2 runs at a quarter of the base clock (12 MHz)
pub const TIMER2_CLOCK_HZ: u64 = BASE_CLOCK_HZ / 4;

/// Write bytes into the register space
pub const CMD_WRITE: u8 = 0x01;

/// Read bytes from the register space
pub const CMD_READ: u8 = 0x02;

/// Zero the bytes after reading them, combined with `CMD_READ`
pub const CMD_CLEAR: u8 = 0x40;

/// Select the eye for the next frame
pub const CMD_SET_EYE: u8 = 0xAA;

/// Register offsets, relative to the start of the emitter's register block
pub const REG_TIMINGS: u8 = 0x00;
pub const REG_KEYS: u8 = 0x18;
pub const REG_MODE: u8 = 0x1b;
pub const REG_STATE_COUNTER: u8 = 0x1c;
pub const REG_IDLE_TIMEOUT: u8 = 0x1e;

/// Timer 2 delay before the shutter sequence starts, in microseconds
pub const TIMER2_LEAD_US: f64 = 4568.50;

/// Timer 0 delay between the two eye pulses, in microseconds
pub const TIMER0_GAP_US: f64 = 4774.25;

/// Time each eye stays lit, in microseconds
pub const ACTIVE_TIME_US: f64 = 2080.0;

/// Waveform selector table written after the timer 0 counters
pub const WAVEFORM_SELECTOR: [u8; 4] = [0x30, 0x28, 0x24, 0x22];

/// Port toggle table written after the waveform selector
pub const PORT_TOGGLE: [u8; 4] = [0x0a, 0x08, 0x05, 0x04];

/// Start value of the on-device frame state counter
pub const STATE_COUNTER_START: u16 = 0x0002;

/// Idle timeout in seconds, converted to frames with the refresh rate
pub const IDLE_TIMEOUT_SECONDS: f64 = 4.0;

/// Mode flags: bits 0-1 select the port pin pattern
pub const MODE_FLAGS: u8 = 0x07;

/// Refresh rate the eye toggle reload count is computed from
pub const TOGGLE_REFERENCE_RATE: f64 = 60.0;

/// Divisor applied to the reference frame time for the eye toggle
pub const TOGGLE_SCALE: f64 = 1.8;

/// Polarity byte selecting the left eye
pub const EYE_LEFT: u8 = 0xFE;

/// Polarity byte selecting the right eye
pub const EYE_RIGHT: u8 = 0xFF;

/// Vendor control request that writes a firmware chunk into device memory
pub const FIRMWARE_LOAD_REQUEST: u8 = 0xA0;

/// Wait between the reset, close and reopen steps after a firmware upload
pub const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Default timeout for a single USB transfer
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(1);
