// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

use crate::constants::*;
use bytes::BufMut;
use std::fmt;

/// Timer clock sources on the emitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockDomain {
    /// Base clock / 12
    Timer0,
    /// Base clock / 4
    Timer2,
}

impl ClockDomain {
    pub fn frequency_hz(&self) -> u64 {
        match self {
            ClockDomain::Timer0 => TIMER0_CLOCK_HZ,
            ClockDomain::Timer2 => TIMER2_CLOCK_HZ,
        }
    }

    pub fn reload_count(&self, micros: f64) -> i32 {
        reload_count(micros, self.frequency_hz())
    }
}

impl fmt::Display for ClockDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockDomain::Timer0 => write!(f, "Timer 0 ({} Hz)", TIMER0_CLOCK_HZ),
            ClockDomain::Timer2 => write!(f, "Timer 2 ({} Hz)", TIMER2_CLOCK_HZ),
        }
    }
}

/// Reload value for a timer that has to overflow after `micros`.
///
/// The hardware counts up towards zero, so the value is the negated tick
/// count plus one, stored as a 32-bit two's-complement register.
pub fn reload_count(micros: f64, frequency_hz: u64) -> i32 {
    let ticks_per_us = frequency_hz as f64 / 1_000_000.0;
    (-micros * ticks_per_us).round() as i32 + 1
}

/// Reload count sent with every eye toggle.
///
/// Always derived from the 60 Hz reference, whatever rate the timers were
/// initialised with. `offset_us` trims the active time.
pub fn toggle_reload_count(offset_us: f64) -> i32 {
    let active = 1_000_000.0 / TOGGLE_REFERENCE_RATE / TOGGLE_SCALE;
    ClockDomain::Timer2.reload_count(active + offset_us)
}

/// A record sent to the emitter's bulk OUT endpoint
pub trait EmitterCommand: fmt::Debug + Send + Sync {
    fn to_buffer(&self) -> Vec<u8>;
}

/// Write `data` into the register block at `address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterWrite {
    address: u8,
    data: Vec<u8>,
}

impl RegisterWrite {
    pub fn new(address: u8, data: Vec<u8>) -> Self {
        Self { address, data }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl EmitterCommand for RegisterWrite {
    fn to_buffer(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(4 + self.data.len());
        buffer.put_u8(CMD_WRITE);
        buffer.put_u8(self.address);
        buffer.put_u16_le(self.data.len() as u16);
        buffer.put_slice(&self.data);
        buffer
    }
}

impl fmt::Display for RegisterWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RegisterWrite {{ address: {:#04x}, length: {} }}",
            self.address,
            self.data.len()
        )
    }
}

/// Read `length` bytes from the register block, optionally zeroing them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRead {
    address: u8,
    length: u16,
    clear: bool,
}

impl RegisterRead {
    pub fn new(address: u8, length: u16) -> Self {
        Self {
            address,
            length,
            clear: false,
        }
    }

    pub fn with_clear(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    pub fn length(&self) -> u16 {
        self.length
    }
}

impl EmitterCommand for RegisterRead {
    fn to_buffer(&self) -> Vec<u8> {
        let mut command = CMD_READ;
        if self.clear {
            command |= CMD_CLEAR;
        }
        let mut buffer = Vec::with_capacity(4);
        buffer.put_u8(command);
        buffer.put_u8(self.address);
        buffer.put_u16_le(self.length);
        buffer
    }
}

impl fmt::Display for RegisterRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RegisterRead {{ address: {:#04x}, length: {}, clear: {} }}",
            self.address, self.length, self.clear
        )
    }
}

/// Select the shutter for the next frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetEye {
    polarity: u8,
    reload: i32,
}

impl SetEye {
    pub fn new(polarity: u8, reload: i32) -> Self {
        Self { polarity, reload }
    }

    pub fn polarity(&self) -> u8 {
        self.polarity
    }

    pub fn reload(&self) -> i32 {
        self.reload
    }
}

impl EmitterCommand for SetEye {
    fn to_buffer(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(8);
        buffer.put_u8(CMD_SET_EYE);
        buffer.put_u8(self.polarity);
        buffer.put_u16(0);
        buffer.put_i32_le(self.reload);
        buffer
    }
}

impl fmt::Display for SetEye {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let eye = if self.polarity == EYE_LEFT { "left" } else { "right" };
        write!(f, "SetEye {{ polarity: {}, reload: {} }}", eye, self.reload)
    }
}

/// Polarity byte for an eye. Inversion swaps the two constants.
pub fn eye_polarity(left: bool, invert: bool) -> u8 {
    if left != invert {
        EYE_LEFT
    } else {
        EYE_RIGHT
    }
}

/// Which shutter is currently presented
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EyeState {
    left: bool,
}

impl EyeState {
    pub fn is_left(&self) -> bool {
        self.left
    }

    /// Polarity of the eye being presented, then advance to the other one
    pub fn advance(&mut self, invert: bool) -> u8 {
        let polarity = eye_polarity(self.left, invert);
        self.left = !self.left;
        polarity
    }
}

/// Timer constants for one refresh rate and the records that program them
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingProgram {
    pub rate: f64,
    /// Timer 2 lead-in before the first pulse
    pub lead: i32,
    /// Timer 0 gap between pulses
    pub gap: i32,
    /// Timer 0 active time of one eye
    pub active: i32,
    /// Timer 2 length of one frame
    pub frame: i32,
    /// Frames without a toggle before the emitter goes idle
    pub idle_timeout: u16,
}

impl TimingProgram {
    pub fn new(rate: f64) -> Self {
        let frame_time = 1_000_000.0 / rate;

        Self {
            rate,
            lead: ClockDomain::Timer2.reload_count(TIMER2_LEAD_US),
            gap: ClockDomain::Timer0.reload_count(TIMER0_GAP_US),
            active: ClockDomain::Timer0.reload_count(ACTIVE_TIME_US),
            frame: ClockDomain::Timer2.reload_count(frame_time),
            idle_timeout: (rate * IDLE_TIMEOUT_SECONDS) as u16,
        }
    }

    /// Timing and waveform tables
    pub fn timings(&self) -> RegisterWrite {
        let mut data = Vec::with_capacity(24);
        data.put_i32_le(self.lead);
        data.put_i32_le(self.gap);
        data.put_i32_le(self.active);
        data.put_slice(&WAVEFORM_SELECTOR);
        data.put_slice(&PORT_TOGGLE);
        data.put_i32_le(self.frame);
        RegisterWrite::new(REG_TIMINGS, data)
    }

    pub fn state_counter(&self) -> RegisterWrite {
        RegisterWrite::new(REG_STATE_COUNTER, STATE_COUNTER_START.to_le_bytes().to_vec())
    }

    pub fn idle_timeout(&self) -> RegisterWrite {
        RegisterWrite::new(REG_IDLE_TIMEOUT, self.idle_timeout.to_le_bytes().to_vec())
    }

    pub fn mode(&self) -> RegisterWrite {
        RegisterWrite::new(REG_MODE, vec![MODE_FLAGS])
    }

    /// The four records in the order the emitter expects them
    pub fn commands(&self) -> [RegisterWrite; 4] {
        [
            self.timings(),
            self.state_counter(),
            self.idle_timeout(),
            self.mode(),
        ]
    }
}
