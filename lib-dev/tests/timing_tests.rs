// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

use nvstusb::timing::*;
use nvstusb::{EYE_LEFT, EYE_RIGHT};

#[test]
fn test_reload_count_frame_at_60hz() {
    assert_eq!(reload_count(16666.67, 12_000_000), -199999);
    assert_eq!(TimingProgram::new(60.0).frame, -199999);
}

#[test]
fn test_reload_count_fixed_timers() {
    assert_eq!(ClockDomain::Timer0.reload_count(2080.0), -8319);
    assert_eq!(ClockDomain::Timer0.reload_count(4774.25), -19096);
    assert_eq!(ClockDomain::Timer2.reload_count(4568.5), -54821);
}

#[test]
fn test_clock_domains() {
    assert_eq!(ClockDomain::Timer0.frequency_hz(), 4_000_000);
    assert_eq!(ClockDomain::Timer2.frequency_hz(), 12_000_000);
}

#[test]
fn test_toggle_reload_count() {
    assert_eq!(toggle_reload_count(0.0), -111110);
    // A positive trim lengthens the active time and lowers the count
    assert_eq!(toggle_reload_count(10.0), -111230);
}

#[test]
fn test_timing_program_120hz() {
    let program = TimingProgram::new(120.0);

    assert_eq!(program.lead, -54821);
    assert_eq!(program.gap, -19096);
    assert_eq!(program.active, -8319);
    assert_eq!(program.frame, -99999);
    assert_eq!(program.idle_timeout, 480);
}

#[test]
fn test_init_records_120hz() {
    let records: Vec<Vec<u8>> = TimingProgram::new(120.0)
        .commands()
        .iter()
        .map(|c| c.to_buffer())
        .collect();

    assert_eq!(records.len(), 4);
    assert_eq!(
        records[0],
        vec![
            0x01, 0x00, 0x18, 0x00, // write 24 bytes at 0x00
            0xdb, 0x29, 0xff, 0xff, // lead, timer 2
            0x68, 0xb5, 0xff, 0xff, // gap, timer 0
            0x81, 0xdf, 0xff, 0xff, // active, timer 0
            0x30, 0x28, 0x24, 0x22, // waveform selector
            0x0a, 0x08, 0x05, 0x04, // port toggle
            0x61, 0x79, 0xfe, 0xff, // frame, timer 2
        ]
    );
    assert_eq!(records[1], vec![0x01, 0x1c, 0x02, 0x00, 0x02, 0x00]);
    assert_eq!(records[2], vec![0x01, 0x1e, 0x02, 0x00, 0xe0, 0x01]);
    assert_eq!(records[3], vec![0x01, 0x1b, 0x01, 0x00, 0x07]);
}

#[test]
fn test_init_frame_count_60hz() {
    let timings = TimingProgram::new(60.0).timings();
    assert_eq!(timings.address(), 0x00);
    assert_eq!(&timings.data()[20..24], &[0xc1, 0xf2, 0xfc, 0xff]);
}

#[test]
fn test_waveform_and_port_toggle_tables() {
    let timings = TimingProgram::new(120.0).timings();
    let data = timings.data();

    assert_eq!(data.len(), 24);
    assert_eq!(&data[12..16], &[0x30, 0x28, 0x24, 0x22]);
    assert_eq!(&data[16..20], &[0x0a, 0x08, 0x05, 0x04]);
}

#[test]
fn test_set_eye_buffer() {
    let right = SetEye::new(EYE_RIGHT, toggle_reload_count(0.0));
    assert_eq!(
        right.to_buffer(),
        vec![0xaa, 0xff, 0x00, 0x00, 0xfa, 0x4d, 0xfe, 0xff]
    );

    let left = SetEye::new(EYE_LEFT, -111110);
    assert_eq!(left.to_buffer()[..2], [0xaa, 0xfe]);
}

#[test]
fn test_register_read_buffer() {
    assert_eq!(RegisterRead::new(0x18, 3).to_buffer(), vec![0x02, 0x18, 0x03, 0x00]);
    assert_eq!(
        RegisterRead::new(0x18, 3).with_clear(true).to_buffer(),
        vec![0x42, 0x18, 0x03, 0x00]
    );
}

#[test]
fn test_eye_state_alternates() {
    let mut eye = EyeState::default();
    assert!(!eye.is_left());

    assert_eq!(eye.advance(false), EYE_RIGHT);
    assert!(eye.is_left());
    assert_eq!(eye.advance(false), EYE_LEFT);
    assert_eq!(eye.advance(false), EYE_RIGHT);
}

#[test]
fn test_eye_polarity_inverted() {
    assert_eq!(eye_polarity(true, false), EYE_LEFT);
    assert_eq!(eye_polarity(false, false), EYE_RIGHT);
    assert_eq!(eye_polarity(true, true), EYE_RIGHT);
    assert_eq!(eye_polarity(false, true), EYE_LEFT);
}
