// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Timekeeping hardware: PIT channel 0 at the traditional 18.2 Hz tick
//! rate, RTC at 1024 Hz with the alarm enabled and the periodic tick
//! parked until the wait service arms it.

use crate::arch::x86_64::port::Ports;
use eldcore::hw::PortIo;
use log::{info, warn};

const PIT_CH0: u16 = 0x40;
const PIT_CTRL: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, mode 3.
const PIT_CH0_MODE3: u8 = 0x36;

const CMOS_IDX: u16 = 0x70;
const CMOS_DATA: u16 = 0x71;
/// Keep NMI disabled while the index register is off its home position.
const CMOS_NMI_DIS: u8 = 0x80;

const RTC_STA_A: u8 = 0x0A;
const RTC_STA_B: u8 = 0x0B;
const RTC_STA_C: u8 = 0x0C;
const RTC_STA_D: u8 = 0x0D;

const RTC_A_UIP: u8 = 0x80;
/// Divider chain on, periodic rate 1024 Hz.
const RTC_A_RATE: u8 = 0x26;

const RTC_B_FREEZE: u8 = 0x80;
const RTC_B_TICK_ENA: u8 = 0x40;
const RTC_B_ALRM_ENA: u8 = 0x20;
const RTC_B_UPDE_ENA: u8 = 0x10;

const UIP_RETRIES: u32 = 0xFFFF;

fn cmos_read(io: &mut Ports, idx: u8) -> u8 {
    io.outb_wait(CMOS_IDX, idx);
    let val = io.inb(CMOS_DATA);
    io.io_delay();
    val
}

fn cmos_write(io: &mut Ports, idx: u8, val: u8) {
    io.outb_wait(CMOS_IDX, idx);
    io.outb_wait(CMOS_DATA, val);
}

/// Park the index register on status D, which re-enables NMI.
fn cmos_home(io: &mut Ports) {
    io.outb_wait(CMOS_IDX, RTC_STA_D);
}

pub fn init() {
    let mut io = Ports;

    // 65536 divisor: the 18.2 Hz tick every timer-interrupt consumer
    // counts on
    io.outb_wait(PIT_CTRL, PIT_CH0_MODE3);
    io.outb_wait(PIT_CH0, 0);
    io.outb_wait(PIT_CH0, 0);

    // never program the RTC mid-update
    let mut retries = UIP_RETRIES;
    while cmos_read(&mut io, RTC_STA_A | CMOS_NMI_DIS) & RTC_A_UIP != 0 {
        retries -= 1;
        if retries == 0 {
            warn!("rtc: update-in-progress flag stuck, programming anyway");
            break;
        }
    }

    let sta_a = cmos_read(&mut io, RTC_STA_A | CMOS_NMI_DIS);
    cmos_write(&mut io, RTC_STA_A | CMOS_NMI_DIS, sta_a & !0x7F | RTC_A_RATE);
    let sta_b = cmos_read(&mut io, RTC_STA_B | CMOS_NMI_DIS);
    cmos_write(
        &mut io,
        RTC_STA_B | CMOS_NMI_DIS,
        sta_b & !(RTC_B_FREEZE | RTC_B_UPDE_ENA | RTC_B_TICK_ENA) | RTC_B_ALRM_ENA,
    );
    // reading status C acknowledges anything pending from before
    let _ = cmos_read(&mut io, RTC_STA_C | CMOS_NMI_DIS);
    cmos_home(&mut io);

    info!("time: PIT ch0 mode 3, RTC alarm on / tick parked");
}
