// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! BIOS data area at 0x40:0.
//!
//! The layout is fixed by thirty years of real-mode software peeking at
//! absolute offsets, so the struct mirrors it field for field, reserved
//! holes included. 16-bit code reaches it through segment 0x40; stage 2
//! writes it through the identity map.

#![allow(dead_code)]

use bitflags::bitflags;
use core::ptr;
use log::info;

pub const BDA_SEG: u16 = 0x40;

/// `wait_active` states for the RTC wait service.
pub const BDA_WAIT_NONE: u8 = 0x00;
pub const BDA_WAIT_ACTIVE: u8 = 0x01;
pub const BDA_WAIT_FIN: u8 = 0x80;

bitflags! {
    /// INT 0x11 equipment word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Equip: u16 {
        /// Initial video: 80x25 color.
        const VID_COLOR_80 = 0x0020;
        /// One serial port installed.
        const ONE_SERIAL = 0x0200;
    }
}

/// Field-for-field mirror of the traditional BDA. Offsets from 0x40:0
/// are load-bearing; the `_r*` fields keep them.
#[repr(C, packed)]
pub struct Bda {
    pub com1: u16,
    pub com2: u16,
    pub com3: u16,
    pub com4: u16,
    pub lpt1: u16,
    pub lpt2: u16,
    pub lpt3: u16,
    /// 0x0E: EBDA segment.
    pub ebda: u16,
    /// 0x10: equipment word.
    pub eqpt: u16,
    pub wait_cntdn_low: u8,
    /// 0x13: base memory size in KiB.
    pub base_kib: u16,
    _r0: u16,
    pub kb_stat0: u8,
    pub kb_stat1: u8,
    pub kb_keypad: u8,
    /// 0x1A/0x1C: keyboard ring read/write cursors, offsets from 0x40:0.
    pub kb_buf_head: u16,
    pub kb_buf_tail: u16,
    /// 0x1E: default keyboard ring storage.
    pub kb_buf: [u16; 16],
    pub fd_recalib: u8,
    pub fd_motor: u8,
    pub fd_cntdn: u8,
    pub fd_error: u8,
    pub dsk_status: [u8; 7],
    /// 0x49: active video mode.
    pub vid_mode: u8,
    pub vid_cols: u16,
    pub vid_page_sz: u16,
    pub vid_page_start: u16,
    pub vid_xy: [u16; 8],
    pub vid_curs_shape: u16,
    pub vid_pg: u8,
    pub crtc: u16,
    pub vid_msr: u8,
    pub vid_pal: u8,
    /// 0x67: warm-boot resume vector.
    pub restart: u32,
    pub stray_irq: u8,
    /// 0x6C: timer tick count since midnight, plus the overflow flag.
    pub timer: u32,
    pub timer_ovf: u8,
    pub ctrlc: u8,
    pub reset_flag: u16,
    pub hd_error: u8,
    pub hd_cnt: u8,
    pub hd_ctl: u8,
    pub hd_port_off: u8,
    pub lpt1_cntdn: u8,
    pub lpt2_cntdn: u8,
    pub lpt3_cntdn: u8,
    pub int_0x4b_flags: u8,
    pub com1_cntdn: u8,
    pub com2_cntdn: u8,
    pub com3_cntdn: u8,
    pub com4_cntdn: u8,
    /// 0x80/0x82: keyboard ring bounds, offsets from 0x40:0.
    pub kb_buf_start: u16,
    pub kb_buf_end: u16,
    pub vid_rows_m1: u8,
    pub vid_chr_ht: u16,
    pub vid_ctl: u8,
    pub vid_sw: u8,
    _r1: [u8; 2],
    pub fd_ctl: u8,
    pub hd_ctlr_sta: u8,
    pub hd_ctlr_err: u8,
    pub hd_intr: u8,
    pub fd_ctl_info: u8,
    pub fd0_media: u8,
    pub fd1_media: u8,
    pub fd0_media_op: u8,
    pub fd1_media_op: u8,
    pub fd0_cyl: u8,
    pub fd1_cyl: u8,
    pub kb_stat3: u8,
    pub kb_stat2: u8,
    /// 0x98: far pointer to the RTC wait service's completion flag.
    pub p_wait_flag: u32,
    /// 0x9C: remaining wait interval in microseconds.
    pub wait_cntdn: u32,
    /// 0xA0: wait state, one of the `BDA_WAIT_*` values.
    pub wait_active: u8,
    _r2: [u8; 7],
    pub p_vid_save: u32,
}

const KB_BUF_OFF: u16 = 0x1E;
const KB_BUF_END_OFF: u16 = 0x3E;

/// Zero the BDA and populate the fields a freshly booted machine is
/// expected to carry. The EBDA gets its size byte (1 KiB) at the same
/// time.
pub fn init(base_kib: u32, ebda_seg: u16) {
    let base = (BDA_SEG as usize) << 4;
    unsafe {
        ptr::write_bytes(base as *mut u8, 0, 0x100);
        let bda = &mut *(base as *mut Bda);
        bda.com1 = 0x3F8;
        bda.ebda = ebda_seg;
        bda.eqpt = (Equip::VID_COLOR_80 | Equip::ONE_SERIAL).bits();
        bda.base_kib = base_kib as u16;
        bda.kb_buf_head = KB_BUF_OFF;
        bda.kb_buf_tail = KB_BUF_OFF;
        bda.kb_buf_start = KB_BUF_OFF;
        bda.kb_buf_end = KB_BUF_END_OFF;
        bda.vid_mode = 3;
        bda.vid_cols = 80;
        bda.vid_page_sz = 0x1000;
        bda.vid_rows_m1 = 24;
        bda.crtc = 0x3D4;
        bda.wait_active = BDA_WAIT_NONE;
        // first EBDA byte is its size in KiB
        ptr::write(((ebda_seg as usize) << 4) as *mut u8, 1);
    }
    info!("bda: {} KiB base, EBDA {:#06x}:0", base_kib, ebda_seg);
}
