// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Slow-step switch: pressing `s` during the banner window makes the
//! loader wait for a key at each later checkpoint.

use core::sync::atomic::{AtomicBool, Ordering};

use log::info;
use uefi::proto::console::text::Key;
use uefi::{boot, system};

static STEP: AtomicBool = AtomicBool::new(false);

const ARM_WINDOW_MS: usize = 2_000;
const POLL_SLICE_MS: usize = 50;

pub fn init() {
    info!(
        "press `s` within {}s to single-step the boot",
        ARM_WINDOW_MS / 1000
    );
    let mut left = ARM_WINDOW_MS;
    while left > 0 {
        if let Some(Key::Printable(c)) = read_key() {
            let c = char::from(c);
            if c == 's' || c == 'S' {
                STEP.store(true, Ordering::Relaxed);
                info!("slow-step armed, any key advances each checkpoint");
                return;
            }
        }
        boot::stall(POLL_SLICE_MS * 1_000);
        left -= POLL_SLICE_MS;
    }
}

pub fn pause(what: &str) {
    if !STEP.load(Ordering::Relaxed) {
        return;
    }
    info!("[step] next: {what} (press a key)");
    while read_key().is_none() {
        boot::stall(POLL_SLICE_MS * 1_000);
    }
}

fn read_key() -> Option<Key> {
    system::with_stdin(|stdin| stdin.read_key().ok().flatten())
}
