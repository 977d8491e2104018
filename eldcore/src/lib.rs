// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Hardware-independent core of the eldboot two-stage loader.
//!
//! Everything that can be reasoned about without firmware or raw hardware
//! lives here: the base-memory allocator, the boot-parameter list, the
//! firmware-map-to-E820 conversion, the ACPI table walk, the PCI config
//! space accessor and the USB legacy-ownership handshakes. Hardware access
//! goes through small traits (`PageClaimer`, `TableMapper`, `CfgSpace`,
//! `PortIo`, ...) so the whole crate unit-tests on the host.

#![cfg_attr(not(test), no_std)]

pub mod acpi;
pub mod bmem;
pub mod bparm;
pub mod cksum;
pub mod e820;
pub mod hw;
pub mod pci;
pub mod usb;

pub use bmem::{BmemError, BmemPool};
pub use bparm::BparmList;
pub use pci::Locn;
